//! Durable storage for cronweb: a `jobs` + `job_logs` SQLite schema behind a
//! small bounded connection pool.

pub mod pool;
pub mod store;

pub use pool::Pool;
pub use store::Storage;
