//! Shared data model, error types, and id/time helpers used by every cronweb package.

pub mod error;
pub mod ids;
pub mod model;
pub mod time;

pub use error::CronwebError;
pub use model::{Job, JobState, JobType, Shot};
