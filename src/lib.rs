//! cronweb: a single-node, persistent cron-style shell job runner.

pub mod config;
pub mod controller;
pub mod http;

pub use config::Config;
pub use controller::Controller;
