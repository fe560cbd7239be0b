//! Subprocess execution, log streaming, retry/kill bookkeeping, and hook/webhook
//! dispatch for cronweb shots.

pub mod hooks;
pub mod log_sink;
pub mod webhook;
pub mod worker;

pub use hooks::{HookEvent, HookHost, HookRegistry};
pub use log_sink::{LogItem, LogQueue, LogSink};
pub use webhook::{WebhookConfig, WebhookPayload};
pub use worker::{Worker, WorkerConfig};
