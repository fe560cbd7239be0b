use thiserror::Error;

/// Top-level error type shared across the storage/trigger/worker boundary.
#[derive(Debug, Error)]
pub enum CronwebError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("job {0} already exists")]
    DuplicateJob(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("shot {0} not found")]
    ShotNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CronwebResult<T> = Result<T, CronwebError>;
