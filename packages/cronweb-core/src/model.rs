use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CronwebError;

/// Lifecycle state of a single shot. Transitions exactly once, away from `Running`,
/// to one of the four terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Done,
    Error,
    Killed,
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Error => "ERROR",
            JobState::Killed => "KILLED",
            JobState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = CronwebError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(JobState::Running),
            "DONE" => Ok(JobState::Done),
            "ERROR" => Ok(JobState::Error),
            "KILLED" => Ok(JobState::Killed),
            "UNKNOWN" => Ok(JobState::Unknown),
            other => Err(CronwebError::Storage(
                format!("unrecognized job state {other:?}").into(),
            )),
        }
    }
}

/// Distinguishes why a shot was fired, carried through to the webhook payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Schedule,
    Manual,
    Retry,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Schedule => "SCHEDULE",
            JobType::Manual => "MANUAL",
            JobType::Retry => "RETRY",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled command, persisted in `Storage` and mirrored by `Trigger` while active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: String,
    pub cron_exp: String,
    pub command: String,
    pub param: Option<String>,
    pub name: String,
    pub date_create: String,
    pub date_update: String,
    pub active: bool,
}

/// One execution attempt of a `Job`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shot {
    pub shot_id: String,
    pub uuid: String,
    pub state: JobState,
    pub log_path: String,
    pub date_start: String,
    pub date_end: Option<String>,
    pub deleted: bool,
}
