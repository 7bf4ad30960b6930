//! Schedule error types.

use thiserror::Error;
use uuid::Uuid;

use flowplane_queue::QueueError;
use flowplane_state::{ErrorKind, StateError};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(Uuid),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type ScheduleResult<T> = Result<T, ScheduleError>;

impl ScheduleError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ScheduleError::InvalidCron { .. }
            | ScheduleError::UnknownTimezone(_)
            | ScheduleError::InvalidInterval(_) => Some(ErrorKind::ConfigurationError),
            ScheduleError::Queue(e) => e.kind(),
            ScheduleError::State(e) => e.kind(),
            _ => None,
        }
    }
}
