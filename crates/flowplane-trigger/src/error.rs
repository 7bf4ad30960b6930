//! Trigger binder error types.

use thiserror::Error;

use flowplane_queue::QueueError;
use flowplane_state::{ErrorKind, StateError};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type TriggerResult<T> = Result<T, TriggerError>;

impl TriggerError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            TriggerError::InvalidEvent(_) => Some(ErrorKind::ConfigurationError),
            TriggerError::Queue(e) => e.kind(),
            TriggerError::State(e) => e.kind(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            TriggerError::State(e) | TriggerError::Queue(QueueError::State(e)) => e.is_transient(),
            _ => false,
        }
    }
}
