//! Dispatch error types.

use thiserror::Error;

use flowplane_queue::QueueError;
use flowplane_state::{ErrorKind, StateError};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Pull steps, job template or overrides are unusable. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The backend refused or failed to accept a job.
    #[error("submission failed: {0}")]
    Submission(String),

    /// A poll or cancel call against the backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("no execution backend registered for kind {0:?}")]
    UnknownBackend(String),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            DispatchError::Configuration(_) | DispatchError::UnknownBackend(_) => {
                Some(ErrorKind::ConfigurationError)
            }
            DispatchError::Submission(_) => Some(ErrorKind::SubmissionError),
            DispatchError::Queue(e) => e.kind(),
            DispatchError::State(e) => e.kind(),
            DispatchError::Backend(_) => None,
        }
    }
}
