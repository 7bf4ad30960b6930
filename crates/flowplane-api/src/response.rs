//! Response envelope and error mapping.
//!
//! Every endpoint answers with `{ "success": bool, "data"?: .., "error"?: .., "kind"?: .. }`.
//! Domain errors carry their [`ErrorKind`] so clients can tell a rejected
//! configuration from an infrastructure failure without parsing messages.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use flowplane_queue::QueueError;
use flowplane_schedule::ScheduleError;
use flowplane_state::{ErrorKind, StateError};
use flowplane_tracker::TrackerError;
use flowplane_trigger::TriggerError;

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        })
    }
}

/// An error on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub kind: Option<ErrorKind>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// A request that names or carries invalid configuration.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            kind: Some(ErrorKind::ConfigurationError),
            ..Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
        }
    }

    fn classified(kind: Option<ErrorKind>, message: String) -> Self {
        let status = match kind {
            Some(ErrorKind::ConfigurationError) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message,
            kind,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(self.message),
                kind: self.kind,
            }),
        )
            .into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match &e {
            StateError::NotFound(_) => Self::not_found(e.to_string()),
            StateError::Conflict(_) => Self {
                kind: e.kind(),
                ..Self::new(StatusCode::CONFLICT, e.to_string())
            },
            StateError::InvalidTransition { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            _ => Self::classified(e.kind(), e.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::DeploymentNotFound(_) | QueueError::PoolNotFound(_) | QueueError::QueueNotFound(_) => {
                Self::not_found(e.to_string())
            }
            QueueError::State(inner) => inner.into(),
            other => Self::classified(other.kind(), other.to_string()),
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::ScheduleNotFound(_) | ScheduleError::DeploymentNotFound(_) => {
                Self::not_found(e.to_string())
            }
            ScheduleError::Queue(inner) => inner.into(),
            ScheduleError::State(inner) => inner.into(),
            other => Self::classified(other.kind(), other.to_string()),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::RunNotFound(_) | TrackerError::DeploymentNotFound(_) => Self::not_found(e.to_string()),
            TrackerError::NotRunning { .. } => Self::new(StatusCode::CONFLICT, e.to_string()),
            TrackerError::State(inner) => inner.into(),
            other => Self::classified(other.kind(), other.to_string()),
        }
    }
}

impl From<TriggerError> for ApiError {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::Queue(inner) => inner.into(),
            TriggerError::State(inner) => inner.into(),
            other => Self::classified(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_error_kind() {
        let missing: ApiError = StateError::NotFound("flow run x".to_string()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let conflict: ApiError = StateError::Conflict("name taken".to_string()).into();
        assert_eq!(conflict.status, StatusCode::CONFLICT);
        assert_eq!(conflict.kind, Some(ErrorKind::ConfigurationError));

        let io: ApiError = StateError::Write("disk full".to_string()).into();
        assert_eq!(io.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(io.kind, None);

        let bad_cron: ApiError = ScheduleError::InvalidCron {
            expression: "61 * * * *".to_string(),
            reason: "minute out of range".to_string(),
        }
        .into();
        assert_eq!(bad_cron.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(bad_cron.kind, Some(ErrorKind::ConfigurationError));

        let not_running: ApiError = TrackerError::NotRunning {
            run_id: uuid::Uuid::nil(),
            state: flowplane_state::RunState::Completed,
        }
        .into();
        assert_eq!(not_running.status, StatusCode::CONFLICT);
    }
}
