//! Response envelope and error translation.
//!
//! Every operation answers with a `response_code`, a human-readable
//! message safe to show an operator, and an optional result payload.
//! Core errors are translated here; stack traces never cross the wire.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use stratus_scheduler::SchedulerError;
use stratus_state::{LockError, StateError};
use stratus_storage::{RecoveryError, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseCode {
    Ok,
    InvalidRequest,
    AuthFailed,
    Error,
    Warning,
}

#[derive(Debug, Serialize, serde::Deserialize)]
pub struct ApiResponse<T = serde_json::Value> {
    pub response_code: ResponseCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, result: T) -> Self {
        Self {
            response_code: ResponseCode::Ok,
            message: message.into(),
            result: Some(result),
        }
    }
}

impl ApiResponse<serde_json::Value> {
    pub fn ok_empty(message: impl Into<String>) -> Self {
        Self {
            response_code: ResponseCode::Ok,
            message: message.into(),
            result: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            response_code: ResponseCode::InvalidRequest,
            message: message.into(),
            result: None,
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self {
            response_code: ResponseCode::AuthFailed,
            message: message.into(),
            result: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            response_code: ResponseCode::Error,
            message: message.into(),
            result: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            response_code: ResponseCode::Warning,
            message: message.into(),
            result: None,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = match self.response_code {
            ResponseCode::Ok | ResponseCode::Warning => StatusCode::OK,
            ResponseCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ResponseCode::AuthFailed => StatusCode::UNAUTHORIZED,
            ResponseCode::Error => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

/// Umbrella over every core error an operation can surface.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    AuthFailed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl ApiError {
    fn code(&self) -> ResponseCode {
        match self {
            ApiError::Invalid(_) => ResponseCode::InvalidRequest,
            ApiError::AuthFailed(_) => ResponseCode::AuthFailed,
            ApiError::Timeout(_) => ResponseCode::Error,

            // A mismatched or missing lock token is a malformed request
            // from the caller's point of view.
            ApiError::Lock(_) => ResponseCode::InvalidRequest,

            ApiError::State(StateError::Storage(_)) => ResponseCode::Error,
            ApiError::State(_) => ResponseCode::InvalidRequest,

            ApiError::Scheduler(SchedulerError::QuotaExceeded { .. }) => {
                ResponseCode::InvalidRequest
            }
            ApiError::Scheduler(SchedulerError::TaskNotFound(_)) => ResponseCode::InvalidRequest,
            ApiError::Scheduler(_) => ResponseCode::Error,

            ApiError::Recovery(RecoveryError::BackupNotFound(_))
            | ApiError::Recovery(RecoveryError::NoStagedRecovery)
            | ApiError::Recovery(RecoveryError::AlreadyStaged(_)) => {
                ResponseCode::InvalidRequest
            }
            ApiError::Recovery(_) => ResponseCode::Error,

            ApiError::Storage(_) => ResponseCode::Error,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let response = ApiResponse::<serde_json::Value> {
            response_code: self.code(),
            message: self.to_string(),
            result: None,
        };
        response.into_response()
    }
}

/// Handlers return this; errors are translated uniformly.
pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_errors_map_to_invalid_request() {
        let err = ApiError::Lock(LockError::NotLocked("r/e/j".to_string()));
        assert_eq!(err.code(), ResponseCode::InvalidRequest);
    }

    #[test]
    fn storage_errors_map_to_error() {
        let err = ApiError::Storage(StorageError::Open("boom".to_string()));
        assert_eq!(err.code(), ResponseCode::Error);
    }

    #[test]
    fn quota_exhaustion_is_an_invalid_request() {
        let err = ApiError::Scheduler(SchedulerError::QuotaExceeded {
            role: "r".to_string(),
            requested: "cpu=1".to_string(),
            available: "cpu=0".to_string(),
        });
        assert_eq!(err.code(), ResponseCode::InvalidRequest);
    }

    #[test]
    fn codes_serialize_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&ResponseCode::InvalidRequest).unwrap(),
            "\"INVALID_REQUEST\""
        );
    }
}
