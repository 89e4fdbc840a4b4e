use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::{dao::storage::StorageError, services::click_service::ClickError};

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// A click was rejected or could not be recorded.
    #[error(transparent)]
    Click(#[from] ClickError),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Unavailable(err)
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {}", err))
    }
}

/// Application-level errors that are converted to HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad request with invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Conflict with current state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The resource is temporarily locked by another writer.
    #[error("locked: {0}")]
    Locked(String),
    /// The caller must wait before retrying.
    #[error("too many requests: {message}")]
    TooManyRequests {
        /// Human readable reason.
        message: String,
        /// Seconds until a retry may succeed.
        retry_after_secs: u64,
    },
    /// Service unavailable or degraded.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(source) if source.is_transient() => {
                AppError::ServiceUnavailable(source.to_string())
            }
            ServiceError::Unavailable(source) => AppError::Internal(source.to_string()),
            ServiceError::InvalidState(message) => AppError::Conflict(message),
            ServiceError::NotFound(message) => AppError::NotFound(message),
            ServiceError::Click(err) => err.into(),
        }
    }
}

impl From<ClickError> for AppError {
    fn from(err: ClickError) -> Self {
        let message = err.to_string();
        match err {
            ClickError::GameNotFound(_) => AppError::NotFound(message),
            ClickError::GameEnded(_) | ClickError::ConsecutiveClick => AppError::Conflict(message),
            ClickError::OnCooldown { remaining } => AppError::TooManyRequests {
                message,
                retry_after_secs: remaining.as_secs_f64().ceil() as u64,
            },
            ClickError::Busy => AppError::Locked(message),
            ClickError::Store(source) if !source.is_transient() => AppError::Internal(message),
            ClickError::ExpiryUnconfirmed(_)
            | ClickError::NotPersisted(_)
            | ClickError::Store(_) => AppError::ServiceUnavailable(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Locked(_) => StatusCode::LOCKED,
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after = match &self {
            AppError::TooManyRequests {
                retry_after_secs, ..
            } => Some(retry_after_secs.to_string()),
            _ => None,
        };

        let payload = Json(ErrorBody {
            message: self.to_string(),
        });

        match retry_after {
            Some(secs) => (status, [(axum::http::header::RETRY_AFTER, secs)], payload).into_response(),
            None => (status, payload).into_response(),
        }
    }
}
