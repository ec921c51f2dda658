//! API error types.

use crate::engine::EngineError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pinfold_metadata::MetadataError;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("core error: {0}")]
    Core(#[from] pinfold_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Internal(_) => "internal_error",
            Self::Engine(e) if e.is_not_found() => "not_found",
            Self::Engine(e) if e.is_already_hosted() => "already_hosted",
            Self::Engine(EngineError::OutOfSpace { .. }) => "out_of_space",
            Self::Engine(EngineError::Core(_)) => "core_error",
            Self::Engine(_) => "engine_error",
            Self::Metadata(MetadataError::AlreadyExists(_)) => "conflict",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "core_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Engine(e) => match e {
                e if e.is_not_found() => StatusCode::NOT_FOUND,
                e if e.is_already_hosted() => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::OutOfSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
                EngineError::Core(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
                MetadataError::AlreadyHosted { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() && status != StatusCode::INSUFFICIENT_STORAGE {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let missing = ApiError::from(EngineError::VaultNotFound("ab".into()));
        assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(missing.code(), "not_found");

        let hosted = ApiError::from(EngineError::Metadata(MetadataError::AlreadyHosted {
            key: "ab".into(),
        }));
        assert_eq!(hosted.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(hosted.code(), "already_hosted");

        let full = ApiError::from(EngineError::OutOfSpace {
            user_id: "u1".into(),
        });
        assert_eq!(full.status_code(), StatusCode::INSUFFICIENT_STORAGE);

        let task = ApiError::from(EngineError::Task("gone".into()));
        assert_eq!(task.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn duplicate_user_is_a_conflict() {
        let err = ApiError::from(MetadataError::AlreadyExists("user".into()));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "conflict");
    }
}
