use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::response::{ApiResponse, Empty};

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    /// Version check or uniqueness constraint failed; the caller should re-read and retry.
    #[error("conflict")]
    Conflict,

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            sqlx::Error::ColumnDecode { source, .. } => StoreError::Serialization(source.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Every failure the engine can report to a caller.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("missing or invalid caller identity")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidQuestion(String),

    #[error("attempt limit reached ({max} completed attempts allowed)")]
    AttemptLimit { max: u32 },

    #[error("quiz is not available")]
    QuizUnavailable,

    #[error("concurrent update conflict on {0}; retries exhausted")]
    Consistency(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("collaborator error: {0}")]
    Upstream(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        AppError::NotFound(what.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidState(_) | AppError::InvalidQuestion(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) | AppError::Storage(StoreError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) | AppError::AttemptLimit { .. } | AppError::QuizUnavailable => {
                StatusCode::FORBIDDEN
            }
            AppError::Consistency(_) | AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// True for write races the service layer may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Storage(StoreError::Conflict))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }
        (status, Json(ApiResponse::<Empty>::error(self.to_string()))).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        assert_eq!(AppError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::InvalidState("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::not_found("quiz").status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::AttemptLimit { max: 2 }.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::Consistency("gradebook".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::Storage(StoreError::NotFound).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn only_store_conflicts_are_retryable() {
        assert!(AppError::Storage(StoreError::Conflict).is_conflict());
        assert!(!AppError::Consistency("x".into()).is_conflict());
        assert!(!AppError::Storage(StoreError::Backend("down".into())).is_conflict());
    }
}
