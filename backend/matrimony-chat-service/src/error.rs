use crate::middleware::error_handling;
use crate::models::Feature;
use crate::store::StoreError;
use actix_web::{HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use thiserror::Error;

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("missing bearer token")]
    MissingToken,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("conversation not found")]
    NotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal server error")]
    Internal,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("quota exceeded for {feature} until {reset_at}")]
    QuotaExceeded {
        feature: Feature,
        reset_at: DateTime<Utc>,
    },

    #[error("user is not a participant of this conversation")]
    NotParticipant,

    #[error("interaction between these users is blocked")]
    Blocked,

    #[error("store temporarily unavailable, try again: {0}")]
    TransientStore(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(msg) => AppError::TransientStore(msg),
            StoreError::NotFound => AppError::NotFound,
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            StoreError::Backend(msg) => AppError::Database(msg),
        }
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::from(e).into()
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::TransientStore(e.to_string())
    }
}

impl From<resilience::RetryError<StoreError>> for AppError {
    fn from(e: resilience::RetryError<StoreError>) -> Self {
        match e {
            resilience::RetryError::TimedOut(after) => {
                AppError::TransientStore(format!("timed out after {after:?}"))
            }
            other => other.into_inner().map(AppError::from).unwrap_or(AppError::Internal),
        }
    }
}

impl AppError {
    /// Returns whether a client may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransientStore(_) | AppError::ServiceUnavailable(_)
        )
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::MissingToken | AppError::Unauthorized => 401,
            AppError::Forbidden | AppError::NotParticipant | AppError::Blocked => 403,
            AppError::NotFound | AppError::MessageNotFound => 404,
            AppError::Conflict(_) => 409,
            AppError::QuotaExceeded { .. } => 429,
            AppError::ServiceUnavailable(_) | AppError::TransientStore(_) => 503,
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Database(_)
            | AppError::Internal => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_is_429_and_final() {
        let err = AppError::QuotaExceeded {
            feature: Feature::MessageSent,
            reset_at: Utc::now(),
        };
        assert_eq!(err.status_code(), 429);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transient_store_maps_to_503() {
        let err: AppError = StoreError::Transient("connection reset".into()).into();
        assert_eq!(err.status_code(), 503);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_exhausted_retry_surfaces_last_store_error() {
        let err: AppError = resilience::RetryError::Exhausted {
            attempts: 3,
            last: StoreError::Transient("pool timed out".into()),
        }
        .into();
        assert!(matches!(err, AppError::TransientStore(msg) if msg == "pool timed out"));

        let err: AppError = resilience::RetryError::Permanent(StoreError::NotFound).into();
        assert!(matches!(err, AppError::NotFound));
    }

    #[test]
    fn test_participation_errors_are_forbidden() {
        assert_eq!(AppError::NotParticipant.status_code(), 403);
        assert_eq!(AppError::Blocked.status_code(), 403);
    }
}
