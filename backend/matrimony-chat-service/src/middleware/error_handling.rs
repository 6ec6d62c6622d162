use crate::error::AppError;
use actix_web::http::{header, StatusCode};
use actix_web::HttpResponse;
use error_types::{error_codes, error_types as kinds, ErrorResponse};

/// Map domain errors to the uniform error body
pub fn map_error(err: &AppError) -> (StatusCode, ErrorResponse) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (error_type, code) = match err {
        AppError::BadRequest(_) => (kinds::VALIDATION_ERROR, error_codes::INVALID_REQUEST),
        AppError::MissingToken => (kinds::AUTHENTICATION_ERROR, error_codes::TOKEN_MISSING),
        AppError::Unauthorized => (kinds::AUTHENTICATION_ERROR, error_codes::TOKEN_INVALID),
        AppError::Forbidden => (kinds::AUTHORIZATION_ERROR, error_codes::AUTHORIZATION_ERROR),
        AppError::NotParticipant => (
            kinds::AUTHORIZATION_ERROR,
            error_codes::NOT_CONVERSATION_PARTICIPANT,
        ),
        AppError::Blocked => (kinds::AUTHORIZATION_ERROR, error_codes::INTERACTION_BLOCKED),
        AppError::NotFound => (kinds::NOT_FOUND_ERROR, error_codes::CONVERSATION_NOT_FOUND),
        AppError::MessageNotFound => (kinds::NOT_FOUND_ERROR, error_codes::MESSAGE_NOT_FOUND),
        AppError::Conflict(_) => (kinds::CONFLICT_ERROR, error_codes::INVALID_REQUEST),
        AppError::QuotaExceeded { .. } => (kinds::RATE_LIMIT_ERROR, error_codes::QUOTA_EXCEEDED),
        AppError::ServiceUnavailable(_) | AppError::TransientStore(_) => (
            kinds::SERVICE_UNAVAILABLE_ERROR,
            error_codes::SERVICE_UNAVAILABLE,
        ),
        AppError::Database(_) => (kinds::SERVER_ERROR, error_codes::DATABASE_ERROR),
        AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
            (kinds::SERVER_ERROR, error_codes::INTERNAL_SERVER_ERROR)
        }
    };

    // Internal details stay in the logs
    let message = match err {
        AppError::Database(_) | AppError::Config(_) | AppError::StartServer(_) => {
            tracing::error!(error = %err, "request failed with server error");
            "internal server error".to_string()
        }
        _ => err.to_string(),
    };

    let mut response = ErrorResponse::new(
        status.canonical_reason().unwrap_or("Error"),
        &message,
        status.as_u16(),
        error_type,
        code,
    );
    if let AppError::QuotaExceeded { reset_at, feature } = err {
        response = response
            .with_reset_at(*reset_at)
            .with_details(format!("feature={feature}"));
    }

    (status, response)
}

pub fn into_response(err: &AppError) -> HttpResponse {
    let (status, body) = map_error(err);
    let mut builder = HttpResponse::build(status);

    match err {
        AppError::QuotaExceeded { reset_at, .. } => {
            let wait = (*reset_at - chrono::Utc::now()).num_seconds().max(1);
            builder.insert_header((header::RETRY_AFTER, wait.to_string()));
        }
        AppError::TransientStore(_) | AppError::ServiceUnavailable(_) => {
            builder.insert_header((header::RETRY_AFTER, "1"));
        }
        _ => {}
    }

    builder.json(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Feature;

    #[test]
    fn test_quota_error_carries_reset_at() {
        let reset_at = chrono::Utc::now() + chrono::Duration::hours(3);
        let (status, body) = map_error(&AppError::QuotaExceeded {
            feature: Feature::MessageSent,
            reset_at,
        });

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.code, error_codes::QUOTA_EXCEEDED);
        assert_eq!(body.reset_at, Some(reset_at.to_rfc3339()));
    }

    #[test]
    fn test_database_details_are_not_leaked() {
        let (status, body) = map_error(&AppError::Database("relation \"x\" does not exist".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, "internal server error");
    }

    #[test]
    fn test_not_found_codes_name_the_missing_resource() {
        let (status, body) = map_error(&AppError::MessageNotFound);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, error_codes::MESSAGE_NOT_FOUND);

        let (_, body) = map_error(&AppError::NotFound);
        assert_eq!(body.code, error_codes::CONVERSATION_NOT_FOUND);
    }

    #[test]
    fn test_missing_and_invalid_tokens_are_distinguished() {
        let (status, body) = map_error(&AppError::MissingToken);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code, error_codes::TOKEN_MISSING);

        let (_, body) = map_error(&AppError::Unauthorized);
        assert_eq!(body.code, error_codes::TOKEN_INVALID);
    }

    #[test]
    fn test_transient_store_sets_retry_after() {
        let response = into_response(&AppError::TransientStore("pool timeout".into()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }
}
