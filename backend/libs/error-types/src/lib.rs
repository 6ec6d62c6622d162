//! Uniform JSON error body shared by the chat services.
//!
//! Every HTTP failure is rendered as an [`ErrorResponse`]; clients route on
//! `error_type` and localize on `code`.

use serde::{Deserialize, Serialize};

/// API error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short HTTP reason phrase ("Not Found", "Too Many Requests", ...)
    pub error: String,

    /// Human readable message
    pub message: String,

    /// HTTP status code
    pub status: u16,

    /// Error category, one of [`error_types`]
    pub error_type: String,

    /// Stable machine code, one of [`error_codes`]
    pub code: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// When a quota denial lifts (RFC 3339)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<String>,

    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, status: u16, error_type: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            status,
            error_type: error_type.to_string(),
            code: code.to_string(),
            details: None,
            reset_at: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_reset_at(mut self, reset_at: chrono::DateTime<chrono::Utc>) -> Self {
        self.reset_at = Some(reset_at.to_rfc3339());
        self
    }
}

pub mod error_codes {
    // Authentication
    pub const TOKEN_INVALID: &str = "TOKEN_INVALID";
    pub const TOKEN_MISSING: &str = "TOKEN_MISSING";

    // Messaging
    pub const CONVERSATION_NOT_FOUND: &str = "CONVERSATION_NOT_FOUND";
    pub const MESSAGE_NOT_FOUND: &str = "MESSAGE_NOT_FOUND";
    pub const NOT_CONVERSATION_PARTICIPANT: &str = "NOT_CONVERSATION_PARTICIPANT";
    pub const INTERACTION_BLOCKED: &str = "INTERACTION_BLOCKED";

    // Quota
    pub const QUOTA_EXCEEDED: &str = "QUOTA_EXCEEDED";

    // Validation
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

    // Database/System
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const AUTHORIZATION_ERROR: &str = "AUTHORIZATION_ERROR";
}

pub mod error_types {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    pub const AUTHORIZATION_ERROR: &str = "authorization_error";
    pub const NOT_FOUND_ERROR: &str = "not_found_error";
    pub const CONFLICT_ERROR: &str = "conflict_error";
    pub const RATE_LIMIT_ERROR: &str = "rate_limit_error";
    pub const SERVER_ERROR: &str = "server_error";
    pub const SERVICE_UNAVAILABLE_ERROR: &str = "service_unavailable_error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_creation() {
        let error = ErrorResponse::new(
            "Not Found",
            "message not found",
            404,
            error_types::NOT_FOUND_ERROR,
            error_codes::MESSAGE_NOT_FOUND,
        );

        assert_eq!(error.status, 404);
        assert_eq!(error.error_type, error_types::NOT_FOUND_ERROR);
        assert_eq!(error.code, error_codes::MESSAGE_NOT_FOUND);
        assert!(error.reset_at.is_none());
    }

    #[test]
    fn test_reset_at_is_serialized_only_when_present() {
        let plain = ErrorResponse::new(
            "Forbidden",
            "blocked",
            403,
            error_types::AUTHORIZATION_ERROR,
            error_codes::INTERACTION_BLOCKED,
        );
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("reset_at").is_none());

        let reset = chrono::DateTime::parse_from_rfc3339("2026-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let quota = ErrorResponse::new(
            "Too Many Requests",
            "quota exceeded",
            429,
            error_types::RATE_LIMIT_ERROR,
            error_codes::QUOTA_EXCEEDED,
        )
        .with_reset_at(reset);
        let json = serde_json::to_value(&quota).unwrap();
        assert_eq!(json["reset_at"], "2026-01-02T00:00:00+00:00");
    }
}
