//! Error types for the ledgerflow pipeline

use std::any::Any;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Debug)]
pub enum LedgerError {

    // =============================
    // Authorization
    // =============================

    #[error("Authorization required: {0}")]
    AuthRequired(String),

    #[error("Authorization expired: {0}")]
    AuthExpired(String),

    /// Raw 401 from the accounting API. Consumed by the token manager,
    /// which turns it into a refresh or into `AuthExpired`.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // =============================
    // Data & transport
    // =============================

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    // =============================
    // Collaborators
    // =============================

    #[error("NLU oracle error: {0}")]
    Oracle(String),

    #[error("Data sink error: {0}")]
    Sink(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A task panicked; the payload message is kept for the logs
    #[error("Internal error: {0}")]
    Internal(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            LedgerError::TransientNetwork(e.to_string())
        } else if e.is_decode() {
            LedgerError::MalformedResponse(e.to_string())
        } else {
            LedgerError::HttpError(e)
        }
    }
}

impl LedgerError {
    /// Convert a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        LedgerError::Internal(message)
    }

    /// Retryable locally with bounded backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::TransientNetwork(_))
    }

    /// Errors that move a report fallback chain on to its next strategy
    /// instead of surfacing to the caller.
    pub fn advances_fallback(&self) -> bool {
        matches!(
            self,
            LedgerError::PermissionDenied(_)
                | LedgerError::MalformedResponse(_)
                | LedgerError::TransientNetwork(_)
                | LedgerError::NotFound(_)
        )
    }

    /// Short machine-readable name, used in diagnostics and audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::AuthRequired(_) => "auth_required",
            LedgerError::AuthExpired(_) => "auth_expired",
            LedgerError::Unauthorized(_) => "unauthorized",
            LedgerError::PermissionDenied(_) => "permission_denied",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::MalformedResponse(_) => "malformed_response",
            LedgerError::TransientNetwork(_) => "transient_network",
            LedgerError::ValidationError(_) => "validation_error",
            LedgerError::Oracle(_) => "oracle",
            LedgerError::Sink(_) => "sink",
            LedgerError::Configuration(_) => "configuration",
            LedgerError::Internal(_) => "internal",
            LedgerError::SerializationError(_) => "serialization",
            LedgerError::HttpError(_) => "http",
            LedgerError::IoError(_) => "io",
        }
    }

    /// Message shown to the end user. Never includes payload dumps.
    pub fn user_message(&self) -> String {
        match self {
            LedgerError::AuthRequired(_) => {
                "Not connected to the accounting service. Connect your account and try again."
                    .to_string()
            }
            LedgerError::AuthExpired(_) | LedgerError::Unauthorized(_) => {
                "Your accounting session has expired. Please reconnect and try again.".to_string()
            }
            LedgerError::PermissionDenied(_) => {
                "The connected account does not have permission for this request. Reconnect with admin credentials."
                    .to_string()
            }
            LedgerError::NotFound(what) => format!("Not found: {}", what),
            LedgerError::MalformedResponse(_) => {
                "The accounting service returned data in an unexpected format.".to_string()
            }
            LedgerError::TransientNetwork(_) | LedgerError::HttpError(_) => {
                "The accounting service is temporarily unreachable. Please retry shortly.".to_string()
            }
            LedgerError::ValidationError(msg) => format!("Invalid request: {}", msg),
            LedgerError::Oracle(_) => "The request could not be interpreted.".to_string(),
            LedgerError::Sink(msg) => format!("Could not update the sheet: {}", msg),
            LedgerError::Configuration(msg) => format!("Configuration problem: {}", msg),
            LedgerError::SerializationError(_)
            | LedgerError::IoError(_)
            | LedgerError::Internal(_) => {
                "An unexpected internal error occurred.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_policy() {
        assert!(LedgerError::PermissionDenied("scope".into()).advances_fallback());
        assert!(LedgerError::MalformedResponse("shape".into()).advances_fallback());
        assert!(!LedgerError::AuthExpired("refresh".into()).advances_fallback());
        assert!(LedgerError::TransientNetwork("timeout".into()).is_transient());
        assert!(!LedgerError::PermissionDenied("scope".into()).is_transient());
    }

    #[test]
    fn test_panic_payloads() {
        let err = LedgerError::from_panic(Box::new("index out of bounds"));
        assert!(matches!(&err, LedgerError::Internal(m) if m == "index out of bounds"));
        assert!(!err.user_message().contains("index"));

        let owned = LedgerError::from_panic(Box::new(String::from("boom")));
        assert_eq!(owned.kind(), "internal");
        assert!(matches!(LedgerError::from_panic(Box::new(7u8)), LedgerError::Internal(_)));
    }

    #[test]
    fn test_user_message_hides_detail() {
        let err = LedgerError::MalformedResponse("{\"secret\":1}".into());
        assert!(!err.user_message().contains("secret"));
        assert_eq!(err.kind(), "malformed_response");
    }
}
