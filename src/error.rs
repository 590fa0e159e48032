//! Error taxonomy for the ingestion pipeline.
//!
//! | Error | Handling |
//! |-------|----------|
//! | [`ServiceError::Transient`] | retried with backoff by the calling stage |
//! | [`ServiceError::Permanent`] | no retry; the attempt moves to `Failed` |
//! | [`CoercionError`] | contained in the normalizer; the field degrades to confidence 0 |
//! | [`PipelineError::ConcurrencyConflict`] | another holder owns the claim; the caller backs off |
//!
//! Validation findings are not errors; see [`crate::models::ValidationResult`].

use thiserror::Error;

/// Failure reported by an external collaborator (extraction, embedding, summarization).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Timeouts, rate limits, unavailable upstreams.
    #[error("transient service error: {0}")]
    Transient(String),

    /// Unsupported or malformed input. Retrying cannot succeed.
    #[error("permanent service error ({code}): {message}")]
    Permanent { code: String, message: String },
}

impl ServiceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify a reason code returned by a service.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        match code {
            "service_unavailable" | "timeout" | "rate_limited" | "overloaded" => {
                Self::Transient(format!("{}: {}", code, message.into()))
            }
            _ => Self::permanent(code, message),
        }
    }

    /// Classify an HTTP status: 429 and 5xx are transient, other 4xx permanent.
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 429 || status >= 500 {
            Self::Transient(format!("HTTP {}: {}", status, body))
        } else {
            Self::permanent(format!("http_{}", status), body.to_string())
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::permanent("malformed_response", err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

/// A raw value that could not be coerced into its typed field.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoercionError {
    #[error("not a currency amount: {0:?}")]
    Amount(String),

    #[error("not a date: {0:?}")]
    Date(String),

    #[error("not a number: {0:?}")]
    Number(String),

    #[error("empty value")]
    Empty,
}

/// Errors surfaced by the orchestrator and persistence gateway.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The per-document claim is held by someone else, or was lost mid-stage.
    #[error("claim for document {document_id} is held by another worker")]
    ConcurrencyConflict { document_id: String },

    /// The stored state moved underneath a compare-and-set transition.
    #[error("document {document_id} is in state {actual}, expected {expected}")]
    StaleState {
        document_id: String,
        expected: String,
        actual: String,
    },

    #[error("document not found: {0}")]
    NotFound(String),

    /// A persisted row could not be decoded (unknown enum label, corrupt JSON).
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ServiceError::from_status(429, "slow down").is_transient());
        assert!(ServiceError::from_status(503, "").is_transient());
        assert!(!ServiceError::from_status(415, "pdf only").is_transient());
    }

    #[test]
    fn test_code_classification() {
        assert!(ServiceError::from_code("timeout", "x").is_transient());
        assert!(ServiceError::from_code("rate_limited", "x").is_transient());
        assert_eq!(
            ServiceError::from_code("unsupported_format", "tiff"),
            ServiceError::permanent("unsupported_format", "tiff")
        );
    }
}
