//! Error types for the token gate.

use thiserror::Error;

/// Main error type for token gate operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration-related errors. Raised at construction, never per request.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit named a unit outside `ns|ms|s|m|h|d|w`.
    #[error("Unknown unit specified for rate limit: {0}")]
    InvalidRateUnit(String),

    /// A rate limit resolved to less than one millisecond.
    #[error("Invalid rate limit value: {0}")]
    InvalidRateValue(String),

    /// The expiration could not be interpreted as an instant.
    #[error("Unparseable expiration: {0}")]
    UnparseableExpiration(String),

    /// The expiration is not strictly in the future.
    #[error("Expiration must lie in the future, got {0} (epoch millis)")]
    ExpiredOrInvalidExpiration(i64),

    /// The token could not be decoded. Deliberately carries no detail.
    #[error("Unable to decode token")]
    DecodeFailure,

    /// The principal's queue backlog exceeds the configured wait budget.
    #[error("Rate limit exceeded for {id}: estimated wait {wait_ms}ms exceeds {budget_ms}ms")]
    AdmissionRejected {
        id: String,
        wait_ms: u64,
        budget_ms: u64,
    },

    /// A path restriction is not a valid regular expression.
    #[error("Invalid path pattern: {0}")]
    InvalidPathPattern(#[from] regex::Error),

    /// AES-256-GCM refused to seal the payload.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Token payload serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Deflate stage failures while sealing a token
    #[error("Compression error: {0}")]
    Compression(std::io::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for token gate operations.
pub type Result<T> = std::result::Result<T, GuardError>;
