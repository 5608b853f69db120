//! Domain error model.

use thiserror::Error;

/// Result type used across the pure layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, parsing).
/// Infrastructure concerns belong in `offerdesk-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A quota period string could not be interpreted.
    #[error("invalid period: {0}")]
    InvalidPeriod(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_period(msg: impl Into<String>) -> Self {
        Self::InvalidPeriod(msg.into())
    }
}
