//! Error types for the forwarding path.

use thiserror::Error;

/// The source channel could not be read.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("source returned HTTP {0}")]
    Status(u16),

    #[error("failed to initialize source client: {0}")]
    Init(String),
}

/// A webhook call failed before any HTTP response arrived.
///
/// Responses with error statuses are not errors at this level; the
/// worker classifies them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery timed out: {0}")]
    Timeout(String),

    #[error("delivery failed: {0}")]
    Network(String),

    #[error("invalid webhook url: {0}")]
    InvalidUrl(String),
}

impl DeliveryError {
    /// Whether retrying the same request can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, DeliveryError::InvalidUrl(_))
    }
}
