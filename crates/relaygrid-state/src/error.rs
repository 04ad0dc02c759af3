//! Error types for the relaygrid state store and job registry.

use relay_core::ConfigError;
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

pub type JobResult<T> = Result<T, JobError>;

/// Job registry contract violations and storage failures.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("job '{0}' already exists")]
    DuplicateName(String),

    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
