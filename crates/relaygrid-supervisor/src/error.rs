//! Supervisor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("job registry error: {0}")]
    Job(#[from] relaygrid_state::JobError),

    #[error("state store error: {0}")]
    State(#[from] relaygrid_state::StateError),

    #[error("supervisor event loop already running")]
    AlreadyRunning,
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
