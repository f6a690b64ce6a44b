use crate::repository::RepositoryError;

/// Errors raised by the deployment state machine.
#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    /// The (current state, event) pair is not in the transition table.
    #[error("Invalid transition from '{from}' on event '{event}'")]
    InvalidTransition { from: String, event: String },

    /// Persisting the transition failed (including stale-version races).
    #[error("Persistence failed: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("Internal state machine error: {0}")]
    Internal(String),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
