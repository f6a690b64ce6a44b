//! Top-level error taxonomy for the orchestration core.
//!
//! Boundary errors (`DriverError`, `RepositoryError`, `StateMachineError`)
//! convert into [`OrchestrationError`] via `#[from]`, so public operations
//! surface a single error type while the async task bodies keep the finer
//! taxonomy for retry decisions.

use uuid::Uuid;

/// Errors surfaced by the public orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// Bad input, returned synchronously, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Deployment {0} not found")]
    NotFound(Uuid),

    /// A mutating operation is already in flight for this deployment id.
    #[error("Operation already in flight for deployment {0}")]
    OperationInFlight(Uuid),

    #[error("Executor queue is full ({capacity} tasks outstanding)")]
    QueueFull { capacity: usize },

    #[error("Executor is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Repository(#[from] crate::repository::RepositoryError),

    #[error(transparent)]
    Driver(#[from] crate::driver::DriverError),

    #[error(transparent)]
    StateMachine(#[from] crate::state_machine::StateMachineError),
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
