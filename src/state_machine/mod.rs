// State machine module for deployment lifecycle management
//
// Owns the deployment's state transitions: a pure transition table, guard
// checks, versioned persistence through the repository, and event fan-out
// after every persisted transition.

pub mod errors;
pub mod events;
pub mod machine;
pub mod states;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::LifecycleEvent;
pub use machine::DeploymentStateMachine;
pub use states::{DeploymentStatus, HealthState};
