//! Data layer for the orchestration core.
//!
//! [`deployment`] holds the persisted `Deployment` row plus its request and
//! filter types; [`event`] holds the ephemeral `DeploymentEvent` fanned out
//! by the status publisher.

pub mod deployment;
pub mod event;

pub use deployment::{
    validate_replica_count, Deployment, DeploymentFilter, DeploymentUpdate, Environment,
    NewDeployment, REPLICA_MAX, REPLICA_MIN,
};
pub use event::DeploymentEvent;
