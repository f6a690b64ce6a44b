//! Ephemeral deployment event, one per persisted transition.

use crate::models::Deployment;
use crate::state_machine::{DeploymentStatus, HealthState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Snapshot emitted by the status publisher after every persisted
/// state/health transition. Not persisted; consumed by the external
/// WebSocket layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub deployment_id: Uuid,
    pub status: DeploymentStatus,
    pub health: HealthState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl DeploymentEvent {
    /// Build an event from the just-persisted deployment row.
    pub fn from_deployment(deployment: &Deployment, message: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment.id,
            status: deployment.status,
            health: deployment.health,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
