use super::{
    errors::{StateMachineError, StateMachineResult},
    events::LifecycleEvent,
    states::{DeploymentStatus, HealthState},
};
use crate::events::StatusPublisher;
use crate::models::Deployment;
use crate::repository::DeploymentRepository;
use std::sync::Arc;
use tracing::info;

/// Deployment state machine: pure transition table, versioned persistence,
/// event fan-out after every persisted transition.
///
/// Holds no per-deployment state of its own; callers must hold the
/// per-deployment lease for any transition-causing call. The optimistic
/// `version` check in the repository is the backstop against a stale writer
/// that slipped past the lease (e.g. an abandoned task after shutdown).
#[derive(Clone)]
pub struct DeploymentStateMachine {
    repository: Arc<dyn DeploymentRepository>,
    publisher: StatusPublisher,
}

impl DeploymentStateMachine {
    pub fn new(repository: Arc<dyn DeploymentRepository>, publisher: StatusPublisher) -> Self {
        Self {
            repository,
            publisher,
        }
    }

    /// Determine the target state for a (current state, event) pair.
    ///
    /// Pure function over the transition table; invalid pairs are rejected.
    pub fn determine_target_state(
        current: DeploymentStatus,
        event: &LifecycleEvent,
    ) -> StateMachineResult<DeploymentStatus> {
        use DeploymentStatus::{
            Deploying, Error, Failed, Pending, Running, Scaling, Stopped, Stopping, Updating,
        };

        let target = match (current, event) {
            (Pending, LifecycleEvent::Submit) => Deploying,
            (Deploying, LifecycleEvent::Complete) => Running,
            (Deploying, LifecycleEvent::Fail(_)) => Failed,

            (Running, LifecycleEvent::ScaleRequest) => Scaling,
            (Scaling, LifecycleEvent::Complete) => Running,
            (Scaling, LifecycleEvent::Fail(_)) => Error,

            (Running, LifecycleEvent::UpdateRequest) => Updating,
            (Updating, LifecycleEvent::Complete) => Running,
            (Updating, LifecycleEvent::Fail(_)) => Error,

            (Running | Error, LifecycleEvent::StopRequest) => Stopping,
            // Cancellation of an in-flight operation routes into teardown.
            (Deploying | Scaling | Updating, LifecycleEvent::StopRequest) => Stopping,
            (Stopping, LifecycleEvent::Complete) => Stopped,
            (Stopping, LifecycleEvent::Fail(_)) => Error,

            (Stopped, LifecycleEvent::StartRequest) => Deploying,
            (Failed, LifecycleEvent::Retry) => Pending,

            // Health monitor exhausting recovery on a running deployment.
            (Running, LifecycleEvent::Fail(_)) => Error,

            // Delete routes through teardown from any state.
            (_, LifecycleEvent::DeleteRequest) => Stopping,

            (from, event) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    /// Apply an event: resolve the target state, persist it with the
    /// optimistic version check, then publish the change.
    ///
    /// On success the passed deployment is refreshed with the persisted row
    /// (bumped version, timestamps).
    pub async fn transition(
        &self,
        deployment: &mut Deployment,
        event: LifecycleEvent,
    ) -> StateMachineResult<DeploymentStatus> {
        let from = deployment.status;
        let target = Self::determine_target_state(from, &event)?;

        deployment.status = target;
        match &event {
            LifecycleEvent::Fail(message) => {
                deployment.error_message = Some(message.clone());
            }
            LifecycleEvent::Complete if target == DeploymentStatus::Running => {
                deployment.error_message = None;
            }
            _ => {}
        }

        let persisted = self.repository.update(deployment).await?;
        *deployment = persisted;

        info!(
            deployment_id = %deployment.id,
            from = %from,
            to = %target,
            event = event.event_type(),
            "Deployment state transition"
        );

        self.publisher.publish(
            deployment,
            format!("{} -> {} ({})", from, target, event.event_type()),
        );

        Ok(target)
    }

    /// Persist a health observation without touching the lifecycle state.
    ///
    /// Publishes an event when the health value actually changed. A stale
    /// version error propagates to the caller; the health monitor drops it
    /// (the concurrent executor write wins and the next pass re-observes).
    pub async fn observe_health(
        &self,
        deployment: &mut Deployment,
        health: HealthState,
        message: impl Into<String>,
    ) -> StateMachineResult<bool> {
        if deployment.health == health {
            return Ok(false);
        }

        let previous = deployment.health;
        deployment.health = health;
        let persisted = self.repository.update(deployment).await?;
        *deployment = persisted;

        info!(
            deployment_id = %deployment.id,
            from = %previous,
            to = %health,
            "Deployment health transition"
        );

        self.publisher.publish(deployment, message.into());
        Ok(true)
    }

    pub fn publisher(&self) -> &StatusPublisher {
        &self.publisher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(
        current: DeploymentStatus,
        event: LifecycleEvent,
    ) -> StateMachineResult<DeploymentStatus> {
        DeploymentStateMachine::determine_target_state(current, &event)
    }

    #[test]
    fn test_deploy_path() {
        assert_eq!(
            target(DeploymentStatus::Pending, LifecycleEvent::Submit).unwrap(),
            DeploymentStatus::Deploying
        );
        assert_eq!(
            target(DeploymentStatus::Deploying, LifecycleEvent::Complete).unwrap(),
            DeploymentStatus::Running
        );
        assert_eq!(
            target(
                DeploymentStatus::Deploying,
                LifecycleEvent::fail_with_error("no capacity")
            )
            .unwrap(),
            DeploymentStatus::Failed
        );
    }

    #[test]
    fn test_scale_and_update_paths() {
        assert_eq!(
            target(DeploymentStatus::Running, LifecycleEvent::ScaleRequest).unwrap(),
            DeploymentStatus::Scaling
        );
        assert_eq!(
            target(DeploymentStatus::Scaling, LifecycleEvent::Complete).unwrap(),
            DeploymentStatus::Running
        );
        assert_eq!(
            target(
                DeploymentStatus::Scaling,
                LifecycleEvent::fail_with_error("scale failed")
            )
            .unwrap(),
            DeploymentStatus::Error
        );
        assert_eq!(
            target(DeploymentStatus::Running, LifecycleEvent::UpdateRequest).unwrap(),
            DeploymentStatus::Updating
        );
        assert_eq!(
            target(
                DeploymentStatus::Updating,
                LifecycleEvent::fail_with_error("update failed")
            )
            .unwrap(),
            DeploymentStatus::Error
        );
    }

    #[test]
    fn test_stop_start_paths() {
        assert_eq!(
            target(DeploymentStatus::Running, LifecycleEvent::StopRequest).unwrap(),
            DeploymentStatus::Stopping
        );
        assert_eq!(
            target(DeploymentStatus::Error, LifecycleEvent::StopRequest).unwrap(),
            DeploymentStatus::Stopping
        );
        // A stop during an in-flight deploy/scale/update is the cancellation
        // path and must route into teardown.
        assert_eq!(
            target(DeploymentStatus::Deploying, LifecycleEvent::StopRequest).unwrap(),
            DeploymentStatus::Stopping
        );
        assert_eq!(
            target(DeploymentStatus::Stopping, LifecycleEvent::Complete).unwrap(),
            DeploymentStatus::Stopped
        );
        assert_eq!(
            target(DeploymentStatus::Stopped, LifecycleEvent::StartRequest).unwrap(),
            DeploymentStatus::Deploying
        );
        assert_eq!(
            target(DeploymentStatus::Failed, LifecycleEvent::Retry).unwrap(),
            DeploymentStatus::Pending
        );
    }

    #[test]
    fn test_delete_routes_through_stopping_from_any_state() {
        for current in [
            DeploymentStatus::Pending,
            DeploymentStatus::Running,
            DeploymentStatus::Error,
            DeploymentStatus::Failed,
            DeploymentStatus::Stopped,
        ] {
            assert_eq!(
                target(current, LifecycleEvent::DeleteRequest).unwrap(),
                DeploymentStatus::Stopping
            );
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(target(DeploymentStatus::Pending, LifecycleEvent::Complete).is_err());
        assert!(target(DeploymentStatus::Stopped, LifecycleEvent::ScaleRequest).is_err());
        assert!(target(DeploymentStatus::Stopped, LifecycleEvent::StopRequest).is_err());
        assert!(target(DeploymentStatus::Running, LifecycleEvent::Submit).is_err());
        assert!(target(DeploymentStatus::Scaling, LifecycleEvent::ScaleRequest).is_err());
        assert!(target(DeploymentStatus::Running, LifecycleEvent::Retry).is_err());
    }
}
