//! Background task bodies for long-running deployment operations.
//!
//! Each body runs under the deployment's exclusive lease, drives the
//! container driver with bounded retries, polls for readiness, and settles
//! the lifecycle through the state machine. Cancellation is cooperative:
//! the cancel flag is consulted at checkpoints (never mid-driver-call) and a
//! pending request routes the task into the teardown path.

use crate::config::{BackendConfig, BackendKind, RetryConfig};
use crate::driver::{ContainerDriver, ContainerSpec, DriverError};
use crate::events::StatusPublisher;
use crate::executor::{CancelFlag, CancelIntent};
use crate::health::HealthMonitor;
use crate::models::Deployment;
use crate::repository::DeploymentRepository;
use crate::state_machine::{DeploymentStateMachine, HealthState, LifecycleEvent};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Shared handles a task body needs; cloned into each spawned task.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub repository: Arc<dyn DeploymentRepository>,
    pub driver: Arc<dyn ContainerDriver>,
    pub machine: DeploymentStateMachine,
    pub publisher: StatusPublisher,
    pub monitor: HealthMonitor,
    pub retry: RetryConfig,
    pub backend: BackendConfig,
}

impl TaskContext {
    /// Derive the stable endpoint URL for a created workload.
    pub(crate) fn endpoint_url(&self, handle: &str, port: i32) -> String {
        endpoint_url(self.backend.kind, &self.backend.namespace, handle, port)
    }
}

/// Stable endpoint URL for a workload handle: cluster-internal DNS for
/// Kubernetes, the published host port for single-host Docker.
pub(crate) fn endpoint_url(
    kind: BackendKind,
    namespace: &str,
    handle: &str,
    port: i32,
) -> String {
    match kind {
        BackendKind::Kubernetes => {
            format!("http://{handle}-service.{namespace}.svc.cluster.local:{port}")
        }
        BackendKind::Docker => format!("http://localhost:{port}"),
    }
}

/// Outcome of a readiness wait.
enum Readiness {
    Ready,
    Cancelled(CancelIntent),
    Failed(String),
}

/// Retry a driver call with exponential backoff. Only transient errors
/// (connection, timeout) are retried; fatal errors return immediately.
async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    deployment_id: Uuid,
    operation: &str,
    mut call: F,
) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DriverError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                let delay = retry.backoff_delay(attempt);
                warn!(
                    deployment_id = %deployment_id,
                    operation,
                    attempt,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient driver failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Poll the backend until all desired replicas are ready, the backend
/// reports failure, the readiness window expires, or cancellation arrives.
async fn wait_for_ready(ctx: &TaskContext, handle: &str, cancel: &CancelFlag) -> Readiness {
    let deadline = tokio::time::Instant::now() + ctx.retry.readiness_timeout();
    loop {
        if let Some(intent) = cancel.pending() {
            return Readiness::Cancelled(intent);
        }
        match ctx.driver.get_status(handle).await {
            Ok(status) if status.is_ready() => return Readiness::Ready,
            Ok(status) if status.phase == crate::driver::BackendPhase::Failed => {
                return Readiness::Failed(
                    status
                        .message
                        .unwrap_or_else(|| "backend reported workload failure".to_string()),
                );
            }
            Ok(_) => {}
            // Transient observation failures just mean we poll again.
            Err(e) if e.is_retryable() => {
                warn!(workload = %handle, error = %e, "Status poll failed, will retry");
            }
            Err(e) => return Readiness::Failed(e.to_string()),
        }
        if tokio::time::Instant::now() >= deadline {
            return Readiness::Failed(format!(
                "workload not ready within {}s",
                ctx.retry.readiness_timeout().as_secs()
            ));
        }
        tokio::time::sleep(ctx.retry.readiness_poll_interval()).await;
    }
}

/// Settle a task failure: persist the failure transition. Transition errors
/// here are logged, not propagated; the reconciler picks up whatever a
/// doubly-failed task leaves behind.
async fn settle_failure(ctx: &TaskContext, deployment: &mut Deployment, message: String) {
    error!(
        deployment_id = %deployment.id,
        status = %deployment.status,
        error = %message,
        "Operation failed"
    );
    deployment.health = HealthState::Unknown;
    if let Err(e) = ctx
        .machine
        .transition(deployment, LifecycleEvent::fail_with_error(message))
        .await
    {
        error!(deployment_id = %deployment.id, error = %e, "Failed to persist failure transition");
    }
}

/// Provision the workload for a DEPLOYING record and bring it to RUNNING.
///
/// Also used for restarts: creation is idempotent by workload name, so an
/// existing backend object is adopted and scaled rather than duplicated.
pub(crate) async fn run_deploy(ctx: TaskContext, mut deployment: Deployment, cancel: CancelFlag) {
    if let Some(intent) = cancel.pending() {
        run_teardown(ctx, deployment, intent, cancel).await;
        return;
    }

    // Create (or adopt) the backend object.
    let spec = ContainerSpec::from_deployment(&deployment);
    let handle = match with_retry(&ctx.retry, deployment.id, "create", || {
        ctx.driver.create(&spec)
    })
    .await
    {
        Ok(handle) => handle,
        Err(e) => {
            settle_failure(&ctx, &mut deployment, e.to_string()).await;
            return;
        }
    };

    // Persist the handle before anything else so a crash between creation
    // and completion still leaves the backend object findable.
    deployment.endpoint_url = Some(ctx.endpoint_url(&handle, deployment.container_port));
    deployment.backend_handle = Some(handle.clone());
    match ctx.repository.update(&deployment).await {
        Ok(persisted) => deployment = persisted,
        Err(e) => {
            error!(deployment_id = %deployment.id, error = %e, "Failed to persist backend handle");
            return;
        }
    }

    if let Some(intent) = cancel.pending() {
        run_teardown(ctx, deployment, intent, cancel).await;
        return;
    }

    // Bring the workload to the desired replica count. For single-host
    // backends this starts the created container; for cluster backends it
    // is an idempotent confirmation of the manifest.
    if let Err(e) = with_retry(&ctx.retry, deployment.id, "scale", || {
        ctx.driver.scale(&handle, deployment.replica_count)
    })
    .await
    {
        settle_failure(&ctx, &mut deployment, e.to_string()).await;
        return;
    }

    match wait_for_ready(&ctx, &handle, &cancel).await {
        Readiness::Ready => {
            info!(deployment_id = %deployment.id, workload = %handle, "Workload ready");
            deployment.health = HealthState::Healthy;
            match ctx
                .machine
                .transition(&mut deployment, LifecycleEvent::Complete)
                .await
            {
                Ok(_) => ctx.monitor.watch(&deployment),
                Err(e) => {
                    error!(deployment_id = %deployment.id, error = %e, "Failed to persist completion");
                }
            }
        }
        Readiness::Cancelled(intent) => run_teardown(ctx, deployment, intent, cancel).await,
        Readiness::Failed(message) => settle_failure(&ctx, &mut deployment, message).await,
    }
}

/// Apply a replica count change to a SCALING record.
pub(crate) async fn run_scale(ctx: TaskContext, mut deployment: Deployment, cancel: CancelFlag) {
    if let Some(intent) = cancel.pending() {
        run_teardown(ctx, deployment, intent, cancel).await;
        return;
    }

    let Some(handle) = deployment.backend_handle.clone() else {
        settle_failure(
            &ctx,
            &mut deployment,
            "deployment has no backend object to scale".to_string(),
        )
        .await;
        return;
    };

    if let Err(e) = with_retry(&ctx.retry, deployment.id, "scale", || {
        ctx.driver.scale(&handle, deployment.replica_count)
    })
    .await
    {
        settle_failure(&ctx, &mut deployment, e.to_string()).await;
        return;
    }

    match wait_for_ready(&ctx, &handle, &cancel).await {
        Readiness::Ready => {
            info!(
                deployment_id = %deployment.id,
                replicas = deployment.replica_count,
                "Scale complete"
            );
            deployment.health = HealthState::Healthy;
            match ctx
                .machine
                .transition(&mut deployment, LifecycleEvent::Complete)
                .await
            {
                // Re-watch so a changed check interval takes effect.
                Ok(_) => ctx.monitor.watch(&deployment),
                Err(e) => {
                    error!(deployment_id = %deployment.id, error = %e, "Failed to persist completion");
                }
            }
        }
        Readiness::Cancelled(intent) => run_teardown(ctx, deployment, intent, cancel).await,
        Readiness::Failed(message) => settle_failure(&ctx, &mut deployment, message).await,
    }
}

/// Roll an UPDATING record onto its new image/spec.
///
/// The driver interface has no in-place update, so the roll is a teardown
/// and idempotent re-create of the backend object under the same logical
/// name, followed by the usual readiness wait.
pub(crate) async fn run_update(ctx: TaskContext, mut deployment: Deployment, cancel: CancelFlag) {
    if let Some(intent) = cancel.pending() {
        run_teardown(ctx, deployment, intent, cancel).await;
        return;
    }

    if let Some(handle) = deployment.backend_handle.clone() {
        if let Err(e) = with_retry(&ctx.retry, deployment.id, "delete", || {
            ctx.driver.delete(&handle)
        })
        .await
        {
            settle_failure(&ctx, &mut deployment, e.to_string()).await;
            return;
        }
    }

    // From here the roll is identical to a deploy: re-create under the same
    // logical name, scale, wait for readiness.
    run_deploy(ctx, deployment, cancel).await;
}

/// Stop the workload for a STOPPING record without removing it.
pub(crate) async fn run_stop(ctx: TaskContext, mut deployment: Deployment, cancel: CancelFlag) {
    if let Some(handle) = deployment.backend_handle.clone() {
        let result = with_retry(&ctx.retry, deployment.id, "stop", || {
            ctx.driver.stop(&handle)
        })
        .await;
        match result {
            Ok(()) => {}
            // An already-absent backend object is as stopped as it gets.
            Err(DriverError::NotFound(_)) => {}
            Err(e) => {
                settle_failure(&ctx, &mut deployment, e.to_string()).await;
                return;
            }
        }
    }

    // A delete that arrived while the stop was in flight upgrades the
    // teardown: an acknowledged delete must not leave the record behind.
    if cancel.pending() == Some(CancelIntent::Delete) {
        info!(deployment_id = %deployment.id, "Delete requested during stop, removing record");
        run_delete(ctx, deployment, CancelFlag::inert()).await;
        return;
    }

    deployment.health = HealthState::Unknown;
    match ctx
        .machine
        .transition(&mut deployment, LifecycleEvent::Complete)
        .await
    {
        Ok(_) => ctx.monitor.unwatch(deployment.id),
        Err(e) => {
            error!(deployment_id = %deployment.id, error = %e, "Failed to persist stop completion");
        }
    }
}

/// Tear down the workload for a STOPPING record and remove the record.
pub(crate) async fn run_delete(ctx: TaskContext, mut deployment: Deployment, _cancel: CancelFlag) {
    // Persist the removal intent before touching the backend, so a crash
    // mid-delete cannot resurrect the record as merely stopped.
    if !deployment.pending_removal {
        deployment.pending_removal = true;
        match ctx.repository.update(&deployment).await {
            Ok(persisted) => deployment = persisted,
            Err(e) => {
                error!(deployment_id = %deployment.id, error = %e, "Failed to persist removal intent");
                return;
            }
        }
    }

    if let Some(handle) = deployment.backend_handle.clone() {
        let result = with_retry(&ctx.retry, deployment.id, "delete", || {
            ctx.driver.delete(&handle)
        })
        .await;
        match result {
            Ok(()) | Err(DriverError::NotFound(_)) => {}
            Err(e) => {
                // Teardown failed: keep the record in ERROR so the delete
                // can be retried instead of orphaning the backend object.
                settle_failure(&ctx, &mut deployment, e.to_string()).await;
                return;
            }
        }
    }

    deployment.health = HealthState::Unknown;
    if let Err(e) = ctx
        .machine
        .transition(&mut deployment, LifecycleEvent::Complete)
        .await
    {
        error!(deployment_id = %deployment.id, error = %e, "Failed to persist teardown");
        return;
    }

    if let Err(e) = ctx.repository.delete(deployment.id).await {
        error!(deployment_id = %deployment.id, error = %e, "Failed to remove deployment record");
        return;
    }

    ctx.monitor.unwatch(deployment.id);
    info!(deployment_id = %deployment.id, "Deployment deleted");
    ctx.publisher.publish(&deployment, "Deployment deleted");
}

/// Cancellation landing path: transition the interrupted record into
/// STOPPING and run the teardown matching the requested intent.
async fn run_teardown(
    ctx: TaskContext,
    mut deployment: Deployment,
    intent: CancelIntent,
    cancel: CancelFlag,
) {
    info!(
        deployment_id = %deployment.id,
        status = %deployment.status,
        ?intent,
        "Operation cancelled, tearing down"
    );

    let event = match intent {
        CancelIntent::Stop => LifecycleEvent::StopRequest,
        CancelIntent::Delete => {
            deployment.pending_removal = true;
            LifecycleEvent::DeleteRequest
        }
    };
    if let Err(e) = ctx.machine.transition(&mut deployment, event).await {
        error!(deployment_id = %deployment.id, error = %e, "Failed to route cancellation into teardown");
        return;
    }

    match intent {
        // The stop keeps the live flag: a delete requested while the stop
        // runs upgrades the teardown at its final checkpoint.
        CancelIntent::Stop => run_stop(ctx, deployment, cancel).await,
        // A delete runs to completion; nothing outranks it.
        CancelIntent::Delete => run_delete(ctx, deployment, CancelFlag::inert()).await,
    }
}
