//! Deployment orchestrator: the single public entry point of the core.
//!
//! Every mutating operation follows the same shape: validate synchronously,
//! acquire the deployment's exclusive lease, persist the transition into the
//! transitional state, then hand the long-running work to the bounded
//! executor and return immediately. Reads never take leases.

pub(crate) mod tasks;

use crate::config::{BackendConfig, BackendKind, OrchestratorConfig};
use crate::driver::{ContainerDriver, DockerDriver, DriverError, KubernetesDriver};
use crate::error::{OrchestrationError, Result};
use crate::events::StatusPublisher;
use crate::executor::{CancelIntent, TaskExecutor};
use crate::health::HealthMonitor;
use crate::models::{
    validate_replica_count, Deployment, DeploymentFilter, DeploymentUpdate, NewDeployment,
};
use crate::repository::DeploymentRepository;
use crate::state_machine::{DeploymentStateMachine, DeploymentStatus, HealthState, LifecycleEvent};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use tasks::TaskContext;

/// Construct the container driver named by the backend configuration.
///
/// Called once at startup; the orchestrator never branches on backend kind
/// per operation.
pub async fn connect_driver(config: &BackendConfig) -> Result<Arc<dyn ContainerDriver>> {
    match config.kind {
        BackendKind::Docker => Ok(Arc::new(DockerDriver::connect()?)),
        BackendKind::Kubernetes => Ok(Arc::new(
            KubernetesDriver::connect(config.namespace.clone()).await?,
        )),
    }
}

pub struct Orchestrator {
    repository: Arc<dyn DeploymentRepository>,
    driver: Arc<dyn ContainerDriver>,
    machine: DeploymentStateMachine,
    executor: TaskExecutor,
    publisher: StatusPublisher,
    monitor: HealthMonitor,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<dyn DeploymentRepository>,
        driver: Arc<dyn ContainerDriver>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(OrchestrationError::Configuration)?;

        let publisher = StatusPublisher::new(config.events.channel_capacity);
        let machine = DeploymentStateMachine::new(repository.clone(), publisher.clone());
        let executor = TaskExecutor::new(&config.executor);
        let monitor = HealthMonitor::new(
            repository.clone(),
            driver.clone(),
            machine.clone(),
            executor.leases().clone(),
            config.health.clone(),
        );

        info!(
            backend = driver.backend_name(),
            max_workers = config.executor.max_workers,
            "Orchestrator initialized"
        );

        Ok(Self {
            repository,
            driver,
            machine,
            executor,
            publisher,
            monitor,
            config,
        })
    }

    /// Subscribe to the live status event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<crate::models::DeploymentEvent> {
        self.publisher.subscribe()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Handle to the health monitor. Watchers start automatically when a
    /// deployment reaches RUNNING and stand down on stop/delete; call
    /// [`HealthMonitor::resume`] once at startup to re-watch surviving rows.
    pub fn health_monitor(&self) -> HealthMonitor {
        self.monitor.clone()
    }

    fn task_context(&self) -> TaskContext {
        TaskContext {
            repository: self.repository.clone(),
            driver: self.driver.clone(),
            machine: self.machine.clone(),
            publisher: self.publisher.clone(),
            monitor: self.monitor.clone(),
            retry: self.config.retry.clone(),
            backend: self.config.backend.clone(),
        }
    }

    async fn load(&self, id: Uuid) -> Result<Deployment> {
        self.repository
            .get(id)
            .await?
            .ok_or(OrchestrationError::NotFound(id))
    }

    /// Create a deployment and begin provisioning it.
    ///
    /// Idempotent per `(owner_id, name)`: re-submitting an existing
    /// deployment returns the current record without creating anything.
    pub async fn create_deployment(&self, request: NewDeployment) -> Result<Deployment> {
        request.validate()?;

        if let Some(existing) = self
            .repository
            .find_by_name(request.owner_id, &request.name)
            .await?
        {
            info!(
                deployment_id = %existing.id,
                name = %existing.name,
                "Deployment already exists, returning existing record"
            );
            return Ok(existing);
        }

        let mut deployment = Deployment::from_request(request);
        self.repository.insert(&deployment).await?;
        self.publisher.publish(&deployment, "Deployment created");

        // Queue rejection leaves the record PENDING; the caller can resubmit
        // via start_deployment once there is room.
        let permit = self.executor.begin(deployment.id, "deploy")?;
        self.machine
            .transition(&mut deployment, LifecycleEvent::Submit)
            .await?;

        let ctx = self.task_context();
        let cancel = permit.cancel_flag();
        let snapshot = deployment.clone();
        self.executor
            .spawn(permit, tasks::run_deploy(ctx, snapshot, cancel));

        Ok(deployment)
    }

    /// (Re)start a PENDING, STOPPED, or FAILED deployment.
    pub async fn start_deployment(&self, id: Uuid) -> Result<Deployment> {
        let permit = self.executor.begin(id, "start")?;
        let mut deployment = self.load(id).await?;

        match deployment.status {
            DeploymentStatus::Pending => {
                self.machine
                    .transition(&mut deployment, LifecycleEvent::Submit)
                    .await?;
            }
            DeploymentStatus::Stopped => {
                self.machine
                    .transition(&mut deployment, LifecycleEvent::StartRequest)
                    .await?;
            }
            DeploymentStatus::Failed => {
                // Failed records resubmit through PENDING so the attempt
                // history reads the same as a fresh deploy.
                self.machine
                    .transition(&mut deployment, LifecycleEvent::Retry)
                    .await?;
                self.machine
                    .transition(&mut deployment, LifecycleEvent::Submit)
                    .await?;
            }
            other => {
                return Err(OrchestrationError::Validation(format!(
                    "deployment in state '{other}' cannot be started"
                )));
            }
        }

        let ctx = self.task_context();
        let cancel = permit.cancel_flag();
        let snapshot = deployment.clone();
        self.executor
            .spawn(permit, tasks::run_deploy(ctx, snapshot, cancel));

        Ok(deployment)
    }

    /// Change the replica count of a RUNNING deployment.
    pub async fn scale_deployment(&self, id: Uuid, replicas: i32) -> Result<Deployment> {
        validate_replica_count(replicas)?;

        let permit = self.executor.begin(id, "scale")?;
        let mut deployment = self.load(id).await?;
        deployment.replica_count = replicas;
        self.machine
            .transition(&mut deployment, LifecycleEvent::ScaleRequest)
            .await?;

        let ctx = self.task_context();
        let cancel = permit.cancel_flag();
        let snapshot = deployment.clone();
        self.executor
            .spawn(permit, tasks::run_scale(ctx, snapshot, cancel));

        Ok(deployment)
    }

    /// Roll a RUNNING deployment onto a new image or resource spec.
    pub async fn update_deployment(
        &self,
        id: Uuid,
        update: DeploymentUpdate,
    ) -> Result<Deployment> {
        update.validate()?;

        let permit = self.executor.begin(id, "update")?;
        let mut deployment = self.load(id).await?;
        update.apply_to(&mut deployment);
        self.machine
            .transition(&mut deployment, LifecycleEvent::UpdateRequest)
            .await?;

        let ctx = self.task_context();
        let cancel = permit.cancel_flag();
        let snapshot = deployment.clone();
        self.executor
            .spawn(permit, tasks::run_update(ctx, snapshot, cancel));

        Ok(deployment)
    }

    /// Stop a deployment's workload without removing the record.
    ///
    /// If another operation is in flight the stop is delivered as a
    /// cancellation request instead of conflicting: the running task routes
    /// into teardown at its next checkpoint.
    pub async fn stop_deployment(&self, id: Uuid) -> Result<Deployment> {
        if self.executor.request_cancel(id, CancelIntent::Stop) {
            info!(deployment_id = %id, "Stop delivered as cancellation of in-flight operation");
            return self.load(id).await;
        }

        let permit = self.executor.begin(id, "stop")?;
        let mut deployment = self.load(id).await?;
        self.machine
            .transition(&mut deployment, LifecycleEvent::StopRequest)
            .await?;

        let ctx = self.task_context();
        let cancel = permit.cancel_flag();
        let snapshot = deployment.clone();
        self.executor
            .spawn(permit, tasks::run_stop(ctx, snapshot, cancel));

        Ok(deployment)
    }

    /// Tear down a deployment's workload and remove its record.
    ///
    /// Like stop, a delete against an in-flight operation is delivered as a
    /// cancellation request rather than a conflict.
    pub async fn delete_deployment(&self, id: Uuid) -> Result<()> {
        if self.executor.request_cancel(id, CancelIntent::Delete) {
            info!(deployment_id = %id, "Delete delivered as cancellation of in-flight operation");
            return Ok(());
        }

        let permit = self.executor.begin(id, "delete")?;
        let mut deployment = self.load(id).await?;
        // The intent is persisted with the transition so a crash mid-delete
        // finishes the removal on recovery instead of resurrecting the row.
        deployment.pending_removal = true;
        self.machine
            .transition(&mut deployment, LifecycleEvent::DeleteRequest)
            .await?;

        let ctx = self.task_context();
        let cancel = permit.cancel_flag();
        self.executor
            .spawn(permit, tasks::run_delete(ctx, deployment, cancel));

        Ok(())
    }

    pub async fn get_deployment(&self, id: Uuid) -> Result<Deployment> {
        self.load(id).await
    }

    pub async fn list_deployments(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
        Ok(self.repository.list(filter).await?)
    }

    /// Fetch the trailing `tail` lines of workload logs.
    pub async fn get_deployment_logs(&self, id: Uuid, tail: i64) -> Result<String> {
        let deployment = self.load(id).await?;
        let Some(handle) = &deployment.backend_handle else {
            return Err(OrchestrationError::Validation(
                "deployment has no provisioned workload to read logs from".to_string(),
            ));
        };
        Ok(self.driver.stream_logs(handle, tail).await?)
    }

    /// Reconcile records abandoned in transitional states by a previous
    /// process: consult the backend and settle each row into a stable state.
    ///
    /// Called once at startup, before the orchestrator serves requests.
    /// Returns the number of records settled.
    pub async fn recover(&self) -> Result<usize> {
        let rows = self.repository.list(&DeploymentFilter::default()).await?;
        let mut settled = 0;

        for mut deployment in rows {
            if !deployment.status.is_transitional() {
                continue;
            }
            // A PENDING row has no backend work to reconcile; it stays
            // queued until an explicit start_deployment.
            if deployment.status == DeploymentStatus::Pending {
                continue;
            }
            // The lease guards against racing an operation admitted between
            // listing and settling.
            let Ok(_permit) = self.executor.begin(deployment.id, "recover") else {
                continue;
            };

            warn!(
                deployment_id = %deployment.id,
                status = %deployment.status,
                "Reconciling deployment abandoned mid-operation"
            );

            match deployment.status {
                // A delete interrupted mid-teardown finishes the removal.
                DeploymentStatus::Stopping if deployment.pending_removal => {
                    if let Some(handle) = deployment.backend_handle.clone() {
                        match self.driver.delete(&handle).await {
                            Ok(()) | Err(DriverError::NotFound(_)) => {}
                            Err(e) => {
                                warn!(deployment_id = %deployment.id, error = %e, "Delete retry failed during recovery");
                                deployment.health = HealthState::Unknown;
                                self.machine
                                    .transition(
                                        &mut deployment,
                                        LifecycleEvent::fail_with_error(e.to_string()),
                                    )
                                    .await?;
                                settled += 1;
                                continue;
                            }
                        }
                    }
                    deployment.health = HealthState::Unknown;
                    self.machine
                        .transition(&mut deployment, LifecycleEvent::Complete)
                        .await?;
                    self.repository.delete(deployment.id).await?;
                    self.publisher.publish(&deployment, "Deployment deleted");
                }
                DeploymentStatus::Stopping => {
                    if let Some(handle) = deployment.backend_handle.clone() {
                        // Best effort: an unreachable backend still settles
                        // the record; the next stop/delete retries teardown.
                        if let Err(e) = self.driver.stop(&handle).await {
                            warn!(deployment_id = %deployment.id, error = %e, "Teardown retry failed during recovery");
                        }
                    }
                    deployment.health = HealthState::Unknown;
                    self.machine
                        .transition(&mut deployment, LifecycleEvent::Complete)
                        .await?;
                }
                _ => {
                    let ready = match &deployment.backend_handle {
                        Some(handle) => self
                            .driver
                            .get_status(handle)
                            .await
                            .map(|status| status.is_ready())
                            .unwrap_or(false),
                        None => false,
                    };
                    if ready {
                        deployment.health = HealthState::Healthy;
                        self.machine
                            .transition(&mut deployment, LifecycleEvent::Complete)
                            .await?;
                    } else {
                        deployment.health = HealthState::Unknown;
                        self.machine
                            .transition(
                                &mut deployment,
                                LifecycleEvent::fail_with_error(
                                    "operation abandoned by orchestrator restart",
                                ),
                            )
                            .await?;
                    }
                }
            }
            settled += 1;
        }

        if settled > 0 {
            info!(settled, "Startup reconciliation complete");
        }
        Ok(settled)
    }

    /// Stop admitting operations, drain in-flight tasks, abort stragglers,
    /// and stand down the health watchers.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        self.monitor.stop();
    }
}
