//! Health monitor: periodic reconciliation of observed backend state into
//! the `health` axis of each deployment record.
//!
//! Health is orthogonal to lifecycle: a pass never changes `status` except
//! when bounded auto-recovery is exhausted, which fails the deployment into
//! ERROR. The status probe is read-only and runs without the deployment's
//! lease, so it never blocks a user mutation; passes stand aside while an
//! operation is in flight, and stale-version conflicts against a concurrent
//! writer are dropped on the floor (the next tick re-observes). Only the
//! recovery mutation takes the lease.
//!
//! Watchers start automatically when a deploy task settles RUNNING and stand
//! down on stop/delete; [`HealthMonitor::resume`] re-watches every surviving
//! record at startup.

use crate::config::HealthConfig;
use crate::driver::{BackendStatus, ContainerDriver};
use crate::error::Result;
use crate::executor::LeaseTable;
use crate::models::{Deployment, DeploymentFilter};
use crate::repository::DeploymentRepository;
use crate::state_machine::{
    DeploymentStateMachine, DeploymentStatus, HealthState, LifecycleEvent, StateMachineError,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a single reconciliation pass for one deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    /// Health was observed (and persisted if it changed).
    Observed(HealthState),
    /// Pass skipped: lease held or deployment not in a monitorable state.
    Skipped,
    /// Record is gone or terminal; the watcher should stand down.
    Settled,
}

#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    repository: Arc<dyn DeploymentRepository>,
    driver: Arc<dyn ContainerDriver>,
    machine: DeploymentStateMachine,
    leases: LeaseTable,
    config: HealthConfig,
    watchers: DashMap<Uuid, JoinHandle<()>>,
    recovery_attempts: DashMap<Uuid, u32>,
}

impl HealthMonitor {
    pub fn new(
        repository: Arc<dyn DeploymentRepository>,
        driver: Arc<dyn ContainerDriver>,
        machine: DeploymentStateMachine,
        leases: LeaseTable,
        config: HealthConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repository,
                driver,
                machine,
                leases,
                config,
                watchers: DashMap::new(),
                recovery_attempts: DashMap::new(),
            }),
        }
    }

    /// Start (or restart) the periodic watcher for a deployment, honoring
    /// its per-deployment check interval.
    pub fn watch(&self, deployment: &Deployment) {
        let id = deployment.id;
        let interval_seconds = if deployment.health_check_interval_seconds > 0 {
            deployment.health_check_interval_seconds as u64
        } else {
            self.inner.config.default_interval_seconds.max(1) as u64
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Consume the immediate first tick; the deploy task has just
            // observed readiness itself.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match inner.check(id).await {
                    Ok(CheckOutcome::Settled) => {
                        debug!(deployment_id = %id, "Deployment settled, watcher standing down");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(deployment_id = %id, error = %e, "Health pass failed");
                    }
                }
            }
            inner.watchers.remove(&id);
            inner.recovery_attempts.remove(&id);
        });

        if let Some(previous) = self.inner.watchers.insert(id, handle) {
            previous.abort();
        }
    }

    /// Stop watching a deployment.
    pub fn unwatch(&self, id: Uuid) {
        if let Some((_, handle)) = self.inner.watchers.remove(&id) {
            handle.abort();
        }
        self.inner.recovery_attempts.remove(&id);
    }

    /// Run one reconciliation pass for a deployment right now, outside the
    /// periodic schedule. Returns the observed health, or `None` when the
    /// pass was skipped or the record is gone.
    pub async fn check_now(&self, id: Uuid) -> Result<Option<HealthState>> {
        match self.inner.check(id).await? {
            CheckOutcome::Observed(health) => Ok(Some(health)),
            CheckOutcome::Skipped | CheckOutcome::Settled => Ok(None),
        }
    }

    /// Re-watch every non-terminal deployment. Called once at startup, after
    /// [`crate::orchestrator::Orchestrator::recover`].
    pub async fn resume(&self) -> Result<usize> {
        let rows = self
            .inner
            .repository
            .list(&DeploymentFilter::default())
            .await?;
        let mut watched = 0;
        for deployment in rows {
            if deployment.status.is_terminal() {
                continue;
            }
            self.watch(&deployment);
            watched += 1;
        }
        if watched > 0 {
            info!(watched, "Health monitoring resumed");
        }
        Ok(watched)
    }

    /// Number of deployments currently being watched.
    pub fn watched_count(&self) -> usize {
        self.inner.watchers.len()
    }

    /// Abort all watchers.
    pub fn stop(&self) {
        self.inner.watchers.retain(|_, handle| {
            handle.abort();
            false
        });
        self.inner.recovery_attempts.clear();
    }
}

/// Map one backend observation onto the health axis.
fn classify(status: &BackendStatus, desired: i32) -> (HealthState, String) {
    if status.is_ready() {
        return (HealthState::Healthy, "All replicas ready".to_string());
    }
    if status.replicas_ready > 0 {
        return (
            HealthState::Degraded,
            format!(
                "{}/{} replicas ready",
                status.replicas_ready,
                desired.max(status.replicas_desired)
            ),
        );
    }
    (
        HealthState::Unhealthy,
        status
            .message
            .clone()
            .unwrap_or_else(|| "no replicas ready".to_string()),
    )
}

impl Inner {
    async fn check(&self, id: Uuid) -> Result<CheckOutcome> {
        // Stand aside while a mutating operation is in flight. The pass
        // itself holds no lease, so a user mutation arriving mid-probe is
        // admitted normally; the version check settles the write race.
        if self.leases.is_held(id) {
            debug!(deployment_id = %id, "Operation in flight, skipping health pass");
            return Ok(CheckOutcome::Skipped);
        }

        let Some(mut deployment) = self.repository.get(id).await? else {
            return Ok(CheckOutcome::Settled);
        };
        if deployment.status.is_terminal() {
            return Ok(CheckOutcome::Settled);
        }
        if deployment.status != DeploymentStatus::Running {
            return Ok(CheckOutcome::Skipped);
        }

        let Some(handle) = deployment.backend_handle.clone() else {
            self.observe(&mut deployment, HealthState::Unknown, "No backend object to probe")
                .await?;
            return Ok(CheckOutcome::Observed(HealthState::Unknown));
        };

        let probe = tokio::time::timeout(
            self.config.driver_timeout(),
            self.driver.get_status(&handle),
        )
        .await;

        let (health, detail) = match probe {
            // Connectivity trouble degrades knowledge, not the deployment:
            // health goes to unknown and no recovery is attempted.
            Err(_) => (
                HealthState::Unknown,
                format!(
                    "status probe exceeded {}s",
                    self.config.driver_timeout_seconds
                ),
            ),
            Ok(Err(e)) if e.is_retryable() => {
                (HealthState::Unknown, format!("backend unreachable: {e}"))
            }
            Ok(Err(e)) => (HealthState::Unhealthy, e.to_string()),
            Ok(Ok(status)) => classify(&status, deployment.replica_count),
        };

        if health == HealthState::Healthy {
            self.recovery_attempts.remove(&id);
        }

        // An operation admitted during the probe wins outright.
        if self.leases.is_held(id) {
            debug!(deployment_id = %id, "Operation started during probe, dropping health pass");
            return Ok(CheckOutcome::Skipped);
        }

        self.observe(&mut deployment, health, detail).await?;

        if health == HealthState::Unhealthy {
            self.attempt_recovery(&mut deployment, &handle).await?;
        }

        Ok(CheckOutcome::Observed(health))
    }

    /// Persist a health observation, dropping stale-version conflicts: the
    /// concurrent writer won and the next tick re-observes.
    async fn observe(
        &self,
        deployment: &mut Deployment,
        health: HealthState,
        message: impl Into<String>,
    ) -> Result<()> {
        match self.machine.observe_health(deployment, health, message).await {
            Ok(_) => Ok(()),
            Err(StateMachineError::Persistence(e)) if e.is_stale_version() => {
                debug!(
                    deployment_id = %deployment.id,
                    "Concurrent write won, dropping health observation"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bounded auto-recovery for an unhealthy running deployment: restore
    /// the desired replica count up to the attempt limit, then fail the
    /// deployment into ERROR.
    async fn attempt_recovery(&self, deployment: &mut Deployment, handle: &str) -> Result<()> {
        // Recovery mutates, so unlike the probe it needs the lease.
        let Some(_guard) = self.leases.acquire(deployment.id, "health-recovery") else {
            debug!(deployment_id = %deployment.id, "Operation in flight, deferring recovery");
            return Ok(());
        };

        let attempt = {
            let mut entry = self.recovery_attempts.entry(deployment.id).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempt > self.config.max_recovery_attempts {
            warn!(
                deployment_id = %deployment.id,
                attempts = attempt - 1,
                "Auto-recovery exhausted, failing deployment"
            );
            self.recovery_attempts.remove(&deployment.id);
            match self
                .machine
                .transition(
                    deployment,
                    LifecycleEvent::fail_with_error(format!(
                        "unhealthy after {} recovery attempts",
                        self.config.max_recovery_attempts
                    )),
                )
                .await
            {
                Ok(_) => {}
                Err(StateMachineError::Persistence(e)) if e.is_stale_version() => {
                    debug!(
                        deployment_id = %deployment.id,
                        "Concurrent write won, dropping recovery exhaustion"
                    );
                }
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }

        info!(
            deployment_id = %deployment.id,
            attempt,
            max_attempts = self.config.max_recovery_attempts,
            "Attempting auto-recovery"
        );
        if let Err(e) = self.driver.scale(handle, deployment.replica_count).await {
            warn!(deployment_id = %deployment.id, error = %e, "Auto-recovery attempt failed");
        }
        Ok(())
    }
}
