//! Bounded async task executor.
//!
//! Long-running operations (deploy, scale, update, stop, delete) run as
//! background tasks so API calls return immediately after the synchronous
//! transition. Concurrency is capped by a semaphore sized to `max_workers`;
//! tasks beyond that wait in a bounded admission queue, and submissions past
//! the queue bound are rejected outright rather than buffered unboundedly.

pub mod lease;

pub use lease::{CancelFlag, CancelIntent, LeaseGuard, LeaseTable};

use crate::config::ExecutorConfig;
use crate::error::{OrchestrationError, Result};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Admission ticket for one background operation.
///
/// Holds the deployment's exclusive lease; dropping the permit (normally at
/// the end of the task body, or when an abandoned task is aborted) releases
/// the lease.
pub struct TaskPermit {
    guard: LeaseGuard,
}

impl TaskPermit {
    pub fn deployment_id(&self) -> Uuid {
        self.guard.deployment_id()
    }

    pub fn operation(&self) -> &'static str {
        self.guard.operation()
    }

    /// Cancellation flag the task body polls at its checkpoints.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.guard.cancel_flag()
    }
}

pub struct TaskExecutor {
    leases: Arc<LeaseTable>,
    workers: Arc<Semaphore>,
    handles: Arc<DashMap<Uuid, JoinHandle<()>>>,
    /// max_workers + queue_capacity: total tasks admitted at once.
    admission_limit: usize,
    drain_window: Duration,
    shutting_down: Arc<AtomicBool>,
}

impl TaskExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            leases: Arc::new(LeaseTable::new()),
            workers: Arc::new(Semaphore::new(config.max_workers)),
            handles: Arc::new(DashMap::new()),
            admission_limit: config.max_workers + config.queue_capacity,
            drain_window: config.drain_window(),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// Number of tasks currently admitted (running or queued).
    pub fn active_tasks(&self) -> usize {
        self.handles.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Admit a new operation for `id`: acquire the exclusive lease and
    /// reserve queue room. The caller performs the synchronous transition
    /// while holding the permit, then hands it to [`spawn`](Self::spawn).
    pub fn begin(&self, id: Uuid, operation: &'static str) -> Result<TaskPermit> {
        if self.is_shutting_down() {
            return Err(OrchestrationError::ShuttingDown);
        }

        // Drop handles of tasks that already finished so they stop counting
        // against the admission limit.
        self.handles.retain(|_, handle| !handle.is_finished());

        if self.handles.len() >= self.admission_limit {
            warn!(
                deployment_id = %id,
                operation,
                active = self.handles.len(),
                "Task queue full, rejecting operation"
            );
            return Err(OrchestrationError::QueueFull {
                capacity: self.admission_limit,
            });
        }

        match self.leases.acquire(id, operation) {
            Some(guard) => Ok(TaskPermit { guard }),
            None => Err(OrchestrationError::OperationInFlight(id)),
        }
    }

    /// Run `task` in the background under the permit's lease. The task waits
    /// for a worker slot before executing; the lease is held the whole time
    /// so a queued task still excludes other mutations.
    pub fn spawn<F>(&self, permit: TaskPermit, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = permit.deployment_id();
        let operation = permit.operation();
        let workers = self.workers.clone();
        let handles = self.handles.clone();

        let handle = tokio::spawn(async move {
            // Keep the permit (and lease) alive for the whole task.
            let _permit = permit;
            let Ok(_slot) = workers.acquire_owned().await else {
                // Semaphore closed: executor is gone.
                return;
            };
            debug!(deployment_id = %id, operation, "Task started");
            task.await;
            debug!(deployment_id = %id, operation, "Task finished");
            handles.remove(&id);
        });

        self.handles.insert(id, handle);
    }

    /// Signal the in-flight task for `id` (if any) to cancel at its next
    /// checkpoint. Returns false when no operation is in flight.
    pub fn request_cancel(&self, id: Uuid, intent: CancelIntent) -> bool {
        self.leases.request_cancel(id, intent)
    }

    /// Stop admitting work, give in-flight tasks the drain window to finish,
    /// then abort whatever remains. Aborted tasks release their leases via
    /// the permit's destructor; the repository rows they leave behind in
    /// transitional states are reconciled on the next startup.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        info!(
            active = self.handles.len(),
            drain_seconds = self.drain_window.as_secs(),
            "Executor shutting down, draining in-flight tasks"
        );

        let keys: Vec<Uuid> = self.handles.iter().map(|entry| *entry.key()).collect();
        let mut draining: Vec<JoinHandle<()>> = keys
            .into_iter()
            .filter_map(|key| self.handles.remove(&key).map(|(_, handle)| handle))
            .collect();

        let drain = async {
            for handle in draining.iter_mut() {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(self.drain_window, drain).await.is_err() {
            let abandoned = draining.iter().filter(|h| !h.is_finished()).count();
            warn!(abandoned, "Drain window expired, aborting remaining tasks");
            for handle in &draining {
                handle.abort();
            }
        } else {
            info!("All in-flight tasks drained");
        }
    }
}
