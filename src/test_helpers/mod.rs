//! Test support: a fully scriptable in-memory container driver.
//!
//! Used by the integration suites to exercise retry, readiness, failure,
//! and cancellation paths without a real backend. Compiled into the library
//! so `tests/` can reach it.

use crate::driver::{BackendPhase, BackendStatus, ContainerDriver, ContainerSpec, DriverError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory driver whose behavior is programmed per operation.
///
/// By default every operation succeeds and `get_status` reports all desired
/// replicas ready. Failures are queued per operation name and consumed in
/// order; scripted statuses are consumed before the synthetic default.
#[derive(Default)]
pub struct ScriptedDriver {
    /// Backend objects that currently exist, keyed by handle.
    objects: Mutex<HashSet<String>>,
    /// Desired replica count per handle, tracked from create/scale calls.
    desired: Mutex<HashMap<String, i32>>,
    /// Queued failures per operation name, consumed one per call.
    failures: Mutex<HashMap<String, VecDeque<DriverError>>>,
    /// Scripted `get_status` responses, consumed before the default.
    statuses: Mutex<VecDeque<BackendStatus>>,
    /// Artificial latency per operation name, applied before each call.
    delays: Mutex<HashMap<String, Duration>>,
    /// Call counts per operation name.
    calls: Mutex<HashMap<String, u32>>,
    /// Every spec passed to `create`, in order.
    created: Mutex<Vec<ContainerSpec>>,
    /// Scale calls as (handle, replicas), in order.
    scaled: Mutex<Vec<(String, i32)>>,
    logs: Mutex<String>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for the next call to `operation`.
    pub fn fail_next(&self, operation: &str, error: DriverError) {
        self.failures
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Queue `count` transient connection failures for `operation`.
    pub fn fail_transiently(&self, operation: &str, count: usize) {
        for _ in 0..count {
            self.fail_next(
                operation,
                DriverError::Connection("scripted connection failure".to_string()),
            );
        }
    }

    /// Queue a `get_status` response, returned before the synthetic default.
    pub fn push_status(&self, status: BackendStatus) {
        self.statuses.lock().unwrap().push_back(status);
    }

    /// Delay every call to `operation`, keeping it observably in flight.
    pub fn set_delay(&self, operation: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(operation.to_string(), delay);
    }

    /// Number of calls made to `operation` so far (failed calls included).
    pub fn calls(&self, operation: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    /// Every spec passed to `create`, in order.
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }

    /// Scale calls observed so far as (handle, replicas).
    pub fn scale_calls(&self) -> Vec<(String, i32)> {
        self.scaled.lock().unwrap().clone()
    }

    /// Whether a backend object with this handle currently exists.
    pub fn has_object(&self, handle: &str) -> bool {
        self.objects.lock().unwrap().contains(handle)
    }

    /// Total number of live backend objects.
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn set_logs(&self, text: impl Into<String>) {
        *self.logs.lock().unwrap() = text.into();
    }

    fn record_call(&self, operation: &str) {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_insert(0) += 1;
    }

    fn take_failure(&self, operation: &str) -> Option<DriverError> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
    }

    async fn guard(&self, operation: &str) -> Result<(), DriverError> {
        let delay = self.delays.lock().unwrap().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record_call(operation);
        match self.take_failure(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerDriver for ScriptedDriver {
    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError> {
        self.guard("create").await?;
        self.created.lock().unwrap().push(spec.clone());
        // Idempotent by name: re-creating an existing object adopts it.
        self.objects.lock().unwrap().insert(spec.name.clone());
        self.desired
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.replicas);
        Ok(spec.name.clone())
    }

    async fn start(&self, handle: &str) -> Result<(), DriverError> {
        self.guard("start").await?;
        if !self.has_object(handle) {
            return Err(DriverError::NotFound(handle.to_string()));
        }
        self.desired
            .lock()
            .unwrap()
            .entry(handle.to_string())
            .and_modify(|n| *n = (*n).max(1))
            .or_insert(1);
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<(), DriverError> {
        self.guard("stop").await?;
        if !self.has_object(handle) {
            return Err(DriverError::NotFound(handle.to_string()));
        }
        self.desired.lock().unwrap().insert(handle.to_string(), 0);
        Ok(())
    }

    async fn scale(&self, handle: &str, replicas: i32) -> Result<(), DriverError> {
        self.guard("scale").await?;
        if !self.has_object(handle) {
            return Err(DriverError::NotFound(handle.to_string()));
        }
        self.scaled
            .lock()
            .unwrap()
            .push((handle.to_string(), replicas));
        self.desired
            .lock()
            .unwrap()
            .insert(handle.to_string(), replicas);
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<(), DriverError> {
        self.guard("delete").await?;
        // Deleting an absent object is not an error.
        self.objects.lock().unwrap().remove(handle);
        self.desired.lock().unwrap().remove(handle);
        Ok(())
    }

    async fn get_status(&self, handle: &str) -> Result<BackendStatus, DriverError> {
        self.guard("get_status").await?;
        if let Some(scripted) = self.statuses.lock().unwrap().pop_front() {
            return Ok(scripted);
        }
        if !self.has_object(handle) {
            return Err(DriverError::NotFound(handle.to_string()));
        }
        let desired = self
            .desired
            .lock()
            .unwrap()
            .get(handle)
            .copied()
            .unwrap_or(0);
        Ok(BackendStatus {
            phase: if desired > 0 {
                BackendPhase::Running
            } else {
                BackendPhase::Stopped
            },
            replicas_desired: desired,
            replicas_ready: desired,
            message: None,
        })
    }

    async fn stream_logs(&self, _handle: &str, _tail: i64) -> Result<String, DriverError> {
        self.guard("stream_logs").await?;
        Ok(self.logs.lock().unwrap().clone())
    }
}

/// A ready status for `desired` replicas, for scripting readiness polls.
pub fn ready_status(desired: i32) -> BackendStatus {
    BackendStatus {
        phase: BackendPhase::Running,
        replicas_desired: desired,
        replicas_ready: desired,
        message: None,
    }
}

/// A status with only some replicas ready.
pub fn degraded_status(desired: i32, ready: i32) -> BackendStatus {
    BackendStatus {
        phase: BackendPhase::Running,
        replicas_desired: desired,
        replicas_ready: ready,
        message: None,
    }
}

/// A terminal backend failure status.
pub fn failed_status(message: &str) -> BackendStatus {
    BackendStatus {
        phase: BackendPhase::Failed,
        replicas_desired: 1,
        replicas_ready: 0,
        message: Some(message.to_string()),
    }
}

/// A timeout error for failure scripting.
pub fn timeout_error() -> DriverError {
    DriverError::Timeout(Duration::from_secs(1))
}
