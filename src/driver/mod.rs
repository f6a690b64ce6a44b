//! Container driver: uniform capability interface over heterogeneous
//! backends.
//!
//! The driver is a pure infrastructure-facing boundary: it mutates real
//! containers/workloads and never touches the repository. Two variants
//! exist, selected once at orchestrator construction based on configuration:
//! [`docker::DockerDriver`] for single-host containers and
//! [`kubernetes::KubernetesDriver`] for cluster workloads.

pub mod docker;
pub mod kubernetes;

use crate::models::Deployment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use docker::DockerDriver;
pub use kubernetes::KubernetesDriver;

/// Errors raised by container drivers.
///
/// The retryable/fatal split drives the executor's backoff policy:
/// connection and timeout failures are retried, spec and capacity failures
/// are not. Conflicts are resolved by adoption inside `create` and surface
/// only when adoption itself fails.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Backend unreachable; retryable.
    #[error("Backend unreachable: {0}")]
    Connection(String),

    /// Operation exceeded its deadline; retryable up to the attempt limit.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Bad resource request; fatal, never retried.
    #[error("Invalid container spec: {0}")]
    InvalidSpec(String),

    /// An object with the same logical name exists and could not be adopted.
    #[error("Conflicting backend object: {0}")]
    Conflict(String),

    /// The referenced backend object no longer exists.
    #[error("Backend object not found: {0}")]
    NotFound(String),

    /// Backend lacks capacity; fatal until external capacity changes.
    #[error("Backend out of capacity: {0}")]
    ResourceExhausted(String),

    /// Anything else the backend reported.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl DriverError {
    /// True for transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

/// Everything a driver needs to materialize one deployment's workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Logical workload name; creation is idempotent on this name.
    pub name: String,
    pub image: String,
    pub container_port: i32,
    pub replicas: i32,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub env: HashMap<String, String>,
    pub health_check_path: String,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Build a spec from a deployment row, tagging the backend object with
    /// the identifying labels the original platform uses.
    pub fn from_deployment(deployment: &Deployment) -> Self {
        let mut labels = HashMap::new();
        labels.insert("managed-by".to_string(), "mcp-hub".to_string());
        labels.insert("deployment-id".to_string(), deployment.id.to_string());
        labels.insert(
            "mcp-server-id".to_string(),
            deployment.mcp_server_id.to_string(),
        );
        Self {
            name: deployment.workload_name(),
            image: deployment.image_reference.clone(),
            container_port: deployment.container_port,
            replicas: deployment.replica_count,
            cpu_limit: deployment.cpu_limit.clone(),
            memory_limit: deployment.memory_limit.clone(),
            env: deployment.environment_variables.clone(),
            health_check_path: deployment.health_check_path.clone(),
            labels,
        }
    }
}

/// Coarse phase of a backend object, as observed by `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPhase {
    /// Object exists but no replicas are ready yet
    Pending,
    /// At least one replica is ready
    Running,
    /// Object exists with zero desired replicas
    Stopped,
    /// Backend reports a terminal failure condition
    Failed,
    /// Object state could not be determined
    Unknown,
}

/// Observed state of a backend object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub phase: BackendPhase,
    pub replicas_desired: i32,
    pub replicas_ready: i32,
    pub message: Option<String>,
}

impl BackendStatus {
    /// All desired replicas are ready (and there is at least one).
    pub fn is_ready(&self) -> bool {
        self.replicas_desired > 0 && self.replicas_ready >= self.replicas_desired
    }
}

/// Capability interface over a container backend.
///
/// `handle` values are opaque backend references returned by `create`; the
/// driver is the source of truth for whether the underlying object still
/// exists.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;

    /// Create the workload described by `spec` and return its handle.
    ///
    /// Idempotent by logical name: when an object with the same name already
    /// exists, the driver adopts it and returns its handle instead of
    /// erroring or duplicating.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError>;

    /// Start a stopped workload.
    async fn start(&self, handle: &str) -> Result<(), DriverError>;

    /// Stop the workload without removing it.
    async fn stop(&self, handle: &str) -> Result<(), DriverError>;

    /// Change the replica count.
    async fn scale(&self, handle: &str, replicas: i32) -> Result<(), DriverError>;

    /// Remove the workload and any associated objects.
    ///
    /// Deleting an already-absent object is not an error.
    async fn delete(&self, handle: &str) -> Result<(), DriverError>;

    /// Observe the workload's current state.
    async fn get_status(&self, handle: &str) -> Result<BackendStatus, DriverError>;

    /// Fetch the trailing `tail` lines of workload logs.
    async fn stream_logs(&self, handle: &str, tail: i64) -> Result<String, DriverError>;
}
