//! Deployment record and its request/filter types.
//!
//! One `Deployment` row exists per deployed instance of a generated MCP
//! server. The row is the single source of truth for callers: `status` is the
//! lifecycle position, `health` the independently tracked operational
//! condition, and `version` the optimistic-concurrency counter bumped on
//! every persisted write.

use crate::error::OrchestrationError;
use crate::state_machine::{DeploymentStatus, HealthState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Inclusive replica count bounds enforced at every mutation.
pub const REPLICA_MIN: i32 = 1;
pub const REPLICA_MAX: i32 = 10;

/// Inclusive health check interval bounds (seconds).
pub const HEALTH_INTERVAL_MIN: i64 = 10;
pub const HEALTH_INTERVAL_MAX: i64 = 300;

/// Target environment for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            _ => Err(format!("Invalid environment: {s}")),
        }
    }
}

/// Persisted deployment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    /// Reference to the generated server image/spec, owned externally.
    pub mcp_server_id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub environment: Environment,
    /// Image reference consumed from the generator service.
    pub image_reference: String,
    pub status: DeploymentStatus,
    pub health: HealthState,
    pub replica_count: i32,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub environment_variables: HashMap<String, String>,
    pub container_port: i32,
    pub health_check_path: String,
    pub health_check_interval_seconds: i64,
    /// Opaque reference to the backend object. Owned by the driver; the
    /// deployment only looks it up, the driver decides whether it still
    /// exists.
    pub backend_handle: Option<String>,
    pub endpoint_url: Option<String>,
    pub error_message: Option<String>,
    /// Set once a delete has been accepted. A restarted process finishes the
    /// removal instead of resurrecting the record as merely stopped.
    #[serde(default)]
    pub pending_removal: bool,
    /// Optimistic-concurrency counter, incremented on every persisted write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Construct a fresh PENDING record from a validated create request.
    pub fn from_request(request: NewDeployment) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mcp_server_id: request.mcp_server_id,
            owner_id: request.owner_id,
            name: request.name,
            environment: request.environment,
            image_reference: request.image_reference,
            status: DeploymentStatus::Pending,
            health: HealthState::Unknown,
            replica_count: request.replica_count,
            cpu_limit: request.cpu_limit,
            memory_limit: request.memory_limit,
            environment_variables: request.environment_variables,
            container_port: request.container_port,
            health_check_path: request.health_check_path,
            health_check_interval_seconds: request.health_check_interval_seconds,
            backend_handle: None,
            endpoint_url: None,
            error_message: None,
            pending_removal: false,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Logical name of the backend workload object. Used for idempotent
    /// creation: the driver adopts an existing object with this name.
    pub fn workload_name(&self) -> String {
        format!("mcp-{}", self.name)
    }

    /// Name of the cluster service object fronting the workload.
    pub fn service_name(&self) -> String {
        format!("mcp-{}-service", self.name)
    }
}

/// Create request, consumed by `Orchestrator::create_deployment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeployment {
    pub name: String,
    pub mcp_server_id: Uuid,
    pub owner_id: Uuid,
    pub environment: Environment,
    /// `{mcp_server_id, image_reference}` pair comes from the generator
    /// service; the orchestrator only consumes the finished image.
    pub image_reference: String,
    #[serde(default = "default_replica_count")]
    pub replica_count: i32,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default)]
    pub environment_variables: HashMap<String, String>,
    #[serde(default = "default_container_port")]
    pub container_port: i32,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: i64,
}

fn default_replica_count() -> i32 {
    1
}

fn default_cpu_limit() -> String {
    "500m".to_string()
}

fn default_memory_limit() -> String {
    "512Mi".to_string()
}

fn default_container_port() -> i32 {
    8080
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_health_check_interval() -> i64 {
    30
}

impl NewDeployment {
    /// Synchronous input validation, performed before any persistence.
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.name.is_empty() {
            return Err(OrchestrationError::Validation(
                "name must not be empty".to_string(),
            ));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.name.starts_with('-')
            || self.name.ends_with('-')
            || self.name.len() > 53
        {
            return Err(OrchestrationError::Validation(format!(
                "name '{}' must be a DNS label (lowercase alphanumerics and hyphens)",
                self.name
            )));
        }
        validate_replica_count(self.replica_count)?;
        if self.health_check_interval_seconds < HEALTH_INTERVAL_MIN
            || self.health_check_interval_seconds > HEALTH_INTERVAL_MAX
        {
            return Err(OrchestrationError::Validation(format!(
                "health_check_interval_seconds {} outside allowed range {HEALTH_INTERVAL_MIN}..={HEALTH_INTERVAL_MAX}",
                self.health_check_interval_seconds
            )));
        }
        if self.image_reference.is_empty() {
            return Err(OrchestrationError::Validation(
                "image_reference must not be empty".to_string(),
            ));
        }
        if !(1..=65535).contains(&self.container_port) {
            return Err(OrchestrationError::Validation(format!(
                "container_port {} is not a valid port",
                self.container_port
            )));
        }
        Ok(())
    }
}

/// Validate replica bounds; enforced at creation and at every scale request.
pub fn validate_replica_count(replicas: i32) -> Result<(), OrchestrationError> {
    if !(REPLICA_MIN..=REPLICA_MAX).contains(&replicas) {
        return Err(OrchestrationError::Validation(format!(
            "replica_count {replicas} outside allowed range {REPLICA_MIN}..={REPLICA_MAX}"
        )));
    }
    Ok(())
}

/// Partial update request, consumed by `Orchestrator::update_deployment`.
///
/// Only the provided fields change; the rest of the record is kept as-is.
/// Replica count changes go through `scale_deployment` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentUpdate {
    pub image_reference: Option<String>,
    pub environment_variables: Option<HashMap<String, String>>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub health_check_path: Option<String>,
    pub health_check_interval_seconds: Option<i64>,
}

impl DeploymentUpdate {
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.image_reference.as_deref() == Some("") {
            return Err(OrchestrationError::Validation(
                "image_reference must not be empty".to_string(),
            ));
        }
        if let Some(interval) = self.health_check_interval_seconds {
            if !(HEALTH_INTERVAL_MIN..=HEALTH_INTERVAL_MAX).contains(&interval) {
                return Err(OrchestrationError::Validation(format!(
                    "health_check_interval_seconds {interval} outside allowed range {HEALTH_INTERVAL_MIN}..={HEALTH_INTERVAL_MAX}"
                )));
            }
        }
        if self.is_empty() {
            return Err(OrchestrationError::Validation(
                "update request changes nothing".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.image_reference.is_none()
            && self.environment_variables.is_none()
            && self.cpu_limit.is_none()
            && self.memory_limit.is_none()
            && self.health_check_path.is_none()
            && self.health_check_interval_seconds.is_none()
    }

    /// Apply the requested changes to a deployment record in place.
    pub fn apply_to(&self, deployment: &mut Deployment) {
        if let Some(image) = &self.image_reference {
            deployment.image_reference = image.clone();
        }
        if let Some(env) = &self.environment_variables {
            deployment.environment_variables = env.clone();
        }
        if let Some(cpu) = &self.cpu_limit {
            deployment.cpu_limit = cpu.clone();
        }
        if let Some(memory) = &self.memory_limit {
            deployment.memory_limit = memory.clone();
        }
        if let Some(path) = &self.health_check_path {
            deployment.health_check_path = path.clone();
        }
        if let Some(interval) = self.health_check_interval_seconds {
            deployment.health_check_interval_seconds = interval;
        }
    }
}

/// Filter for `list_deployments`. All fields optional; empty filter lists
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentFilter {
    pub owner_id: Option<Uuid>,
    pub environment: Option<Environment>,
    pub status: Option<DeploymentStatus>,
}

impl DeploymentFilter {
    pub fn matches(&self, deployment: &Deployment) -> bool {
        self.owner_id.is_none_or(|o| o == deployment.owner_id)
            && self.environment.is_none_or(|e| e == deployment.environment)
            && self.status.is_none_or(|s| s == deployment.status)
    }
}
