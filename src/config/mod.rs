//! # Orchestrator Configuration System
//!
//! Typed configuration for the deployment orchestration core. All tunables
//! are explicit: worker pool sizing, retry/backoff policy, health monitoring
//! cadence, event channel capacity, and the container backend selection.
//!
//! Configuration is loaded from an optional TOML file layered with
//! `MCPHUB__`-prefixed environment variables (see [`loader::ConfigManager`]),
//! and validated before use. There are no silent fallbacks at call sites.

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use loader::ConfigManager;

/// Which container backend the orchestrator drives.
///
/// Selected once at orchestrator construction; never branched per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Single-host containers via the Docker engine.
    Docker,
    /// Cluster workloads via the Kubernetes API.
    Kubernetes,
}

/// Container backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend implementation to construct at startup.
    pub kind: BackendKind,
    /// Namespace for cluster objects (ignored by the Docker backend).
    pub namespace: String,
    /// Container port exposed by generated MCP server images.
    pub container_port: i32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Kubernetes,
            namespace: "mcp-servers".to_string(),
            container_port: 8080,
        }
    }
}

/// Bounded worker pool configuration for the task executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of provisioning tasks running concurrently.
    pub max_workers: usize,
    /// Additional tasks allowed to queue behind the running set.
    pub queue_capacity: usize,
    /// Drain window for in-flight tasks on shutdown.
    pub shutdown_drain_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            queue_capacity: 32,
            shutdown_drain_seconds: 30,
        }
    }
}

impl ExecutorConfig {
    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_seconds)
    }
}

/// Retry and backoff policy for transient driver failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts (first try included) before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay.
    pub max_delay_ms: u64,
    /// How long to poll the backend for readiness after a deploy/scale.
    pub readiness_timeout_seconds: u64,
    /// Interval between readiness polls.
    pub readiness_poll_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            readiness_timeout_seconds: 300,
            readiness_poll_interval_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff delay for a (1-based) attempt number, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_seconds)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Default polling interval when a deployment does not specify one.
    pub default_interval_seconds: i64,
    /// Bounded auto-recovery attempts before declaring a deployment unhealthy.
    pub max_recovery_attempts: u32,
    /// Deadline for a single driver status call during a health pass.
    pub driver_timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            default_interval_seconds: 30,
            max_recovery_attempts: 3,
            driver_timeout_seconds: 10,
        }
    }
}

impl HealthConfig {
    pub fn driver_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_timeout_seconds)
    }
}

/// Status publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Per-subscriber buffer; lagging subscribers drop the oldest events.
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/mcphub_development".to_string(),
            pool: 10,
        }
    }
}

/// Root configuration for the orchestration core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub backend: BackendConfig,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
    pub events: EventConfig,
    pub database: DatabaseConfig,
}

impl OrchestratorConfig {
    /// Validate cross-field constraints. Called by the loader; callers
    /// constructing a config by hand should invoke this themselves.
    pub fn validate(&self) -> Result<(), String> {
        if self.executor.max_workers == 0 {
            return Err("executor.max_workers must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("retry.base_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        if self.health.default_interval_seconds < 10 || self.health.default_interval_seconds > 300
        {
            return Err(
                "health.default_interval_seconds must be within 10..=300".to_string(),
            );
        }
        if self.events.channel_capacity == 0 {
            return Err("events.channel_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}
