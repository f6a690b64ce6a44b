//! Shared harness for the integration suites: an orchestrator wired to the
//! in-memory repository and the scriptable driver, with retry and polling
//! intervals shrunk so tests settle in milliseconds.

#![allow(dead_code)]

use deploy_core::config::{ExecutorConfig, OrchestratorConfig, RetryConfig};
use deploy_core::models::{Deployment, Environment, NewDeployment};
use deploy_core::repository::{DeploymentRepository, InMemoryRepository};
use deploy_core::state_machine::DeploymentStatus;
use deploy_core::test_helpers::ScriptedDriver;
use deploy_core::Orchestrator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub repository: Arc<InMemoryRepository>,
    pub driver: Arc<ScriptedDriver>,
}

pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.executor = ExecutorConfig {
        max_workers: 4,
        queue_capacity: 4,
        shutdown_drain_seconds: 2,
    };
    config.retry = RetryConfig {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 40,
        readiness_timeout_seconds: 2,
        readiness_poll_interval_ms: 20,
    };
    config
}

pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let repository = Arc::new(InMemoryRepository::new());
    let driver = Arc::new(ScriptedDriver::new());
    let orchestrator = Orchestrator::new(repository.clone(), driver.clone(), config)
        .expect("test config should validate");
    Harness {
        orchestrator,
        repository,
        driver,
    }
}

/// A valid create request with test defaults.
pub fn request(name: &str) -> NewDeployment {
    NewDeployment {
        name: name.to_string(),
        mcp_server_id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        environment: Environment::Development,
        image_reference: format!("registry.local/mcp/{name}:1.0"),
        replica_count: 1,
        cpu_limit: "500m".to_string(),
        memory_limit: "512Mi".to_string(),
        environment_variables: HashMap::new(),
        container_port: 8080,
        health_check_path: "/health".to_string(),
        health_check_interval_seconds: 30,
    }
}

/// Poll the repository until the deployment reaches `status`.
pub async fn wait_for_status(
    harness: &Harness,
    id: Uuid,
    status: DeploymentStatus,
) -> Deployment {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(deployment) = harness.repository.get(id).await.expect("repository read") {
            if deployment.status == status {
                return deployment;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for deployment {id} to reach {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the repository until the deployment record is gone.
pub async fn wait_for_gone(harness: &Harness, id: Uuid) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if harness
            .repository
            .get(id)
            .await
            .expect("repository read")
            .is_none()
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for deployment {id} to be removed"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
