//! In-memory repository used by tests and embedded deployments.
//!
//! Implements the same optimistic versioning contract as the Postgres
//! repository, so the executor/monitor race semantics can be exercised
//! without a database.

use super::{DeploymentRepository, RepositoryError};
use crate::models::{Deployment, DeploymentFilter};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryRepository {
    rows: RwLock<HashMap<Uuid, Deployment>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentRepository for InMemoryRepository {
    async fn insert(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        let mut rows = self.rows.write().await;
        if rows
            .values()
            .any(|d| d.owner_id == deployment.owner_id && d.name == deployment.name)
        {
            return Err(RepositoryError::Duplicate {
                owner_id: deployment.owner_id,
                name: deployment.name.clone(),
            });
        }
        rows.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Deployment>, RepositoryError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn find_by_name(
        &self,
        owner_id: Uuid,
        name: &str,
    ) -> Result<Option<Deployment>, RepositoryError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|d| d.owner_id == owner_id && d.name == name)
            .cloned())
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>, RepositoryError> {
        let rows = self.rows.read().await;
        let mut matched: Vec<Deployment> =
            rows.values().filter(|d| filter.matches(d)).cloned().collect();
        matched.sort_by_key(|d| d.created_at);
        Ok(matched)
    }

    async fn update(&self, deployment: &Deployment) -> Result<Deployment, RepositoryError> {
        let mut rows = self.rows.write().await;
        let stored = rows
            .get_mut(&deployment.id)
            .ok_or(RepositoryError::NotFound(deployment.id))?;

        if stored.version != deployment.version {
            return Err(RepositoryError::StaleVersion {
                id: deployment.id,
                expected: deployment.version,
            });
        }

        let mut updated = deployment.clone();
        updated.version = deployment.version + 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut rows = self.rows.write().await;
        rows.remove(&id).ok_or(RepositoryError::NotFound(id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Environment, NewDeployment};
    use crate::state_machine::DeploymentStatus;
    use std::collections::HashMap;

    fn sample(name: &str, owner_id: Uuid) -> Deployment {
        Deployment::from_request(NewDeployment {
            name: name.to_string(),
            mcp_server_id: Uuid::new_v4(),
            owner_id,
            environment: Environment::Development,
            image_reference: "registry.local/mcp/sample:1".to_string(),
            replica_count: 1,
            cpu_limit: "500m".to_string(),
            memory_limit: "512Mi".to_string(),
            environment_variables: HashMap::new(),
            container_port: 8080,
            health_check_path: "/health".to_string(),
            health_check_interval_seconds: 30,
        })
    }

    #[tokio::test]
    async fn test_insert_get_roundtrip() {
        let repo = InMemoryRepository::new();
        let deployment = sample("alpha", Uuid::new_v4());
        repo.insert(&deployment).await.unwrap();

        let fetched = repo.get(deployment.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "alpha");
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_per_owner() {
        let repo = InMemoryRepository::new();
        let owner = Uuid::new_v4();
        repo.insert(&sample("alpha", owner)).await.unwrap();

        let duplicate = repo.insert(&sample("alpha", owner)).await;
        assert!(matches!(duplicate, Err(RepositoryError::Duplicate { .. })));

        // Same name under a different owner is fine.
        repo.insert(&sample("alpha", Uuid::new_v4())).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let repo = InMemoryRepository::new();
        let mut deployment = sample("alpha", Uuid::new_v4());
        repo.insert(&deployment).await.unwrap();

        deployment.status = DeploymentStatus::Deploying;
        let updated = repo.update(&deployment).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, DeploymentStatus::Deploying);
    }

    #[tokio::test]
    async fn test_stale_update_rejected() {
        let repo = InMemoryRepository::new();
        let deployment = sample("alpha", Uuid::new_v4());
        repo.insert(&deployment).await.unwrap();

        // First writer wins.
        let mut first = deployment.clone();
        first.status = DeploymentStatus::Deploying;
        repo.update(&first).await.unwrap();

        // Second writer still holds version 1 and must lose.
        let mut second = deployment.clone();
        second.status = DeploymentStatus::Stopping;
        let result = repo.update(&second).await;
        assert!(matches!(
            result,
            Err(RepositoryError::StaleVersion { expected: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let repo = InMemoryRepository::new();
        let owner = Uuid::new_v4();
        repo.insert(&sample("alpha", owner)).await.unwrap();
        repo.insert(&sample("beta", owner)).await.unwrap();
        repo.insert(&sample("gamma", Uuid::new_v4())).await.unwrap();

        let all = repo.list(&DeploymentFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let mine = repo
            .list(&DeploymentFilter {
                owner_id: Some(owner),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_removes_row() {
        let repo = InMemoryRepository::new();
        let deployment = sample("alpha", Uuid::new_v4());
        repo.insert(&deployment).await.unwrap();
        repo.delete(deployment.id).await.unwrap();
        assert!(repo.get(deployment.id).await.unwrap().is_none());
        assert!(matches!(
            repo.delete(deployment.id).await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
