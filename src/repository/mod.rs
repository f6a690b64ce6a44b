//! Durable store of deployment records.
//!
//! The repository is a leaf component: it never calls the driver or the
//! state machine. Every update is guarded by the optimistic `version`
//! counter so a stale writer (abandoned task, racing health pass) can never
//! clobber a newer row.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::models::{Deployment, DeploymentFilter};
use async_trait::async_trait;
use uuid::Uuid;

pub use memory::InMemoryRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRepository;

/// Errors raised by repository implementations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Deployment {0} not found")]
    NotFound(Uuid),

    #[error("Deployment named '{name}' already exists for owner {owner_id}")]
    Duplicate { owner_id: Uuid, name: String },

    /// The row was modified since it was read; the write was not applied.
    #[error("Stale version for deployment {id}: expected {expected}")]
    StaleVersion { id: Uuid, expected: i64 },

    #[error("Database error: {0}")]
    Database(String),
}

impl RepositoryError {
    /// True when the write lost an optimistic-concurrency race.
    pub fn is_stale_version(&self) -> bool {
        matches!(self, Self::StaleVersion { .. })
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for RepositoryError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(error.to_string())
    }
}

/// Durable store for deployment rows.
///
/// `update` applies the optimistic version check: the write succeeds only if
/// the stored version still equals `deployment.version`, and the returned
/// row carries the incremented version and refreshed `updated_at`.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn insert(&self, deployment: &Deployment) -> Result<(), RepositoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<Deployment>, RepositoryError>;

    async fn find_by_name(
        &self,
        owner_id: Uuid,
        name: &str,
    ) -> Result<Option<Deployment>, RepositoryError>;

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>, RepositoryError>;

    async fn update(&self, deployment: &Deployment) -> Result<Deployment, RepositoryError>;

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError>;
}
