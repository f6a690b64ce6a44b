//! PostgreSQL repository implementation.
//!
//! Queries are runtime-bound (no compile-time macro checking) so the crate
//! builds without a live database. The `version` column implements the
//! optimistic concurrency check: updates apply only when the stored version
//! still matches, and every applied write increments it.

use super::{DeploymentRepository, RepositoryError};
use crate::models::{Deployment, DeploymentFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

/// Table schema, applied idempotently at startup.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deployments (
    id UUID PRIMARY KEY,
    mcp_server_id UUID NOT NULL,
    owner_id UUID NOT NULL,
    name TEXT NOT NULL,
    environment TEXT NOT NULL,
    image_reference TEXT NOT NULL,
    status TEXT NOT NULL,
    health TEXT NOT NULL,
    replica_count INTEGER NOT NULL,
    cpu_limit TEXT NOT NULL,
    memory_limit TEXT NOT NULL,
    environment_variables JSONB NOT NULL DEFAULT '{}'::jsonb,
    container_port INTEGER NOT NULL,
    health_check_path TEXT NOT NULL,
    health_check_interval_seconds BIGINT NOT NULL,
    backend_handle TEXT,
    endpoint_url TEXT,
    error_message TEXT,
    pending_removal BOOLEAN NOT NULL DEFAULT FALSE,
    version BIGINT NOT NULL DEFAULT 1,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    CONSTRAINT deployments_owner_name_unique UNIQUE (owner_id, name)
);
"#;

const SELECT_COLUMNS: &str = "id, mcp_server_id, owner_id, name, environment, image_reference, \
     status, health, replica_count, cpu_limit, memory_limit, environment_variables, \
     container_port, health_check_path, health_check_interval_seconds, backend_handle, \
     endpoint_url, error_message, pending_removal, version, created_at, updated_at";

/// Raw row shape; enum columns are TEXT and parsed on conversion.
#[derive(FromRow)]
struct DeploymentRow {
    id: Uuid,
    mcp_server_id: Uuid,
    owner_id: Uuid,
    name: String,
    environment: String,
    image_reference: String,
    status: String,
    health: String,
    replica_count: i32,
    cpu_limit: String,
    memory_limit: String,
    environment_variables: Json<HashMap<String, String>>,
    container_port: i32,
    health_check_path: String,
    health_check_interval_seconds: i64,
    backend_handle: Option<String>,
    endpoint_url: Option<String>,
    error_message: Option<String>,
    pending_removal: bool,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = RepositoryError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, value: &str| {
            RepositoryError::Database(format!("corrupt {field} value in database: {value}"))
        };
        Ok(Self {
            id: row.id,
            mcp_server_id: row.mcp_server_id,
            owner_id: row.owner_id,
            environment: row
                .environment
                .parse()
                .map_err(|_| corrupt("environment", &row.environment))?,
            status: row
                .status
                .parse()
                .map_err(|_| corrupt("status", &row.status))?,
            health: row
                .health
                .parse()
                .map_err(|_| corrupt("health", &row.health))?,
            name: row.name,
            image_reference: row.image_reference,
            replica_count: row.replica_count,
            cpu_limit: row.cpu_limit,
            memory_limit: row.memory_limit,
            environment_variables: row.environment_variables.0,
            container_port: row.container_port,
            health_check_path: row.health_check_path,
            health_check_interval_seconds: row.health_check_interval_seconds,
            backend_handle: row.backend_handle,
            endpoint_url: row.endpoint_url,
            error_message: row.error_message,
            pending_removal: row.pending_removal,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and ensure the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let repository = Self::new(pool);
        repository.ensure_schema().await?;
        Ok(repository)
    }

    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DeploymentRepository for PostgresRepository {
    async fn insert(&self, deployment: &Deployment) -> Result<(), RepositoryError> {
        let sql = format!(
            "INSERT INTO deployments ({SELECT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
        );
        let result = sqlx::query(&sql)
            .bind(deployment.id)
            .bind(deployment.mcp_server_id)
            .bind(deployment.owner_id)
            .bind(&deployment.name)
            .bind(deployment.environment.to_string())
            .bind(&deployment.image_reference)
            .bind(deployment.status.to_string())
            .bind(deployment.health.to_string())
            .bind(deployment.replica_count)
            .bind(&deployment.cpu_limit)
            .bind(&deployment.memory_limit)
            .bind(Json(&deployment.environment_variables))
            .bind(deployment.container_port)
            .bind(&deployment.health_check_path)
            .bind(deployment.health_check_interval_seconds)
            .bind(&deployment.backend_handle)
            .bind(&deployment.endpoint_url)
            .bind(&deployment.error_message)
            .bind(deployment.pending_removal)
            .bind(deployment.version)
            .bind(deployment.created_at)
            .bind(deployment.updated_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(RepositoryError::Duplicate {
                    owner_id: deployment.owner_id,
                    name: deployment.name.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Deployment>, RepositoryError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM deployments WHERE id = $1");
        let row: Option<DeploymentRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Deployment::try_from).transpose()
    }

    async fn find_by_name(
        &self,
        owner_id: Uuid,
        name: &str,
    ) -> Result<Option<Deployment>, RepositoryError> {
        let sql =
            format!("SELECT {SELECT_COLUMNS} FROM deployments WHERE owner_id = $1 AND name = $2");
        let row: Option<DeploymentRow> = sqlx::query_as(&sql)
            .bind(owner_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Deployment::try_from).transpose()
    }

    async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>, RepositoryError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM deployments \
             WHERE ($1::uuid IS NULL OR owner_id = $1) \
               AND ($2::text IS NULL OR environment = $2) \
               AND ($3::text IS NULL OR status = $3) \
             ORDER BY created_at"
        );
        let rows: Vec<DeploymentRow> = sqlx::query_as(&sql)
            .bind(filter.owner_id)
            .bind(filter.environment.map(|e| e.to_string()))
            .bind(filter.status.map(|s| s.to_string()))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Deployment::try_from).collect()
    }

    async fn update(&self, deployment: &Deployment) -> Result<Deployment, RepositoryError> {
        let sql = format!(
            "UPDATE deployments SET \
                 status = $3, health = $4, replica_count = $5, cpu_limit = $6, \
                 memory_limit = $7, environment_variables = $8, container_port = $9, \
                 health_check_path = $10, health_check_interval_seconds = $11, \
                 image_reference = $12, backend_handle = $13, endpoint_url = $14, \
                 error_message = $15, pending_removal = $16, version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND version = $2 \
             RETURNING {SELECT_COLUMNS}"
        );
        let row: Option<DeploymentRow> = sqlx::query_as(&sql)
            .bind(deployment.id)
            .bind(deployment.version)
            .bind(deployment.status.to_string())
            .bind(deployment.health.to_string())
            .bind(deployment.replica_count)
            .bind(&deployment.cpu_limit)
            .bind(&deployment.memory_limit)
            .bind(Json(&deployment.environment_variables))
            .bind(deployment.container_port)
            .bind(&deployment.health_check_path)
            .bind(deployment.health_check_interval_seconds)
            .bind(&deployment.image_reference)
            .bind(&deployment.backend_handle)
            .bind(&deployment.endpoint_url)
            .bind(&deployment.error_message)
            .bind(deployment.pending_removal)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Deployment::try_from(row),
            // Zero rows: distinguish a stale version from a deleted row.
            None => {
                if self.get(deployment.id).await?.is_some() {
                    Err(RepositoryError::StaleVersion {
                        id: deployment.id,
                        expected: deployment.version,
                    })
                } else {
                    Err(RepositoryError::NotFound(deployment.id))
                }
            }
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id));
        }
        Ok(())
    }
}
