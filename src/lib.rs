#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, Kubernetes in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # MCP Hub Deployment Core
//!
//! Deployment orchestration core for generated MCP server instances:
//! lifecycle state management, container backend abstraction, bounded async
//! provisioning, and continuous health reconciliation.
//!
//! ## Overview
//!
//! The core owns the full lifecycle of a deployment — create, deploy, scale,
//! update, stop, restart, delete — as a persisted state machine with an
//! optimistic concurrency check on every write. Long-running provisioning
//! work runs on a bounded task executor under per-deployment exclusive
//! leases; an independent health monitor reconciles observed backend state
//! into each record without disturbing the lifecycle axis.
//!
//! ## Architecture
//!
//! Mutating operations all follow one shape: validate synchronously, acquire
//! the deployment's lease, persist the transition into a transitional state
//! (DEPLOYING, SCALING, UPDATING, STOPPING), then hand the real work to the
//! executor and return. Tasks settle the record back into a stable state
//! through the state machine, with bounded retries against the container
//! driver and cooperative cancellation at checkpoints.
//!
//! ## Module Organization
//!
//! - [`models`] - Deployment records, requests, filters, and status events
//! - [`state_machine`] - Lifecycle transition table and versioned persistence
//! - [`repository`] - PostgreSQL and in-memory deployment stores
//! - [`driver`] - Container backend abstraction (Docker, Kubernetes)
//! - [`executor`] - Bounded worker pool with per-deployment leases
//! - [`orchestrator`] - Public operations facade and background task bodies
//! - [`health`] - Periodic health reconciliation and bounded auto-recovery
//! - [`events`] - Broadcast status publisher
//! - [`config`] - Typed configuration with TOML and environment layering
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured tracing initialization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use deploy_core::config::OrchestratorConfig;
//! use deploy_core::orchestrator::{connect_driver, Orchestrator};
//! use deploy_core::repository::InMemoryRepository;
//! use std::sync::Arc;
//!
//! # async fn example() -> deploy_core::error::Result<()> {
//! let config = OrchestratorConfig::default();
//! let driver = connect_driver(&config.backend).await?;
//! let repository = Arc::new(InMemoryRepository::new());
//! let orchestrator = Orchestrator::new(repository, driver, config)?;
//!
//! orchestrator.recover().await?;
//! let monitor = orchestrator.health_monitor();
//! monitor.resume().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod repository;
pub mod state_machine;
pub mod test_helpers;

pub use config::OrchestratorConfig;
pub use error::{OrchestrationError, Result};
pub use health::HealthMonitor;
pub use models::{Deployment, DeploymentEvent, DeploymentFilter, DeploymentUpdate, NewDeployment};
pub use orchestrator::Orchestrator;
pub use state_machine::{DeploymentStatus, HealthState};
