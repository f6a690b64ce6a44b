//! Mutual exclusion, queue bounds, cancellation, shutdown, and startup
//! reconciliation.

mod common;

use common::{fast_config, harness, harness_with, request, wait_for_gone, wait_for_status};
use deploy_core::config::ExecutorConfig;
use deploy_core::driver::{ContainerDriver, ContainerSpec};
use deploy_core::models::Deployment;
use deploy_core::repository::DeploymentRepository;
use deploy_core::state_machine::{DeploymentStatus, HealthState};
use deploy_core::test_helpers::degraded_status;
use deploy_core::OrchestrationError;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_mutation_conflicts() {
    let h = harness();
    h.driver.set_delay("create", Duration::from_millis(200));

    let created = h.orchestrator.create_deployment(request("contended")).await.unwrap();

    // A second mutating operation on the same id conflicts while the deploy
    // task holds the lease.
    match h.orchestrator.scale_deployment(created.id, 2).await {
        Err(OrchestrationError::OperationInFlight(id)) => assert_eq!(id, created.id),
        other => panic!("expected OperationInFlight, got {other:?}"),
    }

    // Operations on other deployments are unaffected.
    h.orchestrator.create_deployment(request("unrelated")).await.unwrap();

    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    h.orchestrator.scale_deployment(created.id, 2).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
}

#[tokio::test]
async fn test_queue_overflow_rejected_and_record_stays_pending() {
    let mut config = fast_config();
    config.executor = ExecutorConfig {
        max_workers: 1,
        queue_capacity: 1,
        shutdown_drain_seconds: 2,
    };
    let h = harness_with(config);
    h.driver.set_delay("create", Duration::from_millis(300));

    let first = h.orchestrator.create_deployment(request("slot-a")).await.unwrap();
    let second = h.orchestrator.create_deployment(request("slot-b")).await.unwrap();

    let third = h.orchestrator.create_deployment(request("slot-c")).await;
    match third {
        Err(OrchestrationError::QueueFull { capacity }) => assert_eq!(capacity, 2),
        other => panic!("expected QueueFull, got {other:?}"),
    }

    // The rejected record stays PENDING and can be resubmitted later.
    let rows = h
        .repository
        .list(&deploy_core::DeploymentFilter {
            status: Some(DeploymentStatus::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "slot-c");

    wait_for_status(&h, first.id, DeploymentStatus::Running).await;
    wait_for_status(&h, second.id, DeploymentStatus::Running).await;

    h.orchestrator.start_deployment(rows[0].id).await.unwrap();
    wait_for_status(&h, rows[0].id, DeploymentStatus::Running).await;
}

#[tokio::test]
async fn test_stop_during_deploy_cancels_into_stopped() {
    let h = harness();
    // Keep the deploy in its readiness poll so the cancel lands there.
    for _ in 0..200 {
        h.driver.push_status(degraded_status(1, 0));
    }

    let created = h.orchestrator.create_deployment(request("cancel-me")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Deploying).await;
    // Let the deploy reach its readiness poll before cancelling.
    while !h.driver.has_object("mcp-cancel-me") {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Delivered as a cancellation, not a conflict.
    h.orchestrator.stop_deployment(created.id).await.unwrap();

    let stopped = wait_for_status(&h, created.id, DeploymentStatus::Stopped).await;
    assert_eq!(stopped.health, HealthState::Unknown);
    // The partially provisioned object was stopped, not force-killed away.
    assert!(h.driver.has_object("mcp-cancel-me"));
}

#[tokio::test]
async fn test_delete_during_deploy_cancels_into_removal() {
    let h = harness();
    for _ in 0..200 {
        h.driver.push_status(degraded_status(1, 0));
    }

    let created = h.orchestrator.create_deployment(request("gone-soon")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Deploying).await;

    h.orchestrator.delete_deployment(created.id).await.unwrap();
    wait_for_gone(&h, created.id).await;
    assert!(!h.driver.has_object("mcp-gone-soon"));
}

#[tokio::test]
async fn test_delete_during_stop_upgrades_teardown() {
    let h = harness();
    let created = h
        .orchestrator
        .create_deployment(request("stop-then-delete"))
        .await
        .unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;

    // Keep the stop observably in flight, then deliver a delete against it.
    h.driver.set_delay("stop", Duration::from_millis(200));
    h.orchestrator.stop_deployment(created.id).await.unwrap();
    h.orchestrator.delete_deployment(created.id).await.unwrap();

    // The acknowledged delete upgrades the teardown: the record and the
    // backend object are both gone, not settled as merely stopped.
    wait_for_gone(&h, created.id).await;
    assert!(!h.driver.has_object("mcp-stop-then-delete"));
}

#[tokio::test]
async fn test_shutdown_drains_inflight_work_then_rejects() {
    let h = harness();
    h.driver.set_delay("create", Duration::from_millis(100));

    let created = h.orchestrator.create_deployment(request("draining")).await.unwrap();
    h.orchestrator.shutdown().await;

    // The in-flight deploy finished inside the drain window.
    let settled = h.repository.get(created.id).await.unwrap().unwrap();
    assert_eq!(settled.status, DeploymentStatus::Running);

    assert!(matches!(
        h.orchestrator.create_deployment(request("too-late")).await,
        Err(OrchestrationError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_recover_settles_abandoned_transitional_records() {
    let h = harness();

    // Abandoned mid-deploy before the backend object existed.
    let mut dead = Deployment::from_request(request("abandoned-deploy"));
    dead.status = DeploymentStatus::Deploying;
    h.repository.insert(&dead).await.unwrap();

    // Abandoned mid-stop; teardown is retried best-effort.
    let mut stopping = Deployment::from_request(request("abandoned-stop"));
    stopping.status = DeploymentStatus::Stopping;
    stopping.backend_handle = Some("mcp-abandoned-stop".to_string());
    h.repository.insert(&stopping).await.unwrap();

    // Abandoned mid-deploy with a healthy backend object: adopted as RUNNING.
    let mut alive = Deployment::from_request(request("abandoned-alive"));
    alive.status = DeploymentStatus::Deploying;
    let spec = ContainerSpec::from_deployment(&alive);
    let handle = h.driver.create(&spec).await.unwrap();
    alive.backend_handle = Some(handle);
    h.repository.insert(&alive).await.unwrap();

    // A stable record is left alone.
    let untouched = Deployment::from_request(request("stable"));
    h.repository.insert(&untouched).await.unwrap();

    let settled = h.orchestrator.recover().await.unwrap();
    assert_eq!(settled, 3);

    let dead = h.repository.get(dead.id).await.unwrap().unwrap();
    assert_eq!(dead.status, DeploymentStatus::Failed);
    assert!(dead.error_message.unwrap().contains("restart"));

    let stopping = h.repository.get(stopping.id).await.unwrap().unwrap();
    assert_eq!(stopping.status, DeploymentStatus::Stopped);

    let alive = h.repository.get(alive.id).await.unwrap().unwrap();
    assert_eq!(alive.status, DeploymentStatus::Running);
    assert_eq!(alive.health, HealthState::Healthy);

    let untouched = h.repository.get(untouched.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, DeploymentStatus::Pending);
}

#[tokio::test]
async fn test_recover_leaves_pending_rows_queued() {
    let h = harness();

    // A record inserted but never submitted (queue-full create, or a crash
    // between insert and submit). Nothing to reconcile against the backend.
    let pending = Deployment::from_request(request("never-submitted"));
    h.repository.insert(&pending).await.unwrap();

    let settled = h.orchestrator.recover().await.unwrap();
    assert_eq!(settled, 0);

    let row = h.repository.get(pending.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeploymentStatus::Pending);

    // The queued record deploys normally once resubmitted.
    h.orchestrator.start_deployment(pending.id).await.unwrap();
    wait_for_status(&h, pending.id, DeploymentStatus::Running).await;
}

#[tokio::test]
async fn test_recover_finishes_interrupted_delete() {
    let h = harness();

    // A delete accepted by a previous process but interrupted mid-teardown:
    // the persisted removal intent must not resurrect the record as stopped.
    let mut doomed = Deployment::from_request(request("half-deleted"));
    doomed.status = DeploymentStatus::Stopping;
    doomed.pending_removal = true;
    let spec = ContainerSpec::from_deployment(&doomed);
    let handle = h.driver.create(&spec).await.unwrap();
    doomed.backend_handle = Some(handle);
    h.repository.insert(&doomed).await.unwrap();

    let settled = h.orchestrator.recover().await.unwrap();
    assert_eq!(settled, 1);
    assert!(h.repository.get(doomed.id).await.unwrap().is_none());
    assert!(!h.driver.has_object("mcp-half-deleted"));
}

#[tokio::test]
async fn test_status_events_fan_out_to_subscribers() {
    let h = harness();
    let mut events = h.orchestrator.subscribe();

    let created = h.orchestrator.create_deployment(request("watched")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.deployment_id, created.id);
        seen.push(event);
    }

    assert_eq!(seen[0].message, "Deployment created");
    assert!(seen.iter().any(|e| e.status == DeploymentStatus::Deploying));
    let last = seen.last().unwrap();
    assert_eq!(last.status, DeploymentStatus::Running);
    assert_eq!(last.health, HealthState::Healthy);
}
