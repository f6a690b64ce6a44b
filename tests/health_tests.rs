//! Health reconciliation: classification, independence from the lifecycle
//! axis, bounded auto-recovery, and lease-aware skipping.

mod common;

use common::{fast_config, harness, harness_with, request, wait_for_gone, wait_for_status};
use deploy_core::driver::DriverError;
use deploy_core::repository::DeploymentRepository;
use deploy_core::state_machine::{DeploymentStatus, HealthState};
use deploy_core::test_helpers::{degraded_status, failed_status};
use deploy_core::HealthMonitor;
use std::time::Duration;
use uuid::Uuid;

/// Poll until the monitor's watcher count settles at `expected`.
async fn wait_for_watched(monitor: &HealthMonitor, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while monitor.watched_count() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "watcher count never reached {expected}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_degraded_observation_leaves_status_running() {
    let h = harness();
    let created = h.orchestrator.create_deployment(request("wobbly")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    let monitor = h.orchestrator.health_monitor();

    h.driver.push_status(degraded_status(3, 1));
    let observed = monitor.check_now(created.id).await.unwrap();
    assert_eq!(observed, Some(HealthState::Degraded));

    let row = h.repository.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeploymentStatus::Running);
    assert_eq!(row.health, HealthState::Degraded);

    // Next pass sees the backend ready again and health recovers.
    let observed = monitor.check_now(created.id).await.unwrap();
    assert_eq!(observed, Some(HealthState::Healthy));
}

#[tokio::test]
async fn test_connectivity_loss_degrades_knowledge_not_deployment() {
    let h = harness();
    let created = h.orchestrator.create_deployment(request("unreachable")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    let monitor = h.orchestrator.health_monitor();

    h.driver.fail_next(
        "get_status",
        DriverError::Connection("api server unreachable".to_string()),
    );
    let observed = monitor.check_now(created.id).await.unwrap();
    assert_eq!(observed, Some(HealthState::Unknown));

    let row = h.repository.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeploymentStatus::Running);
    // No recovery attempt was burned on a connectivity failure.
    assert_eq!(h.driver.scale_calls().len(), 1);
}

#[tokio::test]
async fn test_recovery_exhaustion_fails_into_error() {
    let mut config = fast_config();
    config.health.max_recovery_attempts = 2;
    let h = harness_with(config);

    let created = h.orchestrator.create_deployment(request("sickly")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    let monitor = h.orchestrator.health_monitor();
    let deploy_scales = h.driver.scale_calls().len();

    // Two unhealthy passes trigger recovery attempts; the third exhausts.
    for _ in 0..3 {
        h.driver.push_status(failed_status("container crash looping"));
        let observed = monitor.check_now(created.id).await.unwrap();
        assert_eq!(observed, Some(HealthState::Unhealthy));
    }

    let row = h.repository.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeploymentStatus::Error);
    assert_eq!(row.health, HealthState::Unhealthy);
    assert!(row.error_message.unwrap().contains("recovery"));
    assert_eq!(h.driver.scale_calls().len(), deploy_scales + 2);

    // An errored deployment can still be stopped.
    h.orchestrator.stop_deployment(created.id).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Stopped).await;
}

#[tokio::test]
async fn test_health_pass_skips_while_operation_in_flight() {
    let h = harness();
    let created = h.orchestrator.create_deployment(request("busy")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    let monitor = h.orchestrator.health_monitor();

    h.driver.set_delay("scale", Duration::from_millis(200));
    h.orchestrator.scale_deployment(created.id, 2).await.unwrap();

    // Lease is held by the scale task; the pass stands aside.
    assert_eq!(monitor.check_now(created.id).await.unwrap(), None);

    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    assert_eq!(
        monitor.check_now(created.id).await.unwrap(),
        Some(HealthState::Healthy)
    );
}

#[tokio::test]
async fn test_check_now_on_missing_or_terminal_records() {
    let h = harness();
    let monitor = h.orchestrator.health_monitor();
    assert_eq!(monitor.check_now(Uuid::new_v4()).await.unwrap(), None);

    let created = h.orchestrator.create_deployment(request("done")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    h.orchestrator.stop_deployment(created.id).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Stopped).await;

    assert_eq!(monitor.check_now(created.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_watchers_follow_the_lifecycle_automatically() {
    let h = harness();
    let monitor = h.orchestrator.health_monitor();
    assert_eq!(monitor.watched_count(), 0);

    // Reaching RUNNING starts the watcher without any external wiring.
    let created = h.orchestrator.create_deployment(request("auto-watched")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    wait_for_watched(&monitor, 1).await;

    h.orchestrator.stop_deployment(created.id).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Stopped).await;
    wait_for_watched(&monitor, 0).await;

    h.orchestrator.start_deployment(created.id).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    wait_for_watched(&monitor, 1).await;

    h.orchestrator.delete_deployment(created.id).await.unwrap();
    wait_for_gone(&h, created.id).await;
    wait_for_watched(&monitor, 0).await;
}

#[tokio::test]
async fn test_health_probe_does_not_block_user_mutations() {
    let h = harness();
    let created = h.orchestrator.create_deployment(request("probed")).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    let monitor = h.orchestrator.health_monitor();

    // Keep the status probe observably in flight.
    h.driver.set_delay("get_status", Duration::from_millis(300));
    let pass = tokio::spawn({
        let monitor = monitor.clone();
        let id = created.id;
        async move { monitor.check_now(id).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The read-only probe holds no lease, so the scale is admitted.
    h.orchestrator.scale_deployment(created.id, 2).await.unwrap();
    pass.await.unwrap().unwrap();

    let running = wait_for_status(&h, created.id, DeploymentStatus::Running).await;
    assert_eq!(running.replica_count, 2);
}

#[tokio::test]
async fn test_resume_watches_only_live_records() {
    let h = harness();
    let monitor = h.orchestrator.health_monitor();

    let a = h.orchestrator.create_deployment(request("live-a")).await.unwrap();
    let b = h.orchestrator.create_deployment(request("live-b")).await.unwrap();
    wait_for_status(&h, a.id, DeploymentStatus::Running).await;
    wait_for_status(&h, b.id, DeploymentStatus::Running).await;

    h.orchestrator.stop_deployment(b.id).await.unwrap();
    wait_for_status(&h, b.id, DeploymentStatus::Stopped).await;
    wait_for_watched(&monitor, 1).await;

    let watched = monitor.resume().await.unwrap();
    assert_eq!(watched, 1);
    assert_eq!(monitor.watched_count(), 1);

    monitor.unwatch(a.id);
    assert_eq!(monitor.watched_count(), 0);

    monitor.stop();
}

#[tokio::test(start_paused = true)]
async fn test_watcher_ticks_on_deployment_interval() {
    let h = harness();
    let mut req = request("ticking");
    req.health_check_interval_seconds = 10;
    let created = h.orchestrator.create_deployment(req).await.unwrap();
    wait_for_status(&h, created.id, DeploymentStatus::Running).await;

    let monitor = h.orchestrator.health_monitor();
    let row = h.repository.get(created.id).await.unwrap().unwrap();
    monitor.watch(&row);

    h.driver.push_status(degraded_status(1, 0));

    // Paused-time test: sleeping past the interval advances the clock and
    // lets the watcher run its pass.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let row = h.repository.get(created.id).await.unwrap().unwrap();
        if row.health == HealthState::Unhealthy {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "watcher never observed the scripted status"
        );
    }

    monitor.stop();
}
