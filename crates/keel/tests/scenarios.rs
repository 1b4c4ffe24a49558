//! End-to-end reconciliation scenarios against an in-memory cluster.
//!
//! Each test publishes manifests to the in-memory repository, registers an
//! Application and drives cycles explicitly through the harness.

mod common;

use std::time::Duration;

use serde_json::json;

use common::harness::test_settings;
use common::{AppBuilder, ManifestBuilder, ProjectBuilder, TestHarness, APP_NAMESPACE};
use keel::resource::{
    ConditionType, HookPhase, OperationPhase, ResourceResultCode, SyncStatusCode,
};
use keel::{ClusterApi, ControllerSettings, HealthStatus, ResourceKey, WatchEvent};

fn config_map_key(name: &str) -> ResourceKey {
    ResourceKey::new("", "ConfigMap", "default", name)
}

fn deployment_key(name: &str) -> ResourceKey {
    ResourceKey::new("apps", "Deployment", "default", name)
}

// ============================================================================
// Sync waves
// ============================================================================

#[tokio::test]
async fn test_earlier_wave_is_healthy_before_next_wave_is_created() {
    let h = TestHarness::new().await;
    h.roll_out_deployments();
    h.publish(
        "shop",
        vec![
            ManifestBuilder::deployment("database").wave(-1).build(),
            ManifestBuilder::config_map("frontend")
                .data("DATABASE_HOST", "database.default.svc")
                .build(),
        ],
    );
    let key = h
        .add_application(&AppBuilder::new("shop", "shop").automated(false, false).build())
        .await;

    let mut events = h.cluster.watch();
    let outcome = h.reconcile(&key).await;
    assert_eq!(outcome.operation, Some(OperationPhase::Succeeded));

    let mut created = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WatchEvent::Applied(m) = event {
            if m.kind() != "Application" && !created.contains(&m.name().to_string()) {
                created.push(m.name().to_string());
            }
        }
    }
    assert_eq!(created, vec!["database", "frontend"]);
    assert_eq!(h.status(&key).sync.status, SyncStatusCode::Synced);
}

#[tokio::test]
async fn test_unhealthy_wave_holds_the_operation() {
    let h = TestHarness::with_settings(ControllerSettings {
        wave_timeout: Duration::from_millis(300),
        ..test_settings()
    })
    .await;
    h.publish(
        "shop",
        vec![
            ManifestBuilder::deployment("database").wave(-1).build(),
            ManifestBuilder::config_map("frontend").data("tier", "web").build(),
        ],
    );
    let key = h
        .add_application(&AppBuilder::new("shop", "shop").automated(false, false).build())
        .await;

    let outcome = h.reconcile(&key).await;
    assert_eq!(outcome.operation, Some(OperationPhase::Running));
    assert!(h.cluster.contains(&deployment_key("database")));
    assert!(!h.cluster.contains(&config_map_key("frontend")));

    let status = h.status(&key);
    assert!(status.condition(ConditionType::HealthTimeout).is_some());
    assert_eq!(status.health.status, HealthStatus::Progressing);
    let op = status.operation_state.expect("operation recorded");
    assert_eq!(op.phase, OperationPhase::Running);
    assert!(op.finished_at.is_none());

    // The rollout finishes; the held operation resumes at the next wave.
    h.cluster
        .set_status(&deployment_key("database"), common::rolled_out(1))
        .expect("Failed to set status");
    h.settle().await;

    let outcome = h.reconcile(&key).await;
    assert_eq!(outcome.operation, Some(OperationPhase::Succeeded));
    assert!(h.cluster.contains(&config_map_key("frontend")));
    let status = h.status(&key);
    assert!(status.condition(ConditionType::HealthTimeout).is_none());
    assert_eq!(status.sync.status, SyncStatusCode::Synced);
}

// ============================================================================
// Self-heal
// ============================================================================

#[tokio::test]
async fn test_self_heal_reverts_manual_edit() {
    let h = TestHarness::new().await;
    h.publish(
        "web",
        vec![ManifestBuilder::config_map("settings").data("color", "blue").build()],
    );
    let key = h
        .add_application(&AppBuilder::new("web", "web").automated(false, true).build())
        .await;
    h.reconcile(&key).await;

    h.cluster
        .patch(&config_map_key("settings"), "/data/color", json!("red"))
        .expect("Failed to patch");
    h.settle().await;

    let outcome = h.reconcile(&key).await;
    assert_eq!(outcome.operation, Some(OperationPhase::Succeeded));
    let live = h.cluster.object(&config_map_key("settings")).expect("ConfigMap");
    assert_eq!(live.str_at("/data/color"), Some("blue"));
    assert_eq!(h.status(&key).sync.status, SyncStatusCode::Synced);
}

#[tokio::test]
async fn test_drift_is_reported_when_self_heal_is_disabled() {
    let h = TestHarness::new().await;
    h.publish(
        "web",
        vec![ManifestBuilder::config_map("settings").data("color", "blue").build()],
    );
    let key = h
        .add_application(&AppBuilder::new("web", "web").automated(false, false).build())
        .await;
    h.reconcile(&key).await;

    h.cluster
        .patch(&config_map_key("settings"), "/data/color", json!("red"))
        .expect("Failed to patch");
    h.settle().await;

    let outcome = h.reconcile(&key).await;
    assert_eq!(outcome.operation, None);
    let live = h.cluster.object(&config_map_key("settings")).expect("ConfigMap");
    assert_eq!(live.str_at("/data/color"), Some("red"));

    let status = h.status(&key);
    assert_eq!(status.sync.status, SyncStatusCode::OutOfSync);
    let settings = status
        .resources
        .iter()
        .find(|r| r.key == config_map_key("settings"))
        .expect("resource status");
    assert_eq!(settings.status, SyncStatusCode::OutOfSync);
    assert!(!settings.diff.is_empty());
}

// ============================================================================
// Pruning
// ============================================================================

#[tokio::test]
async fn test_removed_resource_is_pruned() {
    let h = TestHarness::new().await;
    h.publish(
        "web",
        vec![
            ManifestBuilder::config_map("keep").data("a", "1").build(),
            ManifestBuilder::config_map("legacy").data("b", "2").build(),
        ],
    );
    let key = h
        .add_application(&AppBuilder::new("web", "web").automated(true, false).build())
        .await;
    h.reconcile(&key).await;
    assert!(h.cluster.contains(&config_map_key("legacy")));

    h.publish(
        "web",
        vec![ManifestBuilder::config_map("keep").data("a", "1").build()],
    );
    let outcome = h.reconcile(&key).await;
    assert_eq!(outcome.operation, Some(OperationPhase::Succeeded));
    assert!(!h.cluster.contains(&config_map_key("legacy")));
    assert!(h.cluster.contains(&config_map_key("keep")));

    let status = h.status(&key);
    assert_eq!(status.sync.status, SyncStatusCode::Synced);
    let op = status.operation_state.expect("operation recorded");
    assert!(op
        .resources
        .iter()
        .any(|r| r.key == config_map_key("legacy") && r.status == ResourceResultCode::Pruned));
}

#[tokio::test]
async fn test_removed_resource_remains_without_prune() {
    let h = TestHarness::new().await;
    h.publish(
        "web",
        vec![
            ManifestBuilder::config_map("keep").data("a", "1").build(),
            ManifestBuilder::config_map("legacy").data("b", "2").build(),
        ],
    );
    let key = h
        .add_application(&AppBuilder::new("web", "web").automated(false, false).build())
        .await;
    h.reconcile(&key).await;

    h.publish(
        "web",
        vec![ManifestBuilder::config_map("keep").data("a", "1").build()],
    );
    h.reconcile(&key).await;
    assert!(h.cluster.contains(&config_map_key("legacy")));

    let status = h.status(&key);
    assert_eq!(status.sync.status, SyncStatusCode::OutOfSync);
    let legacy = status
        .resources
        .iter()
        .find(|r| r.key == config_map_key("legacy"))
        .expect("resource status");
    assert!(legacy.requires_pruning);
}

// ============================================================================
// Hooks
// ============================================================================

#[tokio::test]
async fn test_failed_post_sync_hook_runs_sync_fail_hooks() {
    let h = TestHarness::new().await;
    h.finish_jobs();
    h.publish(
        "jobs",
        vec![
            ManifestBuilder::config_map("app-config").data("mode", "live").build(),
            ManifestBuilder::job("fail-smoke-test").hook("PostSync").build(),
            ManifestBuilder::job("notify-failure").hook("SyncFail").build(),
        ],
    );
    let key = h
        .add_application(&AppBuilder::new("jobs", "jobs").build())
        .await;

    let outcome = h.sync_now(&key, false).await;
    assert_eq!(outcome.operation, Some(OperationPhase::SyncFailed));

    let status = h.status(&key);
    assert!(status.condition(ConditionType::HookFailed).is_some());
    let op = status.operation_state.expect("operation recorded");
    assert_eq!(op.phase, OperationPhase::SyncFailed);
    assert!(op.finished_at.is_some());

    let smoke = op
        .resources
        .iter()
        .find(|r| r.key.name == "fail-smoke-test")
        .expect("PostSync hook result");
    assert_eq!(smoke.hook_phase, Some(HookPhase::PostSync));
    assert_ne!(smoke.status, ResourceResultCode::Synced);

    let notify = op
        .resources
        .iter()
        .find(|r| r.key.name == "notify-failure")
        .expect("SyncFail hook result");
    assert_eq!(notify.hook_phase, Some(HookPhase::SyncFail));
    assert_eq!(notify.status, ResourceResultCode::Synced);

    // A failed operation is not recorded as deployed.
    assert!(status.history.is_empty());
}

#[tokio::test]
async fn test_succeeded_hooks_are_not_rerun_automatically() {
    let h = TestHarness::new().await;
    h.finish_jobs();
    h.publish(
        "jobs",
        vec![
            ManifestBuilder::config_map("app-config").data("mode", "live").build(),
            ManifestBuilder::job("migrate").hook("PreSync").build(),
        ],
    );
    let key = h
        .add_application(&AppBuilder::new("jobs", "jobs").automated(false, true).build())
        .await;
    let outcome = h.reconcile(&key).await;
    assert_eq!(outcome.operation, Some(OperationPhase::Succeeded));
    let status = h.status(&key);
    assert!(status
        .hooks
        .iter()
        .any(|r| r.key.name == "migrate" && r.phase == HookPhase::PreSync && r.succeeded));
    assert_eq!(status.history.len(), 1);

    // Drift triggers a self-heal sync that skips the succeeded hook.
    h.cluster
        .patch(&config_map_key("app-config"), "/data/mode", json!("debug"))
        .expect("Failed to patch");
    h.settle().await;
    let mut events = h.cluster.watch();
    let outcome = h.reconcile(&key).await;
    assert_eq!(outcome.operation, Some(OperationPhase::Succeeded));
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.manifest().name(), "migrate", "hook ran again");
    }
}

// ============================================================================
// RBAC
// ============================================================================

#[tokio::test]
async fn test_destination_outside_project_is_denied_without_mutations() {
    let h = TestHarness::new().await;
    h.add_project(
        ProjectBuilder::permissive("restricted")
            .destination_namespaces(&["team-a"])
            .build(),
    );
    h.publish(
        "web",
        vec![ManifestBuilder::config_map("settings").data("color", "blue").build()],
    );
    let key = h
        .add_application(
            &AppBuilder::new("web", "web")
                .project("restricted")
                .automated(true, true)
                .build(),
        )
        .await;

    h.cluster.reset_write_count();
    let outcome = h.reconcile(&key).await;
    assert_eq!(outcome.operation, None);
    // Only the Application's own status was written.
    assert_eq!(h.cluster.write_count(), 1);
    assert!(!h.cluster.contains(&config_map_key("settings")));
    assert!(h.owned_objects(&key).is_empty());

    let status = h.status(&key);
    let denied = status
        .condition(ConditionType::PermissionDenied)
        .expect("PermissionDenied condition");
    assert!(denied.message.contains("namespace 'default'"), "{}", denied.message);

    // A repeated denial changes nothing.
    h.cluster.reset_write_count();
    h.reconcile(&key).await;
    assert_eq!(h.cluster.write_count(), 0);
}

#[tokio::test]
async fn test_missing_project_is_denied() {
    let h = TestHarness::new().await;
    h.publish("web", vec![ManifestBuilder::config_map("settings").build()]);
    let key = h
        .add_application(
            &AppBuilder::new("web", "web")
                .project("nonexistent")
                .automated(true, false)
                .build(),
        )
        .await;

    h.reconcile(&key).await;
    assert!(!h.cluster.contains(&config_map_key("settings")));
    assert!(h
        .status(&key)
        .condition(ConditionType::PermissionDenied)
        .is_some());
}

// ============================================================================
// App of Apps
// ============================================================================

#[tokio::test]
async fn test_child_removed_from_parent_is_cascade_deleted() {
    let h = TestHarness::with_settings(ControllerSettings {
        accept_progressing: true,
        ..test_settings()
    })
    .await;
    let child = AppBuilder::new("shop", "shop")
        .automated(true, false)
        .finalizer();
    h.publish(
        "apps",
        vec![
            child.build_manifest(),
            ManifestBuilder::config_map("root-marker").build(),
        ],
    );
    h.publish(
        "shop",
        vec![ManifestBuilder::config_map("shop-config").data("currency", "EUR").build()],
    );
    let parent = h
        .add_application(
            &AppBuilder::new("root", "apps")
                .namespace(APP_NAMESPACE)
                .automated(true, false)
                .build(),
        )
        .await;
    let child_key = ResourceKey::new("keel.io", "Application", APP_NAMESPACE, "shop");

    h.reconcile(&parent).await;
    assert!(h.cluster.contains(&child_key));
    h.reconcile(&child_key).await;
    assert!(h.cluster.contains(&config_map_key("shop-config")));
    h.reconcile(&parent).await;
    assert!(h
        .status(&parent)
        .resources
        .iter()
        .any(|r| r.key == child_key));

    h.publish("apps", vec![ManifestBuilder::config_map("root-marker").build()]);
    h.reconcile(&parent).await;
    let pending = h.cluster.object(&child_key).expect("child still finalizing");
    assert!(pending.is_deleting());

    let outcome = h.reconcile(&child_key).await;
    assert!(outcome.deleted);
    assert!(!h.cluster.contains(&child_key));
    assert!(!h.cluster.contains(&config_map_key("shop-config")));
    assert!(h.owned_objects(&child_key).is_empty());

    h.reconcile(&parent).await;
    let status = h.status(&parent);
    assert!(!status.resources.iter().any(|r| r.key == child_key));
    assert_eq!(status.sync.status, SyncStatusCode::Synced);
}
