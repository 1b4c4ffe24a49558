//! Test harness for isolated controller tests.
//!
//! The `TestHarness` struct wires a complete in-memory environment:
//! - `MemoryCluster` as the API server, seeded with the `keel` namespace
//!   and a permissive `default` Project
//! - `MemoryRenderer` as the repository behind every Application
//! - a `Controller` whose live state cache is kept up to date by an observer
//!
//! Cycles are driven explicitly through [`TestHarness::reconcile`] so tests
//! decide exactly when the controller acts.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use keel::resource::{ApplicationStatus, SyncPolicy, TrackingId};
use keel::{
    Application, ClusterApi, Controller, ControllerSettings, Manifest, MemoryCluster,
    MemoryRenderer, Project, ReconcileOutcome, ResourceKey,
};

use super::builders::{job_finished, rolled_out, ProjectBuilder, APP_NAMESPACE, REPO};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings with timeouts scaled down for tests.
pub fn test_settings() -> ControllerSettings {
    ControllerSettings {
        poll_interval: Duration::from_millis(200),
        wave_timeout: Duration::from_secs(2),
        hook_timeout: Duration::from_secs(2),
        health_poll_interval: Duration::from_millis(20),
        deletion_timeout: Duration::from_secs(2),
        max_concurrent_reconciles: 4,
        ..Default::default()
    }
}

/// Test harness providing an isolated controller environment.
pub struct TestHarness {
    pub cluster: Arc<MemoryCluster>,
    pub renderer: Arc<MemoryRenderer>,
    pub controller: Arc<Controller>,
    shutdown: watch::Sender<bool>,
}

impl TestHarness {
    /// Create a harness with the default test settings.
    pub async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub async fn with_settings(settings: ControllerSettings) -> Self {
        let cluster = Arc::new(MemoryCluster::new());
        let renderer = Arc::new(MemoryRenderer::new());
        Self::assemble(cluster, renderer, settings).await
    }

    /// Create a harness around an existing cluster and repository.
    pub async fn assemble(
        cluster: Arc<MemoryCluster>,
        renderer: Arc<MemoryRenderer>,
        settings: ControllerSettings,
    ) -> Self {
        cluster
            .insert(&Manifest::namespace_object(APP_NAMESPACE))
            .expect("Failed to create application namespace");
        let controller = Arc::new(Controller::new(
            cluster.clone(),
            renderer.clone(),
            settings,
        ));
        let (shutdown, rx) = watch::channel(false);
        let api: Arc<dyn ClusterApi> = cluster.clone();
        tokio::spawn(Arc::clone(controller.cache()).observe(api, rx));

        let harness = Self {
            cluster,
            renderer,
            controller,
            shutdown,
        };
        for _ in 0..200 {
            if harness.controller.cache().is_synced() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(harness.controller.cache().is_synced(), "cache never synced");
        harness.add_project(ProjectBuilder::permissive("default").build());
        harness
    }

    /// Waits until the cache has observed every write made so far.
    pub async fn settle(&self) {
        let observed = self
            .controller
            .cache()
            .wait_for_version(self.cluster.version(), SETTLE_TIMEOUT)
            .await;
        assert!(observed, "cache did not catch up with the cluster");
    }

    pub fn add_project(&self, project: Project) {
        let manifest = project.to_manifest().expect("Failed to encode Project");
        self.cluster
            .insert(&manifest)
            .expect("Failed to insert Project");
    }

    /// Publish manifests at `path` of the test repository.
    pub fn publish(&self, path: &str, manifests: Vec<Manifest>) -> String {
        self.renderer.set_path(REPO, path, manifests)
    }

    /// Create an Application out of band, as a user would.
    pub async fn add_application(&self, app: &Application) -> ResourceKey {
        let manifest = app.to_manifest().expect("Failed to encode Application");
        self.cluster
            .insert(&manifest)
            .expect("Failed to insert Application");
        self.settle().await;
        app.key()
    }

    /// Replace the sync policy of a stored Application.
    pub async fn set_sync_policy(&self, key: &ResourceKey, policy: SyncPolicy) {
        let mut app = self.application(key);
        app.spec.sync_policy = Some(policy);
        app.metadata.resource_version = None;
        let manifest = app.to_manifest().expect("Failed to encode Application");
        self.cluster
            .insert(&manifest)
            .expect("Failed to update Application");
        self.settle().await;
    }

    /// Request deletion of an object out of band.
    pub async fn delete(&self, key: &ResourceKey) {
        self.cluster.delete(key).await.expect("Failed to delete");
        self.settle().await;
    }

    /// Run one automatic cycle and wait for its writes to be observed.
    pub async fn reconcile(&self, key: &ResourceKey) -> ReconcileOutcome {
        let outcome = self
            .controller
            .reconcile(key)
            .await
            .expect("Reconcile failed");
        self.settle().await;
        outcome
    }

    /// Run one manual sync and wait for its writes to be observed.
    pub async fn sync_now(&self, key: &ResourceKey, prune: bool) -> ReconcileOutcome {
        let outcome = self
            .controller
            .sync_now(key, prune)
            .await
            .expect("Manual sync failed");
        self.settle().await;
        outcome
    }

    pub fn application(&self, key: &ResourceKey) -> Application {
        let manifest = self.cluster.object(key).expect("Application not found");
        Application::from_manifest(&manifest).expect("Failed to decode Application")
    }

    pub fn status(&self, key: &ResourceKey) -> ApplicationStatus {
        self.application(key).status.unwrap_or_default()
    }

    /// Report every Deployment as rolled out as soon as it is written.
    pub fn roll_out_deployments(&self) {
        self.cluster.add_status_simulator(|m: &Manifest| {
            (m.kind() == "Deployment").then(|| rolled_out(m.generation()))
        });
    }

    /// Finish every Job as soon as it is written; Jobs named `fail-*` fail.
    pub fn finish_jobs(&self) {
        self.cluster.add_status_simulator(|m: &Manifest| {
            (m.kind() == "Job").then(|| job_finished(!m.name().starts_with("fail-")))
        });
    }

    /// Objects in the cluster owned by the Application `key`.
    pub fn owned_objects(&self, key: &ResourceKey) -> Vec<ResourceKey> {
        let owner = TrackingId::new(&key.namespace, &key.name);
        self.cluster
            .objects()
            .into_iter()
            .filter(|m| TrackingId::of(m).as_ref() == Some(&owner))
            .map(|m| m.key())
            .collect()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
