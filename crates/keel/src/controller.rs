//! The controller: drives reconcile cycles for every watched Application.
//!
//! Each Application has a slot holding a lock, a pending intent and the
//! handle of its in-flight cycle. A trigger that finds the lock taken
//! only records itself as pending; the running cycle picks it up when it
//! finishes, so at most one cycle per Application is ever in flight.
//! Cycles of different Applications run in parallel, bounded by
//! `maxConcurrentReconciles`.
//!
//! Triggers: the poll tick (all Applications), a change of a resource
//! owned by an Application, a change of the Application object itself,
//! and file changes below a watched local source root.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Semaphore};

use crate::cache::{CacheChange, LiveStateCache};
use crate::cluster::ClusterApi;
use crate::config::ControllerSettings;
use crate::error::Result;
use crate::events::{EventBroadcaster, SyncEvent};
use crate::reconciler::{Cycle, ReconcileOutcome, Reconciler, SyncIntent};
use crate::resource::{Application, ResourceKey, TrackingId, GROUP};
use crate::scheduler::{PollScheduler, Tick};
use crate::source::{AsyncSourceWatcher, DirectoryRenderer, Renderer, SourceChange};

const CACHE_SYNC_WAIT: Duration = Duration::from_millis(200);

#[derive(Default)]
struct Slot {
    lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<SyncIntent>>,
    cycle: Mutex<Option<Cycle>>,
}

impl Slot {
    /// Records a trigger that arrived while a cycle was running. A manual
    /// sync is never downgraded by a later automatic trigger.
    fn defer(&self, intent: SyncIntent) {
        if let Ok(mut pending) = self.pending.lock() {
            match (*pending, intent) {
                (Some(SyncIntent::Manual { .. }), SyncIntent::Auto) => {}
                _ => *pending = Some(intent),
            }
        }
    }

    fn take_pending(&self) -> Option<SyncIntent> {
        self.pending.lock().ok().and_then(|mut p| p.take())
    }

    fn begin(&self) -> Cycle {
        let cycle = Cycle::new();
        if let Ok(mut current) = self.cycle.lock() {
            *current = Some(cycle.clone());
        }
        cycle
    }

    fn end(&self) {
        if let Ok(mut current) = self.cycle.lock() {
            *current = None;
        }
    }

    fn current(&self) -> Option<Cycle> {
        self.cycle.lock().ok().and_then(|c| c.clone())
    }
}

pub struct Controller {
    api: Arc<dyn ClusterApi>,
    cache: Arc<LiveStateCache>,
    reconciler: Arc<Reconciler>,
    slots: Mutex<HashMap<ResourceKey, Arc<Slot>>>,
    permits: Arc<Semaphore>,
    refresh: broadcast::Sender<()>,
    source_roots: Vec<PathBuf>,
    stopping: AtomicBool,
}

impl Controller {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        renderer: Arc<dyn Renderer>,
        settings: ControllerSettings,
    ) -> Self {
        let cache = Arc::new(LiveStateCache::new());
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_reconciles.max(1)));
        let (refresh, _) = broadcast::channel(16);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&api),
            renderer,
            Arc::clone(&cache),
            settings,
        ));
        Self {
            api,
            cache,
            reconciler,
            slots: Mutex::new(HashMap::new()),
            permits,
            refresh,
            source_roots: Vec::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Watches local source trees and reconciles the Applications that
    /// render from them when their files change.
    pub fn watch_sources(mut self, roots: Vec<PathBuf>) -> Self {
        self.source_roots = roots;
        self
    }

    pub fn cache(&self) -> &Arc<LiveStateCache> {
        &self.cache
    }

    pub fn events(&self) -> &EventBroadcaster {
        self.reconciler.events()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.reconciler.events().subscribe()
    }

    pub fn settings(&self) -> &ControllerSettings {
        self.reconciler.settings()
    }

    /// Requests a refresh of every Application on the next scheduler turn.
    pub fn refresh(&self) {
        if self.refresh.send(()).is_err() {
            log::debug!("Refresh requested while the scheduler is not running");
        }
    }

    /// Runs the controller until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        log::info!(
            "Controller starting for {} (poll every {:?}, {} concurrent reconciles)",
            self.api.server(),
            self.settings().poll_interval,
            self.settings().max_concurrent_reconciles
        );
        let observer = tokio::spawn(
            Arc::clone(&self.cache).observe(Arc::clone(&self.api), shutdown.clone()),
        );
        let mut changes = self.cache.subscribe();

        while !self.cache.is_synced() {
            tokio::select! {
                _ = self.cache.wait_for_change(CACHE_SYNC_WAIT) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return self.stop(None, observer).await;
                    }
                }
            }
        }
        log::info!("Live state cache synced with {} object(s)", self.cache.len());

        let mut watcher = (!self.source_roots.is_empty()).then(|| {
            let mut watcher = AsyncSourceWatcher::new(self.source_roots.clone());
            watcher.start();
            watcher
        });
        let mut sources = watcher.as_ref().map(AsyncSourceWatcher::subscribe);

        let scheduler = PollScheduler::new(self.settings().poll_interval);
        let (tick_tx, mut ticks) = mpsc::channel(4);
        let poller = scheduler.start(self.refresh.subscribe(), tick_tx);

        self.reconcile_all();
        loop {
            tokio::select! {
                tick = ticks.recv() => match tick {
                    Some(tick) => self.on_tick(tick),
                    None => break,
                },
                change = changes.recv() => match change {
                    Ok(change) => self.on_change(&change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Missed {} cache change(s); reconciling everything", skipped);
                        self.reconcile_all();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(change) = next_source_change(&mut sources) => self.on_source_change(&change),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        scheduler.stop();
        if let Some(watcher) = watcher.as_mut() {
            watcher.stop();
        }
        self.stop(Some(poller), observer).await
    }

    async fn stop(
        &self,
        poller: Option<tokio::task::JoinHandle<()>>,
        observer: tokio::task::JoinHandle<()>,
    ) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        for slot in self.all_slots() {
            if let Some(cycle) = slot.current() {
                cycle.cancel("controller shutting down");
            }
        }
        if let Some(poller) = poller {
            if let Err(e) = poller.await {
                log::warn!("Poll scheduler task failed: {}", e);
            }
        }
        if let Err(e) = observer.await {
            log::warn!("Live state observer task failed: {}", e);
        }
        log::info!("Controller stopped");
        Ok(())
    }

    /// Runs one automatic cycle for `key` and waits for it, after any cycle
    /// already in flight.
    pub async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome> {
        self.run_exclusive(key, SyncIntent::Auto).await
    }

    /// Syncs `key` now regardless of its automated policy. Hooks that
    /// already succeeded for the revision run again.
    pub async fn sync_now(&self, key: &ResourceKey, prune: bool) -> Result<ReconcileOutcome> {
        self.run_exclusive(key, SyncIntent::Manual { prune }).await
    }

    /// Cancels the in-flight cycle of `key`, if any.
    pub fn cancel(&self, key: &ResourceKey, reason: &str) -> bool {
        match self.slot_if_exists(key).and_then(|slot| slot.current()) {
            Some(cycle) => {
                log::info!("Cancelling cycle of {}: {}", key, reason);
                cycle.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Schedules a cycle for `key` without waiting for it.
    pub fn trigger(self: &Arc<Self>, key: ResourceKey) {
        self.spawn_cycle(key, SyncIntent::Auto);
    }

    async fn run_exclusive(&self, key: &ResourceKey, intent: SyncIntent) -> Result<ReconcileOutcome> {
        let slot = self.slot(key);
        let _guard = slot.lock.lock().await;
        self.run_cycle(key, intent, &slot).await
    }

    fn spawn_cycle(self: &Arc<Self>, key: ResourceKey, intent: SyncIntent) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let slot = controller.slot(&key);
            let mut intent = intent;
            loop {
                let Ok(guard) = slot.lock.try_lock() else {
                    slot.defer(intent);
                    return;
                };
                let result = controller.run_cycle(&key, intent, &slot).await;
                drop(guard);
                match result {
                    Ok(outcome) => controller.after_cycle(&key, &outcome),
                    Err(e) => log::error!("Reconcile of {} failed: {}", key, e),
                }
                match slot.take_pending() {
                    Some(next) if !controller.stopping.load(Ordering::SeqCst) => intent = next,
                    _ => return,
                }
            }
        });
    }

    async fn run_cycle(&self, key: &ResourceKey, intent: SyncIntent, slot: &Slot) -> Result<ReconcileOutcome> {
        let Ok(_permit) = self.permits.acquire().await else {
            return Ok(ReconcileOutcome::default());
        };
        let cycle = slot.begin();
        let result = self.reconciler.reconcile(key, intent, &cycle).await;
        slot.end();
        result
    }

    fn after_cycle(self: &Arc<Self>, key: &ResourceKey, outcome: &ReconcileOutcome) {
        if outcome.deleted {
            self.remove_slot(key);
            return;
        }
        if let Some(delay) = outcome.requeue_after {
            let controller = Arc::clone(self);
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                controller.spawn_cycle(key, SyncIntent::Auto);
            });
        }
    }

    fn on_tick(self: &Arc<Self>, tick: Tick) {
        log::debug!("Poll tick ({:?})", tick);
        for app in self.watched_applications() {
            let key = app.key();
            if let Some(cycle) = self.slot_if_exists(&key).and_then(|s| s.current()) {
                self.check_revision(app, cycle);
            }
            self.trigger(key);
        }
    }

    /// Cancels an in-flight cycle whose revision is no longer the target.
    fn check_revision(self: &Arc<Self>, app: Application, cycle: Cycle) {
        let Some(current) = cycle.revision() else {
            return;
        };
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            match controller.reconciler.resolve_revision(&app).await {
                Ok(latest) if latest != current => {
                    log::info!("New revision {} for {}; abandoning in-flight cycle", latest, app.key());
                    cycle.cancel(format!("new revision {} detected", latest));
                }
                Ok(_) => {}
                Err(e) => log::debug!("Revision check for {} failed: {}", app.key(), e),
            }
        });
    }

    fn on_change(self: &Arc<Self>, change: &CacheChange) {
        if change.key.is_application() && self.settings().watches_namespace(&change.key.namespace) {
            if change.deleted {
                self.cancel(&change.key, "Application deleted");
            } else if change.spec_changed {
                let deleting = self
                    .cache
                    .get(&change.key)
                    .is_some_and(|m| m.is_deleting());
                let reason = if deleting {
                    "Application is being deleted"
                } else {
                    "Application spec changed"
                };
                self.cancel(&change.key, reason);
                self.trigger(change.key.clone());
            }
        }
        for owner in [&change.owner, &change.previous_owner].into_iter().flatten() {
            let key = application_key(owner);
            if self.settings().watches_namespace(&key.namespace) {
                self.trigger(key);
            }
        }
    }

    fn on_source_change(self: &Arc<Self>, change: &SourceChange) {
        let local = DirectoryRenderer::new();
        for app in self.watched_applications() {
            let source = &app.spec.source;
            if !DirectoryRenderer::is_local(&source.repo_url) {
                continue;
            }
            if local.repo_root(&source.repo_url) == change.root
                && change.affects(std::path::Path::new(&source.path))
            {
                log::info!("Source of {} changed ({})", app.key(), change.path.display());
                self.trigger(app.key());
            }
        }
    }

    fn reconcile_all(self: &Arc<Self>) {
        for app in self.watched_applications() {
            self.trigger(app.key());
        }
    }

    fn watched_applications(&self) -> Vec<Application> {
        self.cache
            .applications()
            .iter()
            .filter_map(|m| match Application::from_manifest(m) {
                Ok(app) => Some(app),
                Err(e) => {
                    log::warn!("Skipping invalid Application: {}", e);
                    None
                }
            })
            .filter(|app| self.settings().watches_namespace(app.namespace()))
            .collect()
    }

    fn slot(&self, key: &ResourceKey) -> Arc<Slot> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn slot_if_exists(&self, key: &ResourceKey) -> Option<Arc<Slot>> {
        self.slots.lock().ok().and_then(|s| s.get(key).cloned())
    }

    fn remove_slot(&self, key: &ResourceKey) {
        if let Ok(mut slots) = self.slots.lock() {
            if slots.get(key).is_some_and(|s| s.current().is_none()) {
                slots.remove(key);
            }
        }
    }

    fn all_slots(&self) -> Vec<Arc<Slot>> {
        self.slots
            .lock()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn application_key(owner: &TrackingId) -> ResourceKey {
    ResourceKey::new(GROUP, "Application", &owner.app_namespace, &owner.app_name)
}

async fn next_source_change(
    sources: &mut Option<broadcast::Receiver<SourceChange>>,
) -> Option<SourceChange> {
    match sources {
        Some(rx) => match rx.recv().await {
            Ok(change) => Some(change),
            Err(broadcast::error::RecvError::Lagged(_)) => None,
            Err(broadcast::error::RecvError::Closed) => {
                *sources = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}
