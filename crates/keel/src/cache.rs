//! Live state cache.
//!
//! The cache is written only by its observer task, from one list followed
//! by watch events. Reconcilers read snapshots and never write to it; their
//! applies reach the cache through the resulting watch events.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use crate::cluster::{ClusterApi, ListResult, WatchEvent};
use crate::resource::{Manifest, ResourceKey, TrackingId};

const CHANGE_CAPACITY: usize = 4096;
const RELIST_DELAY: Duration = Duration::from_millis(500);

/// One observed change.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheChange {
    pub key: ResourceKey,
    pub deleted: bool,
    /// Owner of the object after the change (or before, for deletions).
    pub owner: Option<TrackingId>,
    /// Owner before the change, when it differs.
    pub previous_owner: Option<TrackingId>,
    /// The object's spec generation moved, or deletion was requested.
    pub spec_changed: bool,
    pub version: u64,
}

#[derive(Default)]
struct CacheState {
    objects: BTreeMap<ResourceKey, Manifest>,
    version: u64,
    synced: bool,
}

pub struct LiveStateCache {
    state: RwLock<CacheState>,
    version_tx: watch::Sender<u64>,
    changes: broadcast::Sender<CacheChange>,
}

impl Default for LiveStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveStateCache {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            state: RwLock::new(CacheState::default()),
            version_tx,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
        self.changes.subscribe()
    }

    pub fn version(&self) -> u64 {
        self.read(|s| s.version)
    }

    pub fn is_synced(&self) -> bool {
        self.read(|s| s.synced)
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Manifest> {
        self.read(|s| s.objects.get(key).cloned())
    }

    pub fn snapshot(&self) -> BTreeMap<ResourceKey, Manifest> {
        self.read(|s| s.objects.clone())
    }

    pub fn len(&self) -> usize {
        self.read(|s| s.objects.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects whose tracking annotation names `owner`.
    pub fn owned_by(&self, owner: &TrackingId) -> BTreeMap<ResourceKey, Manifest> {
        self.read(|s| {
            s.objects
                .iter()
                .filter(|(_, m)| TrackingId::of(m).as_ref() == Some(owner))
                .map(|(k, m)| (k.clone(), m.clone()))
                .collect()
        })
    }

    /// All Application objects currently observed.
    pub fn applications(&self) -> Vec<Manifest> {
        self.read(|s| {
            s.objects
                .iter()
                .filter(|(k, _)| k.is_application())
                .map(|(_, m)| m.clone())
                .collect()
        })
    }

    /// Waits until the cache has observed `version`, or `timeout` elapses.
    pub async fn wait_for_version(&self, version: u64, timeout: Duration) -> bool {
        let mut rx = self.version_tx.subscribe();
        let observed = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|v| *v >= version)).await,
            Ok(Ok(_))
        );
        observed
    }

    /// Waits for the next change of any object, or `timeout`.
    pub async fn wait_for_change(&self, timeout: Duration) {
        let mut rx = self.version_tx.subscribe();
        let _ = tokio::time::timeout(timeout, rx.changed()).await;
    }

    fn read<R>(&self, f: impl FnOnce(&CacheState) -> R) -> R {
        match self.state.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        match self.state.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn publish(&self, version: u64, changes: Vec<CacheChange>) {
        self.version_tx.send_if_modified(|v| {
            if version > *v {
                *v = version;
                true
            } else {
                false
            }
        });
        for change in changes {
            let _ = self.changes.send(change);
        }
    }

    /// Replaces the contents with a fresh list, emitting a change for every
    /// object that differs from what was cached.
    pub(crate) fn replace(&self, list: ListResult) {
        let (version, changes) = self.write(|state| {
            let mut fresh: BTreeMap<ResourceKey, Manifest> =
                list.items.into_iter().map(|m| (m.key(), m)).collect();
            let mut changes = Vec::new();
            for (key, old) in &state.objects {
                if !fresh.contains_key(key) {
                    changes.push(change_for(key, Some(old), None, list.resource_version));
                }
            }
            for (key, new) in &fresh {
                let old = state.objects.get(key);
                if old != Some(new) {
                    changes.push(change_for(key, old, Some(new), list.resource_version));
                }
            }
            std::mem::swap(&mut state.objects, &mut fresh);
            state.version = state.version.max(list.resource_version);
            state.synced = true;
            (state.version, changes)
        });
        self.publish(version, changes);
    }

    /// Applies one watch event. Events older than the cached copy are dropped.
    pub(crate) fn apply_event(&self, event: WatchEvent) {
        let event_version = event.resource_version();
        let result = self.write(|state| {
            let key = event.manifest().key();
            let old = state.objects.get(&key).cloned();
            if let Some(existing) = &old {
                if existing.resource_version().unwrap_or(0) >= event_version {
                    return None;
                }
            }
            let change = match event {
                WatchEvent::Applied(m) => {
                    let change = change_for(&key, old.as_ref(), Some(&m), event_version);
                    state.objects.insert(key, m);
                    change
                }
                WatchEvent::Deleted(m) => {
                    let previous = old.as_ref().unwrap_or(&m);
                    let change = change_for(&key, Some(previous), None, event_version);
                    state.objects.remove(&key);
                    change
                }
            };
            state.version = state.version.max(event_version);
            Some((state.version, change))
        });
        match result {
            Some((version, change)) => self.publish(version, vec![change]),
            None => self.publish(event_version, Vec::new()),
        }
    }

    /// Runs the observer until `shutdown` flips to true.
    pub async fn observe(
        self: Arc<Self>,
        api: Arc<dyn ClusterApi>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("Live state observer starting for {}", api.server());
        loop {
            if *shutdown.borrow() {
                break;
            }
            let mut events = api.watch();
            let list = match api.list().await {
                Ok(list) => list,
                Err(e) => {
                    log::warn!("Failed to list cluster state: {}; retrying", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RELIST_DELAY) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };
            log::debug!(
                "Listed {} objects at resourceVersion {}",
                list.items.len(),
                list.resource_version
            );
            self.replace(list);

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => self.apply_event(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Observer lagged by {} events; relisting", skipped);
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            log::info!("Cluster watch closed; observer stopping");
                            return;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            log::info!("Live state observer stopped");
                            return;
                        }
                    }
                }
            }
        }
        log::info!("Live state observer stopped");
    }
}

fn change_for(
    key: &ResourceKey,
    old: Option<&Manifest>,
    new: Option<&Manifest>,
    version: u64,
) -> CacheChange {
    let old_owner = old.and_then(TrackingId::of);
    let new_owner = new.and_then(TrackingId::of);
    let spec_changed = match (old, new) {
        (Some(o), Some(n)) => {
            o.generation() != n.generation() || (!o.is_deleting() && n.is_deleting())
        }
        _ => true,
    };
    let deleted = new.is_none();
    let owner = if deleted {
        old_owner.clone()
    } else {
        new_owner.clone()
    };
    let previous_owner = if old_owner != new_owner && !deleted {
        old_owner
    } else {
        None
    };
    CacheChange {
        key: key.clone(),
        deleted,
        owner,
        previous_owner,
        spec_changed,
        version,
    }
}
