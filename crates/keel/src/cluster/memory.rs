//! In-memory API server.
//!
//! Mirrors the API server behaviour the reconciler depends on: monotonic
//! resourceVersions, generation bumps on spec changes, status preserved
//! across applies, finalizer-aware deletion and namespace cascade. Faults
//! can be injected and status can be simulated per kind, which makes it
//! the backing store for embedding and for tests.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::{ClusterApi, ListResult, WatchEvent};
use crate::diff::pointer;
use crate::error::ClusterError;
use crate::resource::application::default_server;
use crate::resource::{Manifest, ResourceKey};

const EVENT_CAPACITY: usize = 4096;
const BUILTIN_NAMESPACES: &[&str] = &["default", "kube-system", "kube-public"];

/// Computes a status for an object as it is written; `None` leaves it alone.
pub type StatusSimulator = Arc<dyn Fn(&Manifest) -> Option<Value> + Send + Sync>;

struct Fault {
    key: Option<ResourceKey>,
    error: ClusterError,
    remaining: u32,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceKey, Manifest>,
    version: u64,
    uid_seq: u64,
    faults: Vec<Fault>,
    unavailable: bool,
}

pub struct MemoryCluster {
    server: String,
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    writes: AtomicU64,
    simulators: Mutex<Vec<StatusSimulator>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::with_server(default_server())
    }

    pub fn with_server(server: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cluster = Self {
            server: server.into(),
            state: Mutex::new(State::default()),
            events,
            writes: AtomicU64::new(0),
            simulators: Mutex::new(Vec::new()),
        };
        for ns in BUILTIN_NAMESPACES {
            if let Err(e) = cluster.write_object(&Manifest::namespace_object(ns)) {
                log::error!("Failed to seed namespace {}: {}", ns, e);
            }
        }
        cluster
    }

    /// Number of mutating API calls made through [`ClusterApi`].
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset_write_count(&self) {
        self.writes.store(0, Ordering::SeqCst);
    }

    pub fn add_status_simulator(
        &self,
        simulator: impl Fn(&Manifest) -> Option<Value> + Send + Sync + 'static,
    ) {
        if let Ok(mut sims) = self.simulators.lock() {
            sims.push(Arc::new(simulator));
        }
    }

    /// Fails the next `times` mutating calls (optionally only for `key`).
    pub fn fail_next(&self, key: Option<ResourceKey>, error: ClusterError, times: u32) {
        self.lock().faults.push(Fault {
            key,
            error,
            remaining: times,
        });
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Manifest> {
        self.lock().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn objects(&self) -> Vec<Manifest> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    // -- out-of-band edits, as made by users or other controllers --------

    /// Creates or replaces an object without counting it as a reconciler write.
    pub fn insert(&self, manifest: &Manifest) -> Result<Manifest, ClusterError> {
        self.write_object(manifest)
    }

    /// Sets a field on a live object.
    pub fn patch(&self, key: &ResourceKey, path: &str, value: Value) -> Result<u64, ClusterError> {
        let mut state = self.lock();
        let mut obj = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        pointer::set(obj.as_value_mut(), path, value);
        let version = self.bump(&mut state, &mut obj);
        state.objects.insert(key.clone(), obj.clone());
        self.emit(WatchEvent::Applied(obj));
        Ok(version)
    }

    /// Sets the status of a live object, as its owning controller would.
    pub fn set_status(&self, key: &ResourceKey, status: Value) -> Result<u64, ClusterError> {
        let mut state = self.lock();
        self.write_status(&mut state, key, status)
    }

    /// Removes an object immediately, ignoring finalizers.
    pub fn remove(&self, key: &ResourceKey) -> Option<Manifest> {
        let mut state = self.lock();
        let mut obj = state.objects.remove(key)?;
        self.bump(&mut state, &mut obj);
        self.emit(WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }

    // -- internals --------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: WatchEvent) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(event);
    }

    fn bump(&self, state: &mut State, obj: &mut Manifest) -> u64 {
        state.version += 1;
        obj.metadata_mut().insert(
            "resourceVersion".into(),
            Value::String(state.version.to_string()),
        );
        state.version
    }

    fn check_available(state: &State) -> Result<(), ClusterError> {
        if state.unavailable {
            Err(ClusterError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn take_fault(state: &mut State, key: &ResourceKey) -> Result<(), ClusterError> {
        Self::check_available(state)?;
        let idx = state
            .faults
            .iter()
            .position(|f| f.remaining > 0 && f.key.as_ref().is_none_or(|k| k == key));
        if let Some(idx) = idx {
            let fault = &mut state.faults[idx];
            fault.remaining -= 1;
            let error = fault.error.clone();
            if fault.remaining == 0 {
                state.faults.remove(idx);
            }
            return Err(error);
        }
        Ok(())
    }

    fn simulate_status(&self, obj: &mut Manifest) {
        let sims = match self.simulators.lock() {
            Ok(sims) => sims.clone(),
            Err(_) => return,
        };
        for sim in sims {
            if let Some(status) = sim(obj) {
                if let Some(map) = obj.as_value_mut().as_object_mut() {
                    map.insert("status".into(), status);
                }
            }
        }
    }

    fn write_object(&self, manifest: &Manifest) -> Result<Manifest, ClusterError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        self.write_locked(&mut state, manifest)
    }

    fn write_locked(&self, state: &mut State, manifest: &Manifest) -> Result<Manifest, ClusterError> {
        let mut obj = manifest.clone();
        if obj.is_cluster_scoped() {
            obj.metadata_mut().remove("namespace");
        }
        let key = obj.key();
        if !obj.is_cluster_scoped() {
            let Some(ns) = obj.namespace().map(String::from) else {
                return Err(ClusterError::Rejected {
                    key,
                    message: "namespace is required for namespaced resources".into(),
                });
            };
            match state.objects.get(&ResourceKey::namespace_key(&ns)) {
                None => return Err(ClusterError::NamespaceNotFound(ns)),
                Some(n) if n.is_deleting() && !state.objects.contains_key(&key) => {
                    return Err(ClusterError::Forbidden(format!(
                        "unable to create {}: namespace {} is being terminated",
                        key, ns
                    )))
                }
                Some(_) => {}
            }
        }

        if let Some(map) = obj.as_value_mut().as_object_mut() {
            map.remove("status");
        }
        match state.objects.get(&key) {
            Some(existing) => {
                if existing.is_deleting() {
                    return Err(ClusterError::Conflict {
                        key,
                        message: "object is being deleted".into(),
                    });
                }
                let generation = if spec_of(existing) != spec_of(&obj) {
                    existing.generation() + 1
                } else {
                    existing.generation().max(1)
                };
                let meta_src = existing.pointer("/metadata").cloned().unwrap_or(json!({}));
                let meta = obj.metadata_mut();
                for field in ["uid", "creationTimestamp", "managedFields", "resourceVersion"] {
                    match meta_src.get(field) {
                        Some(v) => meta.insert(field.into(), v.clone()),
                        None => meta.remove(field),
                    };
                }
                meta.insert("generation".into(), json!(generation));
                if let (Some(status), Some(map)) =
                    (existing.status().cloned(), obj.as_value_mut().as_object_mut())
                {
                    map.insert("status".into(), status);
                }
                self.simulate_status(&mut obj);
                if &obj == existing {
                    return Ok(obj);
                }
            }
            None => {
                state.uid_seq += 1;
                let uid = format!("00000000-0000-4000-8000-{:012x}", state.uid_seq);
                let meta = obj.metadata_mut();
                meta.insert("uid".into(), Value::String(uid));
                meta.insert(
                    "creationTimestamp".into(),
                    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
                meta.insert("generation".into(), json!(1));
                meta.insert(
                    "managedFields".into(),
                    json!([{"manager": "keel", "operation": "Apply"}]),
                );
                meta.remove("deletionTimestamp");
                self.simulate_status(&mut obj);
            }
        }
        self.bump(state, &mut obj);
        state.objects.insert(key, obj.clone());
        self.emit(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    fn write_status(
        &self,
        state: &mut State,
        key: &ResourceKey,
        status: Value,
    ) -> Result<u64, ClusterError> {
        let mut obj = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        if obj.status() == Some(&status) {
            return Ok(obj.resource_version().unwrap_or(state.version));
        }
        if let Some(map) = obj.as_value_mut().as_object_mut() {
            map.insert("status".into(), status);
        }
        let version = self.bump(state, &mut obj);
        state.objects.insert(key.clone(), obj.clone());
        self.emit(WatchEvent::Applied(obj));
        Ok(version)
    }

    fn delete_locked(&self, state: &mut State, key: &ResourceKey) -> Result<u64, ClusterError> {
        let mut obj = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;

        if key.is_namespace() {
            if !obj.is_deleting() {
                obj.metadata_mut().insert("deletionTimestamp".into(), now());
                pointer::set(obj.as_value_mut(), "/status/phase", json!("Terminating"));
                self.bump(state, &mut obj);
                state.objects.insert(key.clone(), obj.clone());
                self.emit(WatchEvent::Applied(obj));
            }
            let contained: Vec<ResourceKey> = state
                .objects
                .keys()
                .filter(|k| k.namespace == key.name)
                .cloned()
                .collect();
            for child in contained {
                self.delete_locked(state, &child)?;
            }
            self.finalize_namespace_if_empty(state, &key.name);
            return Ok(state.version);
        }

        if !obj.finalizers().is_empty() {
            if obj.is_deleting() {
                return Ok(obj.resource_version().unwrap_or(state.version));
            }
            obj.metadata_mut().insert("deletionTimestamp".into(), now());
            let version = self.bump(state, &mut obj);
            state.objects.insert(key.clone(), obj.clone());
            self.emit(WatchEvent::Applied(obj));
            return Ok(version);
        }

        state.objects.remove(key);
        let version = self.bump(state, &mut obj);
        self.emit(WatchEvent::Deleted(obj));
        self.finalize_namespace_if_empty(state, &key.namespace);
        Ok(version)
    }

    fn finalize_namespace_if_empty(&self, state: &mut State, namespace: &str) {
        if namespace.is_empty() {
            return;
        }
        let ns_key = ResourceKey::namespace_key(namespace);
        let terminating = state
            .objects
            .get(&ns_key)
            .is_some_and(|ns| ns.is_deleting());
        let empty = !state.objects.keys().any(|k| k.namespace == namespace);
        if terminating && empty {
            if let Some(mut ns) = state.objects.remove(&ns_key) {
                self.bump(state, &mut ns);
                self.emit(WatchEvent::Deleted(ns));
            }
        }
    }
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Everything except metadata and status.
fn spec_of(m: &Manifest) -> Value {
    let mut v = m.as_value().clone();
    if let Some(map) = v.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    v
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    fn server(&self) -> &str {
        &self.server
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest, ClusterError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        Self::take_fault(&mut state, &manifest.key())?;
        self.write_locked(&mut state, manifest)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<u64, ClusterError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        Self::take_fault(&mut state, key)?;
        self.delete_locked(&mut state, key)
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Manifest>, ClusterError> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(state.objects.get(key).cloned())
    }

    async fn list(&self) -> Result<ListResult, ClusterError> {
        let state = self.lock();
        Self::check_available(&state)?;
        Ok(ListResult {
            items: state.objects.values().cloned().collect(),
            resource_version: state.version,
        })
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    async fn update_status(&self, key: &ResourceKey, status: Value) -> Result<u64, ClusterError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        Self::take_fault(&mut state, key)?;
        self.write_status(&mut state, key, status)
    }

    async fn remove_finalizer(
        &self,
        key: &ResourceKey,
        finalizer: &str,
    ) -> Result<u64, ClusterError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        Self::take_fault(&mut state, key)?;
        let mut obj = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(key.clone()))?;
        let mut finalizers = obj.finalizers();
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        if finalizers.len() == before {
            return Ok(obj.resource_version().unwrap_or(state.version));
        }
        if finalizers.is_empty() {
            obj.metadata_mut().remove("finalizers");
        } else {
            obj.metadata_mut().insert("finalizers".into(), json!(finalizers));
        }
        let version = self.bump(&mut state, &mut obj);
        if obj.is_deleting() && finalizers.is_empty() {
            state.objects.remove(key);
            self.emit(WatchEvent::Deleted(obj));
            self.finalize_namespace_if_empty(&mut state, &key.namespace);
        } else {
            state.objects.insert(key.clone(), obj.clone());
            self.emit(WatchEvent::Applied(obj));
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_map(ns: &str, name: &str, data: Value) -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": ns},
            "data": data
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_assigns_server_metadata() {
        let cluster = MemoryCluster::new();
        let live = cluster
            .apply(&config_map("default", "a", json!({"k": "v"})))
            .await
            .unwrap();
        assert!(live.str_at("/metadata/uid").is_some());
        assert!(live.str_at("/metadata/creationTimestamp").is_some());
        assert_eq!(live.generation(), 1);
        assert_eq!(cluster.write_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_apply_is_noop() {
        let cluster = MemoryCluster::new();
        let cm = config_map("default", "a", json!({"k": "v"}));
        let first = cluster.apply(&cm).await.unwrap();
        let second = cluster.apply(&cm).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.resource_version(), second.resource_version());
    }

    #[tokio::test]
    async fn test_spec_change_bumps_generation_and_keeps_status() {
        let cluster = MemoryCluster::new();
        let cm = config_map("default", "a", json!({"k": "v"}));
        cluster.apply(&cm).await.unwrap();
        cluster.set_status(&cm.key(), json!({"phase": "Ready"})).unwrap();
        let updated = cluster
            .apply(&config_map("default", "a", json!({"k": "w"})))
            .await
            .unwrap();
        assert_eq!(updated.generation(), 2);
        assert_eq!(updated.str_at("/status/phase"), Some("Ready"));
    }

    #[tokio::test]
    async fn test_missing_namespace_rejected() {
        let cluster = MemoryCluster::new();
        let err = cluster
            .apply(&config_map("shop", "a", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, ClusterError::NamespaceNotFound("shop".into()));
    }

    #[tokio::test]
    async fn test_finalizer_delays_deletion() {
        let cluster = MemoryCluster::new();
        let mut cm = config_map("default", "guarded", json!({}));
        cm.metadata_mut()
            .insert("finalizers".into(), json!(["example.com/hold"]));
        cluster.apply(&cm).await.unwrap();
        cluster.delete(&cm.key()).await.unwrap();
        assert!(cluster.object(&cm.key()).unwrap().is_deleting());
        cluster
            .remove_finalizer(&cm.key(), "example.com/hold")
            .await
            .unwrap();
        assert!(!cluster.contains(&cm.key()));
    }

    #[tokio::test]
    async fn test_namespace_deletion_cascades() {
        let cluster = MemoryCluster::new();
        cluster
            .apply(&Manifest::namespace_object("shop"))
            .await
            .unwrap();
        let cm = config_map("shop", "a", json!({}));
        cluster.apply(&cm).await.unwrap();
        cluster
            .delete(&ResourceKey::namespace_key("shop"))
            .await
            .unwrap();
        assert!(!cluster.contains(&cm.key()));
        assert!(!cluster.contains(&ResourceKey::namespace_key("shop")));
    }

    #[tokio::test]
    async fn test_watch_sees_changes_in_order() {
        let cluster = MemoryCluster::new();
        let mut rx = cluster.watch();
        let cm = config_map("default", "a", json!({}));
        cluster.apply(&cm).await.unwrap();
        cluster.delete(&cm.key()).await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, WatchEvent::Applied(_)));
        assert!(matches!(second, WatchEvent::Deleted(_)));
        assert!(second.resource_version() > first.resource_version());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let cluster = MemoryCluster::new();
        let cm = config_map("default", "a", json!({}));
        cluster.fail_next(
            Some(cm.key()),
            ClusterError::Unavailable("flaky".into()),
            2,
        );
        assert!(cluster.apply(&cm).await.is_err());
        assert!(cluster.apply(&cm).await.is_err());
        assert!(cluster.apply(&cm).await.is_ok());
        assert_eq!(cluster.write_count(), 3);
    }

    #[tokio::test]
    async fn test_status_simulator_runs_on_write() {
        let cluster = MemoryCluster::new();
        cluster.add_status_simulator(|m: &Manifest| {
            (m.kind() == "ConfigMap").then(|| json!({"observed": m.generation()}))
        });
        let live = cluster
            .apply(&config_map("default", "a", json!({})))
            .await
            .unwrap();
        assert_eq!(live.pointer("/status/observed"), Some(&json!(1)));
    }
}
