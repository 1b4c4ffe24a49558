//! Desired vs. live comparison.
//!
//! Classification is a pure function of the desired set and a snapshot of
//! live objects: nothing here touches the cluster, which makes every result
//! usable as a dry run.

pub mod normalize;
pub mod pointer;

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::resource::annotations::{self, LAST_APPLIED, TRACKING_ID};
use crate::resource::{Application, Manifest, ResourceKey, ResourceSyncOptions, TrackingId};

pub use normalize::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffAction {
    Create,
    Update,
    Unchanged,
    /// Owned, live, and absent from the desired set.
    Prune,
    /// Would be pruned but carries the protection marker.
    PruneProtected,
}

#[derive(Debug, Clone)]
pub struct ResourceDiff {
    pub key: ResourceKey,
    pub action: DiffAction,
    pub wave: i32,
    /// JSON pointers that differ, for updates.
    pub changed: Vec<String>,
    pub desired: Option<Manifest>,
    pub live: Option<Manifest>,
}

impl ResourceDiff {
    pub fn needs_apply(&self) -> bool {
        matches!(self.action, DiffAction::Create | DiffAction::Update)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub items: Vec<ResourceDiff>,
}

impl DiffResult {
    /// No creates, updates or prunes. Protected extraneous resources are
    /// reported but do not make the Application out of sync.
    pub fn is_synced(&self) -> bool {
        self.items
            .iter()
            .all(|d| matches!(d.action, DiffAction::Unchanged | DiffAction::PruneProtected))
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceDiff> {
        self.items.iter().find(|d| &d.key == key)
    }

    pub fn with_action(&self, action: DiffAction) -> impl Iterator<Item = &ResourceDiff> {
        self.items.iter().filter(move |d| d.action == action)
    }

    pub fn count(&self, action: DiffAction) -> usize {
        self.with_action(action).count()
    }
}

/// Ignore paths for one resource: its own annotation plus matching
/// `ignoreDifferences` rules of the Application.
pub fn ignore_paths_for(app: &Application, key: &ResourceKey, desired: &Manifest) -> Vec<String> {
    let mut paths = annotations::ignore_paths(desired);
    for rule in &app.spec.ignore_differences {
        if rule.matches(key) {
            paths.extend(rule.json_pointers.iter().cloned());
        }
    }
    paths.sort();
    paths.dedup();
    paths
}

/// Compares an Application's desired set against live state.
///
/// `desired` must already have namespaces defaulted. Hooks are skipped:
/// they are executed, never diffed.
pub fn diff(
    app: &Application,
    desired: &[Manifest],
    live: &BTreeMap<ResourceKey, Manifest>,
) -> DiffResult {
    let owner = app.tracking_id();
    let mut items = Vec::new();
    let mut desired_keys = BTreeSet::new();

    for manifest in desired.iter().filter(|m| !annotations::is_hook(m)) {
        let key = manifest.key();
        desired_keys.insert(key.clone());
        let wave = annotations::sync_wave(manifest);
        let live_obj = live.get(&key);
        let (action, changed) = match live_obj {
            None => (DiffAction::Create, Vec::new()),
            Some(l) => {
                let ignore = ignore_paths_for(app, &key, manifest);
                let mut changed = compare(manifest, l, &ignore);
                if TrackingId::of(l).as_ref() != Some(&owner) {
                    changed.push(pointer::join("/metadata/annotations", TRACKING_ID));
                }
                if changed.is_empty() {
                    (DiffAction::Unchanged, changed)
                } else {
                    (DiffAction::Update, changed)
                }
            }
        };
        items.push(ResourceDiff {
            key,
            action,
            wave,
            changed,
            desired: Some(manifest.clone()),
            live: live_obj.cloned(),
        });
    }

    for (key, obj) in live {
        if desired_keys.contains(key) || annotations::is_hook(obj) {
            continue;
        }
        if TrackingId::of(obj).as_ref() != Some(&owner) {
            continue;
        }
        if *key == app.key() {
            continue;
        }
        let action = if ResourceSyncOptions::from_manifest(obj).prune_disabled {
            DiffAction::PruneProtected
        } else {
            DiffAction::Prune
        };
        items.push(ResourceDiff {
            key: key.clone(),
            action,
            wave: annotations::sync_wave(obj),
            changed: Vec::new(),
            desired: None,
            live: Some(obj.clone()),
        });
    }

    DiffResult { items }
}

/// Returns the JSON pointers at which `live` does not match `desired`.
///
/// Desired fields must be present and equal in live (extra live fields are
/// defaults or owned by others). Fields the controller applied previously
/// but that are no longer desired are reported too, using the
/// last-applied annotation.
pub fn compare(desired: &Manifest, live: &Manifest, ignore: &[String]) -> Vec<String> {
    let d = normalize(desired, ignore);
    let l = normalize(live, ignore);
    let mut changed = BTreeSet::new();
    subset_diff("", &d, &l, &mut changed);

    if let Some(last) = live
        .annotation(LAST_APPLIED)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|v| Manifest::from_value(v).ok())
    {
        let last = normalize(&last, ignore);
        removed_fields("", &last, &d, &l, &mut changed);
    }
    changed.into_iter().collect()
}

fn subset_diff(path: &str, desired: &Value, live: &Value, out: &mut BTreeSet<String>) {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => {
            for (k, dv) in d {
                let child = pointer::join(path, k);
                match l.get(k) {
                    Some(lv) => subset_diff(&child, dv, lv, out),
                    None if dv.is_null() => {}
                    None if is_empty_container(dv) => {}
                    None => {
                        out.insert(child);
                    }
                }
            }
        }
        (Value::Array(d), Value::Array(l)) => {
            if d.len() != l.len() {
                out.insert(path.to_string());
                return;
            }
            for (i, (dv, lv)) in d.iter().zip(l).enumerate() {
                subset_diff(&format!("{}/{}", path, i), dv, lv, out);
            }
        }
        (d, l) => {
            if !scalar_eq(d, l) {
                out.insert(if path.is_empty() { "/".into() } else { path.to_string() });
            }
        }
    }
}

/// Reports fields present in `last` and `live` but dropped from `desired`.
fn removed_fields(
    path: &str,
    last: &Value,
    desired: &Value,
    live: &Value,
    out: &mut BTreeSet<String>,
) {
    let Value::Object(last_map) = last else {
        return;
    };
    for (k, last_v) in last_map {
        let child = pointer::join(path, k);
        let live_v = match live.get(k) {
            Some(v) => v,
            None => continue,
        };
        match desired.get(k) {
            None => {
                out.insert(child);
            }
            Some(desired_v) => removed_fields(&child, last_v, desired_v, live_v, out),
        }
    }
}

fn is_empty_container(v: &Value) -> bool {
    match v {
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Numbers compare by value so `1` and `1.0` are equal.
fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
