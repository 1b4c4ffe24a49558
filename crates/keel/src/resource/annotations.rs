//! Annotation vocabulary read from individual resources.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::manifest::{Manifest, ResourceKey};

pub const SYNC_WAVE: &str = "keel.io/sync-wave";
pub const HOOK: &str = "keel.io/hook";
pub const HOOK_DELETE_POLICY: &str = "keel.io/hook-delete-policy";
pub const HOOK_RERUN: &str = "keel.io/hook-rerun";
pub const SYNC_OPTIONS: &str = "keel.io/sync-options";
pub const IGNORE_DIFF: &str = "keel.io/ignore-diff";
pub const HEALTH_GATE: &str = "keel.io/health-gate";
pub const TRACKING_ID: &str = "keel.io/tracking-id";
pub const LAST_APPLIED: &str = "keel.io/last-applied";
/// Set on Applications to request a refresh or a manual sync.
pub const REFRESH: &str = "keel.io/refresh";

/// Annotations written by the controller itself; excluded from diffs.
pub const BOOKKEEPING: &[&str] = &[TRACKING_ID, LAST_APPLIED, REFRESH];

/// Lifecycle phase of a hook resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookPhase {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
    /// Never applied by the controller.
    Skip,
}

impl HookPhase {
    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "PreSync" => Some(HookPhase::PreSync),
            "Sync" => Some(HookPhase::Sync),
            "PostSync" => Some(HookPhase::PostSync),
            "SyncFail" => Some(HookPhase::SyncFail),
            "Skip" => Some(HookPhase::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookPhase::PreSync => "PreSync",
            HookPhase::Sync => "Sync",
            HookPhase::PostSync => "PostSync",
            HookPhase::SyncFail => "SyncFail",
            HookPhase::Skip => "Skip",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookDeletePolicy {
    HookSucceeded,
    HookFailed,
    BeforeHookCreation,
}

/// Whether a resource participates in its wave's health gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthGate {
    #[default]
    Default,
    Skip,
    Required,
}

/// Returns the sync wave of a resource (default 0).
pub fn sync_wave(manifest: &Manifest) -> i32 {
    match manifest.annotation(SYNC_WAVE) {
        None => 0,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!(
                "Ignoring invalid {} '{}' on {}",
                SYNC_WAVE,
                raw,
                manifest.key()
            );
            0
        }),
    }
}

/// Hook phases declared on a resource. Empty for ordinary resources.
pub fn hook_phases(manifest: &Manifest) -> Vec<HookPhase> {
    let Some(raw) = manifest.annotation(HOOK) else {
        return Vec::new();
    };
    let mut phases: Vec<HookPhase> = raw
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| {
            let phase = HookPhase::parse(s);
            if phase.is_none() {
                log::warn!("Ignoring unknown hook phase '{}' on {}", s, manifest.key());
            }
            phase
        })
        .collect();
    phases.sort();
    phases.dedup();
    phases
}

pub fn is_hook(manifest: &Manifest) -> bool {
    !hook_phases(manifest).is_empty()
}

/// Delete policies of a hook; defaults to `BeforeHookCreation`.
pub fn hook_delete_policies(manifest: &Manifest) -> Vec<HookDeletePolicy> {
    let policies: Vec<HookDeletePolicy> = manifest
        .annotation(HOOK_DELETE_POLICY)
        .map(|raw| {
            raw.split(',')
                .filter_map(|s| match s.trim() {
                    "HookSucceeded" => Some(HookDeletePolicy::HookSucceeded),
                    "HookFailed" => Some(HookDeletePolicy::HookFailed),
                    "BeforeHookCreation" => Some(HookDeletePolicy::BeforeHookCreation),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    if policies.is_empty() {
        vec![HookDeletePolicy::BeforeHookCreation]
    } else {
        policies
    }
}

pub fn hook_rerun(manifest: &Manifest) -> bool {
    manifest
        .annotation(HOOK_RERUN)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// JSON pointers listed in the resource's ignore-diff annotation.
pub fn ignore_paths(manifest: &Manifest) -> Vec<String> {
    manifest
        .annotation(IGNORE_DIFF)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| s.starts_with('/'))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

pub fn health_gate(manifest: &Manifest) -> HealthGate {
    match manifest.annotation(HEALTH_GATE).map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("skip") => HealthGate::Skip,
        Some(v) if v.eq_ignore_ascii_case("required") => HealthGate::Required,
        _ => HealthGate::Default,
    }
}

/// Options set on one resource through its sync-options annotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSyncOptions {
    /// `Prune=false`: never pruned.
    pub prune_disabled: bool,
    /// `Delete=false`: orphaned instead of deleted during cascade.
    pub delete_disabled: bool,
    /// `Replace=true`: delete and recreate instead of updating.
    pub replace: bool,
}

impl ResourceSyncOptions {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut opts = Self::default();
        let Some(raw) = manifest.annotation(SYNC_OPTIONS) else {
            return opts;
        };
        for (key, value) in parse_options(raw.split(',')) {
            match (key.as_str(), value.as_str()) {
                ("Prune", "false") => opts.prune_disabled = true,
                ("Delete", "false") => opts.delete_disabled = true,
                ("Replace", "true") => opts.replace = true,
                _ => {}
            }
        }
        opts
    }
}

/// Application-level sync options (`spec.syncPolicy.syncOptions`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub create_namespace: bool,
    pub respect_ignore_differences: bool,
    pub prune_last: bool,
    pub replace: bool,
    pub apply_out_of_sync_only: bool,
}

impl SyncOptions {
    pub fn parse<'a>(options: impl IntoIterator<Item = &'a String>) -> Self {
        let mut opts = Self::default();
        for (key, value) in parse_options(options.into_iter().map(String::as_str)) {
            let on = value == "true";
            match key.as_str() {
                "CreateNamespace" => opts.create_namespace = on,
                "RespectIgnoreDifferences" => opts.respect_ignore_differences = on,
                "PruneLast" => opts.prune_last = on,
                "Replace" => opts.replace = on,
                "ApplyOutOfSyncOnly" => opts.apply_out_of_sync_only = on,
                "ServerSideApply" | "Validate" | "PrunePropagationPolicy" => {}
                other => log::debug!("Ignoring unsupported sync option '{}'", other),
            }
        }
        opts
    }
}

fn parse_options<'a>(items: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    items
        .filter_map(|item| {
            let (k, v) = item.trim().split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_ascii_lowercase()))
        })
        .collect()
}

/// Identity of the Application that owns a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackingId {
    pub app_namespace: String,
    pub app_name: String,
}

impl TrackingId {
    pub fn new(app_namespace: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            app_namespace: app_namespace.into(),
            app_name: app_name.into(),
        }
    }

    /// Annotation value for a resource owned by this Application. The
    /// resource identity is embedded so a copied object is not adopted.
    pub fn annotation_value(&self, key: &ResourceKey) -> String {
        format!(
            "{}_{}:{}/{}:{}/{}",
            self.app_namespace, self.app_name, key.group, key.kind, key.namespace, key.name
        )
    }

    /// Parses a tracking annotation, returning the owner only when the
    /// embedded identity matches the object's own key.
    pub fn parse(value: &str, key: &ResourceKey) -> Option<Self> {
        let (owner, rest) = value.split_once(':')?;
        let (app_namespace, app_name) = owner.split_once('_')?;
        let (group_kind, namespaced_name) = rest.split_once(':')?;
        let (group, kind) = group_kind.split_once('/')?;
        let (namespace, name) = namespaced_name.split_once('/')?;
        if group != key.group || kind != key.kind || namespace != key.namespace || name != key.name
        {
            return None;
        }
        Some(Self::new(app_namespace, app_name))
    }

    pub fn of(manifest: &Manifest) -> Option<Self> {
        Self::parse(manifest.annotation(TRACKING_ID)?, &manifest.key())
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_namespace, self.app_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_annotations(annotations: serde_json::Value) -> Manifest {
        Manifest::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "shop", "annotations": annotations}
        }))
        .unwrap()
    }

    #[test]
    fn test_sync_wave_default_and_invalid() {
        assert_eq!(sync_wave(&with_annotations(json!({}))), 0);
        assert_eq!(sync_wave(&with_annotations(json!({SYNC_WAVE: "-2"}))), -2);
        assert_eq!(sync_wave(&with_annotations(json!({SYNC_WAVE: "abc"}))), 0);
    }

    #[test]
    fn test_hook_phases_parsed_and_deduplicated() {
        let m = with_annotations(json!({HOOK: "PostSync, PreSync,PreSync,Bogus"}));
        assert_eq!(hook_phases(&m), vec![HookPhase::PreSync, HookPhase::PostSync]);
        assert!(is_hook(&m));
        assert!(!is_hook(&with_annotations(json!({}))));
    }

    #[test]
    fn test_hook_delete_policy_default() {
        let m = with_annotations(json!({HOOK: "Sync"}));
        assert_eq!(
            hook_delete_policies(&m),
            vec![HookDeletePolicy::BeforeHookCreation]
        );
        let m = with_annotations(json!({HOOK_DELETE_POLICY: "HookSucceeded,HookFailed"}));
        assert_eq!(
            hook_delete_policies(&m),
            vec![HookDeletePolicy::HookSucceeded, HookDeletePolicy::HookFailed]
        );
    }

    #[test]
    fn test_resource_sync_options() {
        let m = with_annotations(json!({SYNC_OPTIONS: "Prune=false,Delete=false"}));
        let opts = ResourceSyncOptions::from_manifest(&m);
        assert!(opts.prune_disabled);
        assert!(opts.delete_disabled);
        assert!(!opts.replace);
    }

    #[test]
    fn test_application_sync_options() {
        let raw = vec![
            "CreateNamespace=true".to_string(),
            "RespectIgnoreDifferences=true".to_string(),
            "Unknown=true".to_string(),
        ];
        let opts = SyncOptions::parse(&raw);
        assert!(opts.create_namespace);
        assert!(opts.respect_ignore_differences);
        assert!(!opts.prune_last);
    }

    #[test]
    fn test_ignore_paths_only_pointers() {
        let m = with_annotations(json!({IGNORE_DIFF: "/spec/replicas, spec/bad ,/metadata/labels"}));
        assert_eq!(ignore_paths(&m), vec!["/spec/replicas", "/metadata/labels"]);
    }

    #[test]
    fn test_tracking_id_round_trip_and_copy_rejected() {
        let key = ResourceKey::new("batch", "Job", "shop", "migrate");
        let owner = TrackingId::new("keel", "shop");
        let value = owner.annotation_value(&key);
        assert_eq!(value, "keel_shop:batch/Job:shop/migrate");
        assert_eq!(TrackingId::parse(&value, &key), Some(owner));

        let copied = ResourceKey::new("batch", "Job", "shop", "migrate-copy");
        assert_eq!(TrackingId::parse(&value, &copied), None);
    }

    #[test]
    fn test_health_gate() {
        assert_eq!(
            health_gate(&with_annotations(json!({HEALTH_GATE: "Skip"}))),
            HealthGate::Skip
        );
        assert_eq!(
            health_gate(&with_annotations(json!({HEALTH_GATE: "required"}))),
            HealthGate::Required
        );
        assert_eq!(health_gate(&with_annotations(json!({}))), HealthGate::Default);
    }
}
