//! Sync plan: hooks by phase and resources by wave.

use std::collections::BTreeMap;

use crate::diff::{DiffAction, DiffResult, ResourceDiff};
use crate::resource::annotations::{self, HealthGate, HookDeletePolicy};
use crate::resource::{HookPhase, Manifest, ResourceKey};

/// One hook resource scheduled for one phase.
#[derive(Debug, Clone)]
pub struct HookTask {
    pub key: ResourceKey,
    pub manifest: Manifest,
    pub phase: HookPhase,
    pub wave: i32,
    pub delete_policies: Vec<HookDeletePolicy>,
    pub rerun: bool,
}

impl HookTask {
    pub fn deletes_on(&self, policy: HookDeletePolicy) -> bool {
        self.delete_policies.contains(&policy)
    }
}

/// A resource that belongs to a wave and is gated on its health.
#[derive(Debug, Clone)]
pub struct WaveMember {
    pub key: ResourceKey,
    pub diff: ResourceDiff,
    pub gate: HealthGate,
}

impl WaveMember {
    pub fn needs_apply(&self) -> bool {
        self.diff.needs_apply()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Wave {
    pub number: i32,
    pub members: Vec<WaveMember>,
    pub hooks: Vec<HookTask>,
}

impl Wave {
    pub fn has_work(&self) -> bool {
        !self.hooks.is_empty() || self.members.iter().any(WaveMember::needs_apply)
    }

    /// A `Required` member makes the whole wave require full health.
    pub fn requires_full_health(&self) -> bool {
        self.members.iter().any(|m| m.gate == HealthGate::Required)
    }

    pub fn gated(&self) -> impl Iterator<Item = &WaveMember> {
        self.members.iter().filter(|m| m.gate != HealthGate::Skip)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub pre_sync: Vec<HookTask>,
    /// Ascending. Ends with the last wave that has work.
    pub waves: Vec<Wave>,
    pub post_sync: Vec<HookTask>,
    pub sync_fail: Vec<HookTask>,
    pub prune: Vec<ResourceDiff>,
    pub protected: Vec<ResourceDiff>,
    /// Non-hook resources in the desired set.
    pub desired_count: usize,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.pre_sync.is_empty()
            && self.post_sync.is_empty()
            && self.prune.is_empty()
            && !self.waves.iter().any(Wave::has_work)
    }

    /// Number of resources that will be created or updated.
    pub fn apply_count(&self) -> usize {
        self.waves
            .iter()
            .flat_map(|w| w.members.iter())
            .filter(|m| m.needs_apply())
            .count()
    }
}

/// Builds the plan for one sync from the desired set and its diff.
///
/// Every wave up to the last one with work is kept, including waves with
/// nothing to apply: their resources still gate the waves after them.
pub fn build_plan(desired: &[Manifest], diff: &DiffResult) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let mut waves: BTreeMap<i32, Wave> = BTreeMap::new();

    for item in &diff.items {
        match item.action {
            DiffAction::Prune => plan.prune.push(item.clone()),
            DiffAction::PruneProtected => plan.protected.push(item.clone()),
            DiffAction::Create | DiffAction::Update | DiffAction::Unchanged => {
                plan.desired_count += 1;
                let gate = item
                    .desired
                    .as_ref()
                    .map(annotations::health_gate)
                    .unwrap_or_default();
                waves
                    .entry(item.wave)
                    .or_insert_with(|| Wave {
                        number: item.wave,
                        ..Default::default()
                    })
                    .members
                    .push(WaveMember {
                        key: item.key.clone(),
                        diff: item.clone(),
                        gate,
                    });
            }
        }
    }

    for manifest in desired {
        let phases = annotations::hook_phases(manifest);
        for phase in phases {
            let task = HookTask {
                key: manifest.key(),
                manifest: manifest.clone(),
                phase,
                wave: annotations::sync_wave(manifest),
                delete_policies: annotations::hook_delete_policies(manifest),
                rerun: annotations::hook_rerun(manifest),
            };
            match phase {
                HookPhase::PreSync => plan.pre_sync.push(task),
                HookPhase::Sync => waves
                    .entry(task.wave)
                    .or_insert_with(|| Wave {
                        number: task.wave,
                        ..Default::default()
                    })
                    .hooks
                    .push(task),
                HookPhase::PostSync => plan.post_sync.push(task),
                HookPhase::SyncFail => plan.sync_fail.push(task),
                HookPhase::Skip => {}
            }
        }
    }

    for hooks in [&mut plan.pre_sync, &mut plan.post_sync, &mut plan.sync_fail] {
        hooks.sort_by(|a, b| a.wave.cmp(&b.wave).then_with(|| a.key.cmp(&b.key)));
    }

    let last_with_work = waves
        .values()
        .filter(|w| w.has_work())
        .map(|w| w.number)
        .max();
    plan.waves = match last_with_work {
        Some(last) => waves.into_values().filter(|w| w.number <= last).collect(),
        None => Vec::new(),
    };

    plan.prune.sort_by(|a, b| prune_order(a).cmp(&prune_order(b)));
    plan
}

/// Reverse wave, namespaced before cluster-scoped, Namespaces last.
fn prune_order(d: &ResourceDiff) -> (u8, i32, ResourceKey) {
    deletion_rank(&d.key, d.wave)
}

/// Sort key for deletions: namespaced objects first, then cluster-scoped
/// ones, Namespaces last; reverse wave within each class.
pub(crate) fn deletion_rank(key: &ResourceKey, wave: i32) -> (u8, i32, ResourceKey) {
    let class = if key.is_namespace() {
        2
    } else if key.is_cluster_scoped() {
        1
    } else {
        0
    };
    (class, -wave, key.clone())
}

/// Groups hooks by wave, ascending.
pub fn hooks_by_wave(hooks: &[HookTask]) -> Vec<Vec<HookTask>> {
    let mut grouped: BTreeMap<i32, Vec<HookTask>> = BTreeMap::new();
    for hook in hooks {
        grouped.entry(hook.wave).or_default().push(hook.clone());
    }
    grouped.into_values().collect()
}
