use futures_util::future::join_all;
use tracing::Instrument;

use super::plan::{Wave, WaveMember};
use super::{SyncOutcome, SyncRequest, Syncer};
use crate::diff::DiffAction;
use crate::error::SyncError;
use crate::events::SyncEventPhase;
use crate::health::HealthStatus;
use crate::resource::{ApplicationStatus, ResourceKey, ResourceResult, ResourceResultCode};

/// Result of one look at a wave's health.
#[derive(Debug, Default, PartialEq)]
pub struct WaveHealth {
    /// Resources the wave is still waiting on.
    pub pending: Vec<ResourceKey>,
    /// Degraded resources that were let through.
    pub degraded: Vec<ResourceKey>,
}

impl WaveHealth {
    pub fn passed(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Decides whether one status passes a wave's gate.
pub fn passes_gate(status: HealthStatus, strict: bool, accept_progressing: bool) -> bool {
    match status {
        HealthStatus::Healthy => true,
        HealthStatus::Suspended | HealthStatus::Degraded => !strict,
        HealthStatus::Progressing => accept_progressing && !strict,
        HealthStatus::Missing | HealthStatus::Unknown => false,
    }
}

impl Syncer<'_> {
    pub(super) async fn run_wave(
        &self,
        wave: &Wave,
        request: &SyncRequest,
        previous: &ApplicationStatus,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        let span = tracing::info_span!("wave", app = %self.app.key(), wave = wave.number);
        async {
            let pending: Vec<&WaveMember> = wave.members.iter().filter(|m| m.needs_apply()).collect();
            if !pending.is_empty() {
                self.progress.wave(
                    SyncEventPhase::WaveApplying,
                    wave.number,
                    format!("Applying {} resource(s) in wave {}", pending.len(), wave.number),
                );
                let results = join_all(pending.iter().map(|m| self.apply_resource(&m.diff))).await;

                let mut failure = None;
                for (member, result) in pending.iter().zip(results) {
                    let (status, message) = match &result {
                        Ok(_) if member.diff.action == DiffAction::Create => {
                            (ResourceResultCode::Synced, "created".to_string())
                        }
                        Ok(_) => (ResourceResultCode::Synced, "configured".to_string()),
                        Err(e) => {
                            log::error!("Failed to apply {}: {}", member.key, e);
                            (ResourceResultCode::SyncFailed, e.to_string())
                        }
                    };
                    self.progress
                        .resource(SyncEventPhase::WaveApplying, &member.key, &message);
                    outcome.record(ResourceResult {
                        key: member.key.clone(),
                        status,
                        message,
                        hook_phase: None,
                        wave: wave.number,
                    });
                    if let Err(e) = result {
                        failure.get_or_insert(e);
                    }
                }
                // Later waves stay blocked; the rest of this wave was applied.
                if let Some(e) = failure {
                    return Err(e);
                }
            }

            if !wave.hooks.is_empty() {
                self.run_hooks(&wave.hooks, request, previous, outcome).await?;
            }

            let version = self.written.load(std::sync::atomic::Ordering::SeqCst);
            if version > 0 && !self.cache.wait_for_version(version, self.settings.wave_timeout).await {
                log::warn!("Cache did not observe resourceVersion {} in time", version);
            }
            self.await_wave_health(wave).await
        }
        .instrument(span)
        .await
    }

    /// Evaluates every gated member of `wave` against the cache.
    pub fn wave_health(&self, wave: &Wave) -> WaveHealth {
        let strict = wave.requires_full_health();
        let mut health = WaveHealth::default();
        for member in wave.gated() {
            let assessment = self.health.evaluate(self.cache.get(&member.key).as_ref());
            self.tracker.observe(&member.key, &assessment);
            if !passes_gate(assessment.status, strict, self.settings.accept_progressing) {
                health.pending.push(member.key.clone());
            } else if assessment.status == HealthStatus::Degraded {
                health.degraded.push(member.key.clone());
            }
        }
        health
    }

    async fn await_wave_health(&self, wave: &Wave) -> Result<(), SyncError> {
        let mut announced = false;
        let mut last = WaveHealth::default();
        let passed = self
            .poll_until(self.settings.wave_timeout, || {
                let health = self.wave_health(wave);
                if health.passed() {
                    return Some(health);
                }
                if !announced {
                    self.progress.wave(
                        SyncEventPhase::WaveWaiting,
                        wave.number,
                        format!(
                            "Waiting for {} resource(s) in wave {}",
                            health.pending.len(),
                            wave.number
                        ),
                    );
                    announced = true;
                }
                last = health;
                None
            })
            .await?;

        match passed {
            Some(health) => {
                for key in &health.degraded {
                    log::warn!("{} is Degraded; wave {} continues", key, wave.number);
                    self.progress
                        .resource(SyncEventPhase::WaveHealthy, key, "Degraded");
                }
                self.progress.wave(
                    SyncEventPhase::WaveHealthy,
                    wave.number,
                    format!("Wave {} healthy", wave.number),
                );
                Ok(())
            }
            None => Err(SyncError::HealthTimeout {
                wave: wave.number,
                pending: last.pending,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_default() {
        assert!(passes_gate(HealthStatus::Healthy, false, false));
        assert!(passes_gate(HealthStatus::Suspended, false, false));
        assert!(passes_gate(HealthStatus::Degraded, false, false));
        assert!(!passes_gate(HealthStatus::Progressing, false, false));
        assert!(!passes_gate(HealthStatus::Missing, false, false));
        assert!(!passes_gate(HealthStatus::Unknown, false, true));
    }

    #[test]
    fn test_gate_accept_progressing() {
        assert!(passes_gate(HealthStatus::Progressing, false, true));
        assert!(!passes_gate(HealthStatus::Progressing, true, true));
    }

    #[test]
    fn test_gate_strict_requires_healthy() {
        assert!(passes_gate(HealthStatus::Healthy, true, false));
        assert!(!passes_gate(HealthStatus::Degraded, true, false));
        assert!(!passes_gate(HealthStatus::Suspended, true, false));
    }
}
