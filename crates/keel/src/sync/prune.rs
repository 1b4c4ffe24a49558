use super::plan::SyncPlan;
use super::{SyncOutcome, SyncRequest, Syncer};
use crate::error::SyncError;
use crate::events::SyncEventPhase;
use crate::resource::{Manifest, ResourceResult, ResourceResultCode};

impl Syncer<'_> {
    /// Deletes prune candidates in plan order. Protected candidates are
    /// reported and left alone. One failed delete does not stop the others.
    pub(super) async fn prune(
        &self,
        plan: &SyncPlan,
        request: &SyncRequest,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        for protected in &plan.protected {
            let message = SyncError::PruneProtection(protected.key.clone()).to_string();
            log::info!("{}", message);
            outcome.prune_skipped.push(protected.key.clone());
            outcome.record(ResourceResult {
                key: protected.key.clone(),
                status: ResourceResultCode::PruneSkipped,
                message,
                hook_phase: None,
                wave: protected.wave,
            });
        }

        let candidates: Vec<_> = plan
            .prune
            .iter()
            .filter(|d| !d.live.as_ref().is_some_and(Manifest::is_deleting))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        if !request.prune {
            log::info!(
                "{} resource(s) of {} require pruning; pruning is disabled",
                candidates.len(),
                self.app.key()
            );
            for candidate in &candidates {
                outcome.record(ResourceResult {
                    key: candidate.key.clone(),
                    status: ResourceResultCode::PruneSkipped,
                    message: "requires pruning".into(),
                    hook_phase: None,
                    wave: candidate.wave,
                });
            }
            return Ok(());
        }

        if plan.desired_count == 0 && !request.allow_empty {
            return Err(SyncError::EmptyPrune {
                count: candidates.len(),
            });
        }

        self.progress.phase(
            SyncEventPhase::Pruning,
            format!("Pruning {} resource(s)", candidates.len()),
        );
        let mut failure = None;
        for candidate in candidates {
            let result = self.delete(&candidate.key).await;
            let (status, message) = match &result {
                Ok(()) => (ResourceResultCode::Pruned, "pruned".to_string()),
                Err(e) => (ResourceResultCode::SyncFailed, e.to_string()),
            };
            match &result {
                Ok(()) => log::info!("Pruned {}", candidate.key),
                Err(e) => log::error!("Failed to prune {}: {}", candidate.key, e),
            }
            self.progress
                .resource(SyncEventPhase::Pruning, &candidate.key, &message);
            outcome.record(ResourceResult {
                key: candidate.key.clone(),
                status,
                message,
                hook_phase: None,
                wave: candidate.wave,
            });
            if let Err(e) = result {
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
