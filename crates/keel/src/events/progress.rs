//! Per-operation progress tracking with cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use super::{SyncEvent, SyncEventPhase};
use crate::resource::ResourceKey;

/// Cooperative cancellation shared between a controller and one cycle.
///
/// The cycle checks it at wave boundaries and while waiting; it never
/// interrupts a wave that is already applying.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut r) = self.reason.lock() {
            if r.is_none() {
                *r = Some(reason.into());
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> String {
        self.reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "cancelled".to_string())
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration`; returns false if cancelled first.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Emits the events of one sync operation under a shared operation id.
pub struct OperationProgress {
    operation_id: String,
    application: String,
    revision: String,
    broadcaster: Arc<broadcast::Sender<SyncEvent>>,
    cancel: CancelToken,
}

impl OperationProgress {
    pub fn new(
        application: impl Into<String>,
        revision: impl Into<String>,
        broadcaster: Arc<broadcast::Sender<SyncEvent>>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            application: application.into(),
            revision: revision.into(),
            broadcaster,
            cancel,
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn event(&self, phase: SyncEventPhase, message: impl Into<String>) -> SyncEvent {
        SyncEvent::new(
            &self.operation_id,
            &self.application,
            &self.revision,
            phase,
            message,
        )
    }

    fn send(&self, event: SyncEvent) {
        let _ = self.broadcaster.send(event);
    }

    pub fn phase(&self, phase: SyncEventPhase, message: impl Into<String>) {
        self.send(self.event(phase, message));
    }

    pub fn wave(&self, phase: SyncEventPhase, wave: i32, message: impl Into<String>) {
        self.send(self.event(phase, message).with_wave(wave));
    }

    pub fn resource(&self, phase: SyncEventPhase, key: &ResourceKey, message: impl Into<String>) {
        self.send(self.event(phase, message).with_resource(key));
    }

    pub fn completed(&self, message: impl Into<String>) {
        self.phase(SyncEventPhase::Completed, message);
    }

    pub fn failed(&self, error: &str) {
        let mut event = self.event(SyncEventPhase::Failed, "Operation failed");
        event.error = Some(error.to_string());
        self.send(event);
    }
}
