//! Sync progress events for presentation layers.

pub mod progress;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::resource::{HookPhase, ResourceKey};

pub use progress::{CancelToken, OperationProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventPhase {
    Starting,
    PreSync,
    WaveApplying,
    WaveWaiting,
    WaveHealthy,
    PostSync,
    Pruning,
    SyncFail,
    Deleting,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for SyncEventPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncEventPhase::Starting => write!(f, "Starting..."),
            SyncEventPhase::PreSync => write!(f, "Running PreSync hooks..."),
            SyncEventPhase::WaveApplying => write!(f, "Applying wave..."),
            SyncEventPhase::WaveWaiting => write!(f, "Waiting for wave health..."),
            SyncEventPhase::WaveHealthy => write!(f, "Wave healthy"),
            SyncEventPhase::PostSync => write!(f, "Running PostSync hooks..."),
            SyncEventPhase::Pruning => write!(f, "Pruning..."),
            SyncEventPhase::SyncFail => write!(f, "Running SyncFail hooks..."),
            SyncEventPhase::Deleting => write!(f, "Deleting resources..."),
            SyncEventPhase::Completed => write!(f, "Completed"),
            SyncEventPhase::Failed => write!(f, "Failed"),
            SyncEventPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl From<HookPhase> for SyncEventPhase {
    fn from(phase: HookPhase) -> Self {
        match phase {
            HookPhase::PreSync => SyncEventPhase::PreSync,
            HookPhase::Sync | HookPhase::Skip => SyncEventPhase::WaveApplying,
            HookPhase::PostSync => SyncEventPhase::PostSync,
            HookPhase::SyncFail => SyncEventPhase::SyncFail,
        }
    }
}

/// One progress event of a sync or deletion operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub operation_id: String,
    /// `namespace/name` of the Application.
    pub application: String,
    pub revision: String,
    pub phase: SyncEventPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncEvent {
    pub fn new(
        operation_id: &str,
        application: &str,
        revision: &str,
        phase: SyncEventPhase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            application: application.to_string(),
            revision: revision.to_string(),
            phase,
            message: message.into(),
            wave: None,
            resource: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_wave(mut self, wave: i32) -> Self {
        self.wave = Some(wave);
        self
    }

    pub fn with_resource(mut self, key: &ResourceKey) -> Self {
        self.resource = Some(key.to_string());
        self
    }
}

/// Broadcasts sync events to any number of subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<SyncEvent>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: SyncEvent) {
        // No active receivers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Starts tracking a new operation for `application` at `revision`.
    pub fn start_operation(
        &self,
        application: &str,
        revision: &str,
        cancel: CancelToken,
    ) -> OperationProgress {
        OperationProgress::new(application, revision, Arc::clone(&self.sender), cancel)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcaster_send_receive() {
        let broadcaster = EventBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();
        broadcaster.send(SyncEvent::new(
            "op",
            "keel/shop",
            "abc",
            SyncEventPhase::WaveApplying,
            "Applying wave 0",
        ));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.phase, SyncEventPhase::WaveApplying);
        assert_eq!(received.application, "keel/shop");
    }

    #[test]
    fn test_send_without_receivers() {
        let broadcaster = EventBroadcaster::new(10);
        broadcaster.send(SyncEvent::new("op", "a", "r", SyncEventPhase::Completed, "done"));
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = SyncEvent::new("op", "keel/shop", "abc", SyncEventPhase::PreSync, "hooks")
            .with_wave(-1);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operationId"], "op");
        assert_eq!(json["phase"], "pre_sync");
        assert_eq!(json["wave"], -1);
        assert!(json.get("resource").is_none());
    }
}
