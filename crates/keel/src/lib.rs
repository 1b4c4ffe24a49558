pub mod cache;
pub mod cascade;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod events;
pub mod health;
pub mod rbac;
pub mod reconciler;
pub mod resource;
pub mod retry;
pub mod scheduler;
pub mod secrets;
pub mod source;
pub mod status;
pub mod sync;
pub mod telemetry;

pub use cache::{CacheChange, LiveStateCache};
pub use cascade::{CascadeDeleter, CascadeOutcome};
pub use cluster::{ClusterApi, MemoryCluster, WatchEvent};
pub use config::{ConfigLoader, ControllerConfig, ControllerSettings};
pub use controller::Controller;
pub use diff::{DiffAction, DiffResult, ResourceDiff};
pub use error::{ClusterError, ConfigError, KeelError, Result, SyncError};
pub use events::{CancelToken, EventBroadcaster, SyncEvent, SyncEventPhase};
pub use health::{HealthAssessment, HealthRegistry, HealthStatus, HealthTracker};
pub use reconciler::{Cycle, ReconcileOutcome, Reconciler, SyncIntent};
pub use resource::{Application, Manifest, Project, ResourceKey};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use source::{DirectoryRenderer, GitRenderer, MemoryRenderer, RenderError, Renderer, SourceRouter};
pub use status::StatusBuilder;
pub use sync::{SyncOutcome, SyncRequest, Syncer};
pub use telemetry::{init_logging, LogFormat};
