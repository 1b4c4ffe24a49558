//! The destination cluster API seam.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ClusterError;
use crate::resource::{Manifest, ResourceKey};

pub use memory::MemoryCluster;

/// A change observed on the cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Created or updated; carries the full object.
    Applied(Manifest),
    /// Removed; carries the last state with the deletion's resourceVersion.
    Deleted(Manifest),
}

impl WatchEvent {
    pub fn manifest(&self) -> &Manifest {
        match self {
            WatchEvent::Applied(m) | WatchEvent::Deleted(m) => m,
        }
    }

    pub fn resource_version(&self) -> u64 {
        self.manifest().resource_version().unwrap_or(0)
    }
}

/// A consistent snapshot of all objects.
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub items: Vec<Manifest>,
    pub resource_version: u64,
}

/// Operations the reconciler needs from an API server.
///
/// Every mutating call returns the resourceVersion of the change it caused
/// so the caller can wait until its observer has seen it.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// The endpoint Applications name in `destination.server`.
    fn server(&self) -> &str;

    /// Creates or replaces an object. Status and server-managed metadata
    /// of an existing object are preserved.
    async fn apply(&self, manifest: &Manifest) -> Result<Manifest, ClusterError>;

    /// Requests deletion. Objects with finalizers are only marked.
    async fn delete(&self, key: &ResourceKey) -> Result<u64, ClusterError>;

    async fn get(&self, key: &ResourceKey) -> Result<Option<Manifest>, ClusterError>;

    async fn list(&self) -> Result<ListResult, ClusterError>;

    /// Subscribes to changes made after this call.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;

    /// Replaces the status subresource.
    async fn update_status(&self, key: &ResourceKey, status: Value) -> Result<u64, ClusterError>;

    async fn remove_finalizer(&self, key: &ResourceKey, finalizer: &str)
        -> Result<u64, ClusterError>;
}
