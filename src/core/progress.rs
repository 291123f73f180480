//! In-memory progress tracking for the running batch.
//!
//! Holds the latest `Operation` snapshot per device so a view can poll live
//! state without touching the coordinator. Snapshots are replaced wholesale;
//! the tracker never mutates an operation itself.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::operation::{Operation, OperationStatus};

/// Thread-safe store of operation snapshots, shared through `AppContext`.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, Operation>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish the current snapshot of an operation.
    pub async fn update(&self, snapshot: Operation) {
        let mut map = self.inner.write().await;
        map.insert(snapshot.device_id.clone(), snapshot);
    }

    pub async fn get(&self, device_id: &str) -> Option<Operation> {
        let map = self.inner.read().await;
        map.get(device_id).cloned()
    }

    /// Drop all snapshots (called when a new batch starts).
    pub async fn clear(&self) {
        let mut map = self.inner.write().await;
        map.clear();
    }

    pub async fn get_all(&self) -> HashMap<String, Operation> {
        let map = self.inner.read().await;
        map.clone()
    }

    /// Number of operations currently `Ongoing`.
    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.values()
            .filter(|op| op.status == OperationStatus::Ongoing)
            .count()
    }
}
