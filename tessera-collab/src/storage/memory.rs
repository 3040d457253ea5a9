//! In-process snapshot store for tests and single-machine setups.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;

use super::{CanvasSnapshot, ChangeFeed, SnapshotChange, SnapshotStore, StoreError};

pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, CanvasSnapshot>>,
    feed: ChangeFeed,
    available: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
            feed: ChangeFeed::default(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: writes fail until availability is restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn write(&self, snapshot: CanvasSnapshot) -> Result<SnapshotChange, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }

        let previous = {
            let mut snapshots = self
                .snapshots
                .write()
                .map_err(|_| StoreError::DatabaseError("snapshot map poisoned".into()))?;
            snapshots.insert(snapshot.project_id.clone(), snapshot.clone())
        };

        let change = SnapshotChange::new(snapshot, previous);
        self.feed.publish(change.clone());
        Ok(change)
    }

    async fn read(&self, project_id: &str) -> Result<Option<CanvasSnapshot>, StoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| StoreError::DatabaseError("snapshot map poisoned".into()))?;
        Ok(snapshots.get(project_id).cloned())
    }

    fn subscribe(&self, project_id: &str) -> broadcast::Receiver<SnapshotChange> {
        self.feed.subscribe(project_id)
    }
}
