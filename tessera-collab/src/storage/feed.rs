//! Project-scoped pub/sub for snapshot changes.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use super::SnapshotChange;

/// One broadcast channel per project, created on first subscribe or publish.
pub struct ChangeFeed {
    topics: Mutex<HashMap<String, broadcast::Sender<SnapshotChange>>>,
    capacity: usize,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn subscribe(&self, project_id: &str) -> broadcast::Receiver<SnapshotChange> {
        self.sender(project_id).subscribe()
    }

    /// Deliver `change` to the project's subscribers. Returns how many got it.
    pub fn publish(&self, change: SnapshotChange) -> usize {
        let sender = self.sender(&change.project_id);
        let delivered = sender.send(change).unwrap_or(0);
        log::trace!("Snapshot change delivered to {delivered} subscribers");
        delivered
    }

    /// Close a project's topic. Its subscribers see `RecvError::Closed`.
    pub fn close(&self, project_id: &str) -> bool {
        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics.remove(project_id).is_some()
    }

    /// Drop topics nobody listens to any more.
    pub fn prune(&self) -> usize {
        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = topics.len();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        before - topics.len()
    }

    pub fn topic_count(&self) -> usize {
        match self.topics.lock() {
            Ok(topics) => topics.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn sender(&self, project_id: &str) -> broadcast::Sender<SnapshotChange> {
        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(64)
    }
}
