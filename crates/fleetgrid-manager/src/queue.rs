//! In-memory task queue.
//!
//! Holds the head events the scheduled watcher promoted and builders have
//! not claimed yet. The persisted per-cluster event list stays the source
//! of truth; an entry here is only an offer and is re-validated against the
//! store when claimed.

use std::collections::VecDeque;
use std::sync::Mutex;

use fleetgrid_state::TaskEvent;

/// One offered task.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    pub config: String,
    pub cluster: String,
    pub event: TaskEvent,
    pub ttl: u32,
    /// Config version the offer was made at.
    pub version: u64,
}

/// FIFO deduplicated by task event id.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<QueuedTask>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `task` unless an entry with the same event id is queued.
    /// Returns whether it was added.
    pub fn enqueue(&self, task: QueuedTask) -> bool {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if queue.iter().any(|t| t.event.id == task.event.id) {
            return false;
        }
        queue.push_back(task);
        true
    }

    pub fn dequeue(&self) -> Option<QueuedTask> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| t.event.id == event_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use fleet_core::LoadBalancers;
    use fleetgrid_state::{DeleteState, EventKind, Task};

    fn task(cluster: &str) -> QueuedTask {
        QueuedTask {
            config: "infra".to_string(),
            cluster: cluster.to_string(),
            event: TaskEvent::new(
                EventKind::Delete,
                Task::Delete(DeleteState {
                    k8s: None,
                    load_balancers: LoadBalancers::default(),
                    nodepools: BTreeMap::new(),
                }),
                "test",
            ),
            ttl: 0,
            version: 1,
        }
    }

    #[test]
    fn fifo_order() {
        let queue = TaskQueue::new();
        queue.enqueue(task("a"));
        queue.enqueue(task("b"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().unwrap().cluster, "a");
        assert_eq!(queue.dequeue().unwrap().cluster, "b");
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn deduplicates_by_event_id() {
        let queue = TaskQueue::new();
        let t = task("a");
        assert!(queue.enqueue(t.clone()));
        assert!(!queue.enqueue(t.clone()));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&t.event.id));

        queue.dequeue();
        assert!(!queue.contains(&t.event.id));
        assert!(queue.enqueue(t));
    }
}
