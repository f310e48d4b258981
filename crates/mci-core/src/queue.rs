//! Per-distro task queues.
//!
//! A queue is the scheduler's prioritization output for one distro: an
//! ordered list of dispatchable task references, replaced wholesale on
//! every scheduling pass. Dequeueing does not bind a task to a host;
//! binding is a separate compare-and-swap (see the storage module).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{Requester, Task};
use crate::storage::{Storage, StorageResult};

/// One entry in a distro's dispatch queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueItem {
    /// Id of the referenced task.
    pub task_id: String,

    /// Display name, for queue inspection.
    pub display_name: String,

    /// Build variant.
    pub build_variant: String,

    /// Owning project.
    pub project: String,

    /// Source revision.
    pub revision: String,

    /// Commit order of the revision.
    pub revision_order_number: i64,

    /// Origin of the task's parent version.
    pub requester: Requester,

    /// Expected duration from historical data, attached by the scheduler.
    #[serde(default, with = "humantime_serde::option")]
    pub expected_duration: Option<Duration>,

    /// Explicit priority.
    #[serde(default)]
    pub priority: i64,
}

impl TaskQueueItem {
    /// Build a queue item from a task, attaching the expected duration.
    #[must_use]
    pub fn from_task(task: &Task, expected_duration: Option<Duration>) -> Self {
        Self {
            task_id: task.id.clone(),
            display_name: task.display_name.clone(),
            build_variant: task.build_variant.clone(),
            project: task.project.clone(),
            revision: task.revision.clone(),
            revision_order_number: task.revision_order_number,
            requester: task.requester,
            expected_duration,
            priority: task.priority,
        }
    }
}

/// A loaded snapshot of one distro's queue, with dequeue write-through.
///
/// `next` and `is_empty` operate on the snapshot; `dequeue` removes the
/// item from both the snapshot and storage, reporting whether this caller
/// won the removal (a lost race is expected under concurrent dispatchers,
/// not an error).
pub struct TaskQueue {
    distro_id: String,
    items: Vec<TaskQueueItem>,
    storage: Arc<dyn Storage>,
}

impl TaskQueue {
    /// Load the queue for a distro.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read from storage.
    pub async fn load(storage: Arc<dyn Storage>, distro_id: &str) -> StorageResult<Self> {
        let items = storage.get_task_queue(distro_id).await?;
        Ok(Self {
            distro_id: distro_id.to_string(),
            items,
            storage,
        })
    }

    /// The distro this queue belongs to.
    #[must_use]
    pub fn distro_id(&self) -> &str {
        &self.distro_id
    }

    /// The item at the head of the queue, if any.
    #[must_use]
    pub fn next(&self) -> Option<&TaskQueueItem> {
        self.items.first()
    }

    /// Returns `true` when no items remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of remaining items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Remove a task from the queue. Returns `false` when another caller
    /// already removed it from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage write fails.
    pub async fn dequeue(&mut self, task_id: &str) -> StorageResult<bool> {
        self.items.retain(|item| item.task_id != task_id);
        self.storage.dequeue_task(&self.distro_id, task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn item(id: &str) -> TaskQueueItem {
        TaskQueueItem::from_task(&Task::new(id, "proj", "linux-64"), None)
    }

    #[tokio::test]
    async fn test_dequeued_task_never_returned() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        storage
            .save_task_queue("linux-64", vec![item("t1"), item("t2")])
            .await
            .unwrap();

        let mut queue = TaskQueue::load(Arc::clone(&storage), "linux-64")
            .await
            .unwrap();
        assert_eq!(queue.next().unwrap().task_id, "t1");

        assert!(queue.dequeue("t1").await.unwrap());
        assert_eq!(queue.next().unwrap().task_id, "t2");

        assert!(queue.dequeue("t2").await.unwrap());
        assert!(queue.next().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_race_reports_loss() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        storage
            .save_task_queue("linux-64", vec![item("t1")])
            .await
            .unwrap();

        let mut first = TaskQueue::load(Arc::clone(&storage), "linux-64")
            .await
            .unwrap();
        let mut second = TaskQueue::load(Arc::clone(&storage), "linux-64")
            .await
            .unwrap();

        assert!(first.dequeue("t1").await.unwrap());
        assert!(!second.dequeue("t1").await.unwrap());
    }
}
