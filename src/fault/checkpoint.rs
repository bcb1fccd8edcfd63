//! Task Checkpoints
//!
//! Bounded in-memory store of progress snapshots for long-running tasks. One checkpoint
//! per task; a newer snapshot for the same task replaces the older one. When the store is
//! full, the checkpoint with the oldest timestamp is evicted.

use crate::registry::types::NodeId;
use crate::tasks::types::{TaskId, TaskRecord};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMetadata {
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub task_id: TaskId,
    pub timestamp: u64,
    pub progress: f64,
    /// Opaque snapshot handed back to the task on restore.
    pub state: Value,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Snapshots a running task as seen by the scheduler.
    pub fn capture(task: &TaskRecord, now: u64) -> Self {
        Self {
            task_id: task.id.clone(),
            timestamp: now,
            progress: task.progress,
            state: serde_json::json!({
                "payload": task.payload,
                "progress": task.progress,
                "retry_count": task.retry_count,
            }),
            metadata: CheckpointMetadata {
                node_id: task.assigned_node.clone(),
            },
        }
    }
}

pub struct CheckpointStore {
    checkpoints: Mutex<HashMap<TaskId, Checkpoint>>,
    capacity: usize,
}

impl CheckpointStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            checkpoints: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Stores `checkpoint`, evicting the oldest entries if the store is over capacity.
    /// Returns the number of evicted checkpoints.
    pub fn save(&self, checkpoint: Checkpoint) -> usize {
        let mut checkpoints = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        checkpoints.insert(checkpoint.task_id.clone(), checkpoint);

        let mut evicted = 0;
        while checkpoints.len() > self.capacity {
            let oldest = checkpoints
                .values()
                .min_by_key(|c| c.timestamp)
                .map(|c| c.task_id.clone());
            match oldest {
                Some(task_id) => {
                    checkpoints.remove(&task_id);
                    evicted += 1;
                }
                None => break,
            }
        }

        if evicted > 0 {
            tracing::debug!("Evicted {} checkpoint(s) over capacity {}", evicted, self.capacity);
        }
        evicted
    }

    pub fn get(&self, task_id: &TaskId) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
    }

    pub fn remove(&self, task_id: &TaskId) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)
    }

    pub fn len(&self) -> usize {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All checkpoints, oldest first.
    pub fn snapshot(&self) -> Vec<Checkpoint> {
        let mut all: Vec<Checkpoint> = self
            .checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|c| c.timestamp);
        all
    }
}
