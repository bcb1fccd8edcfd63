//! In-Memory Task Store
//!
//! A local implementation of [`TaskService`] used when the coordinator runs standalone
//! (no external scheduler attached) and by the test suites. It keeps records in a
//! `DashMap` and applies the same state transitions a scheduler would: tasks are created
//! `Pending`, claimed into `Running` by a node, then finish as `Completed` or `Failed`.

use super::service::TaskService;
use super::types::*;
use crate::clock::now_ms;
use crate::registry::types::NodeId;

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;

pub struct InMemoryTaskStore {
    tasks: DashMap<TaskId, TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts (or replaces) a record as-is.
    pub fn insert(&self, task: TaskRecord) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    /// Marks a pending task as running on `node_id`.
    pub fn start_task(&self, task_id: &TaskId, node_id: &NodeId) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow::anyhow!("Task not found: {}", task_id))?;

        if entry.status != TaskStatus::Pending {
            return Err(anyhow::anyhow!(
                "Task {} not pending (status: {:?})",
                task_id,
                entry.status
            ));
        }

        entry.status = TaskStatus::Running;
        entry.assigned_node = Some(node_id.clone());
        entry.started_at = Some(now_ms());
        tracing::debug!("Task {} started on {}", task_id, node_id);
        Ok(())
    }

    pub fn set_progress(&self, task_id: &TaskId, progress: f64) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow::anyhow!("Task not found: {}", task_id))?;
        entry.progress = progress.clamp(0.0, 1.0);
        Ok(())
    }

    /// Marks a task as either `Completed` or `Failed`.
    pub fn complete_task(&self, task_id: &TaskId, result: Result<()>) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow::anyhow!("Task not found: {}", task_id))?;

        match result {
            Ok(_) => {
                entry.status = TaskStatus::Completed;
                entry.progress = 1.0;
                tracing::info!("Task {} completed", task_id);
            }
            Err(e) => {
                entry.status = TaskStatus::Failed;
                entry.metadata.insert("error".into(), e.to_string().into());
                tracing::warn!("Task {} failed: {}", task_id, e);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .iter()
            .filter(|entry| entry.value().status == status)
            .count()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl TaskService for InMemoryTaskStore {
    async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<()> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| anyhow::anyhow!("Task not found: {}", task_id))?;

        if matches!(entry.status, TaskStatus::Completed | TaskStatus::Cancelled) {
            return Err(anyhow::anyhow!(
                "Task {} cannot be cancelled (status: {:?})",
                task_id,
                entry.status
            ));
        }

        entry.status = TaskStatus::Cancelled;
        tracing::debug!("Task {} cancelled", task_id);
        Ok(())
    }

    async fn create_task(&self, task: NewTask) -> Result<TaskRecord> {
        let record = task.into_record();
        self.tasks.insert(record.id.clone(), record.clone());
        tracing::debug!(
            "Created task {} (priority {}, retry {})",
            record.id,
            record.priority,
            record.retry_count
        );
        Ok(record)
    }
}
