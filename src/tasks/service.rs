use super::types::{NewTask, TaskFilter, TaskId, TaskRecord};

use anyhow::Result;

/// Contract of the external task queue/scheduler.
///
/// The coordinator never owns task business data; it only lists running work on a node,
/// cancels it, and asks for replacements when recovering or migrating.
#[async_trait::async_trait]
pub trait TaskService: Send + Sync {
    async fn get_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>>;

    async fn cancel_task(&self, task_id: &TaskId) -> Result<()>;

    async fn create_task(&self, task: NewTask) -> Result<TaskRecord>;
}
