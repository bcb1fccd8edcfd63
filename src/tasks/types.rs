use crate::clock::now_ms;
use crate::registry::types::NodeId;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Highest task priority understood by the scheduler.
pub const MAX_PRIORITY: u8 = 10;

/// Unique identifier for a task record owned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Resources a task needs from the node that runs it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskRequirements {
    pub workload_type: Option<String>,
    pub min_vram_gb: f64,
    pub min_cpu_cores: u32,
    pub region: Option<String>,
}

/// Scheduling view of a task. The coordinator reads these fields and rewrites the
/// scheduling-relevant ones when it recovers or migrates work; the payload is opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// 0 (lowest) to 10 (highest).
    pub priority: u8,
    pub status: TaskStatus,
    pub assigned_node: Option<NodeId>,
    pub payload: Value,
    pub retry_count: u32,
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub requirements: TaskRequirements,
    pub created_at: u64,
    pub started_at: Option<u64>,
    /// Fraction of work completed as last reported by the executing node.
    #[serde(default)]
    pub progress: f64,
}

impl TaskRecord {
    /// Timestamp from which the task has been running (falls back to creation time).
    pub fn running_since(&self) -> u64 {
        self.started_at.unwrap_or(self.created_at)
    }
}

/// Query filter accepted by [`TaskService::get_tasks`](super::service::TaskService::get_tasks).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub node_id: Option<NodeId>,
}

impl TaskFilter {
    pub fn running() -> Self {
        Self {
            status: Some(TaskStatus::Running),
            node_id: None,
        }
    }

    pub fn running_on(node_id: &NodeId) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            node_id: Some(node_id.clone()),
        }
    }

    pub fn matches(&self, task: &TaskRecord) -> bool {
        if let Some(status) = self.status
            && task.status != status
        {
            return false;
        }
        if let Some(node_id) = &self.node_id
            && task.assigned_node.as_ref() != Some(node_id)
        {
            return false;
        }
        true
    }
}

/// Data for a task the coordinator asks the scheduler to create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub priority: u8,
    pub payload: Value,
    pub retry_count: u32,
    pub metadata: Map<String, Value>,
    pub requirements: TaskRequirements,
    /// Placement hint; the scheduler may ignore it.
    pub assigned_node: Option<NodeId>,
}

impl NewTask {
    pub fn new(priority: u8, payload: Value) -> Self {
        Self {
            priority: priority.min(MAX_PRIORITY),
            payload,
            retry_count: 0,
            metadata: Map::new(),
            requirements: TaskRequirements::default(),
            assigned_node: None,
        }
    }

    /// Copies the scheduling data of an existing task, recording where it came from.
    pub fn derived_from(task: &TaskRecord) -> Self {
        let mut metadata = task.metadata.clone();
        metadata.insert("original_task_id".into(), Value::String(task.id.0.clone()));

        Self {
            priority: task.priority,
            payload: task.payload.clone(),
            retry_count: task.retry_count,
            metadata,
            requirements: task.requirements.clone(),
            assigned_node: None,
        }
    }

    pub fn with_priority_bump(mut self, by: u8) -> Self {
        self.priority = bump_priority(self.priority, by);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Materializes the record the way a scheduler would on creation.
    pub fn into_record(self) -> TaskRecord {
        TaskRecord {
            id: TaskId::new(),
            priority: self.priority.min(MAX_PRIORITY),
            status: TaskStatus::Pending,
            assigned_node: self.assigned_node,
            payload: self.payload,
            retry_count: self.retry_count,
            metadata: self.metadata,
            requirements: self.requirements,
            created_at: now_ms(),
            started_at: None,
            progress: 0.0,
        }
    }
}

/// Raises a priority by `by`, never exceeding [`MAX_PRIORITY`].
pub fn bump_priority(priority: u8, by: u8) -> u8 {
    priority.saturating_add(by).min(MAX_PRIORITY)
}
