use crate::tasks::types::{TaskId, TaskRequirements};

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Coarse availability of a node as seen by the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Busy,
    Offline,
}

/// Static capability description a node announces when it registers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeCapabilities {
    pub max_vram_gb: f64,
    pub cpu_cores: u32,
    /// Workload types the node accepts (e.g. "text-generation", "training").
    pub workload_types: Vec<String>,
    /// Base URL of the node's health endpoint.
    pub endpoint: Option<String>,
    pub protocol_version: String,
    pub region: Option<String>,
    /// Number of tasks the node runs concurrently at full load.
    pub max_concurrent_tasks: u32,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            max_vram_gb: 0.0,
            cpu_cores: 1,
            workload_types: Vec::new(),
            endpoint: None,
            protocol_version: "1.0".to_string(),
            region: None,
            max_concurrent_tasks: 4,
        }
    }
}

impl NodeCapabilities {
    pub fn supports(&self, workload_type: &str) -> bool {
        self.workload_types
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(workload_type))
    }
}

/// Resource availability reported by heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HardwareInfo {
    pub available_vram_gb: f64,
    pub available_cpu_cores: u32,
    pub current_tasks: u32,
}

/// A worker unit in the compute grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub capabilities: NodeCapabilities,
    pub hardware_info: HardwareInfo,
    pub status: NodeStatus,
    pub reputation_score: f64,
    pub version: Option<String>,
    pub registered_at: u64,
    /// Last time anything was heard from the node (ms).
    pub last_seen: u64,
    /// Last heartbeat (ms). Drives the heartbeat-timeout sweep.
    pub last_heartbeat: u64,
    /// Set when the node transitions to `Offline`, cleared when it comes back.
    pub offline_since: Option<u64>,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub uptime_secs: u64,
}

impl Node {
    /// Fraction of the node's task slots in use, clamped to `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        let max = self.capabilities.max_concurrent_tasks.max(1) as f64;
        (self.hardware_info.current_tasks as f64 / max).clamp(0.0, 1.0)
    }

    pub fn is_fresh(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) <= timeout_ms
    }

    pub fn is_offline(&self) -> bool {
        self.status == NodeStatus::Offline
    }

    /// Checks static and reported resources against a requirement set.
    pub fn satisfies(&self, requirements: &NodeRequirements) -> bool {
        if self.hardware_info.available_vram_gb < requirements.min_vram_gb {
            return false;
        }
        if self.hardware_info.available_cpu_cores < requirements.min_cpu_cores {
            return false;
        }
        if let Some(workload) = &requirements.workload_type
            && !self.capabilities.supports(workload)
        {
            return false;
        }
        if let Some(region) = &requirements.region
            && self.capabilities.region.as_deref() != Some(region.as_str())
        {
            return false;
        }
        true
    }
}

/// Registration payload sent by a node joining the grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDescriptor {
    /// A fresh id is generated when absent.
    pub id: Option<NodeId>,
    pub capabilities: NodeCapabilities,
    /// Initial availability; defaults to the full advertised capacity.
    pub hardware_info: Option<HardwareInfo>,
    pub version: Option<String>,
    pub reputation_score: Option<f64>,
}

/// Load state a node declares in its heartbeat.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    #[default]
    Active,
    Idle,
    Busy,
}

/// Periodic liveness/status report. Absent fields leave the stored value unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatPayload {
    pub status: ReportedStatus,
    pub available_vram_gb: Option<f64>,
    pub available_cpu_cores: Option<u32>,
    pub current_tasks: Option<u32>,
    pub current_task: Option<TaskId>,
    pub tasks_completed: Option<u64>,
    pub uptime_secs: Option<u64>,
}

/// Filter for availability queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeRequirements {
    pub min_vram_gb: f64,
    pub min_cpu_cores: u32,
    pub workload_type: Option<String>,
    pub region: Option<String>,
}

impl From<&TaskRequirements> for NodeRequirements {
    fn from(requirements: &TaskRequirements) -> Self {
        Self {
            min_vram_gb: requirements.min_vram_gb,
            min_cpu_cores: requirements.min_cpu_cores,
            workload_type: requirements.workload_type.clone(),
            region: requirements.region.clone(),
        }
    }
}
