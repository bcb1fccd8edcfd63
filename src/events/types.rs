use crate::fault::types::FailureType;
use crate::registry::types::NodeId;
use crate::tasks::types::TaskId;

use serde::{Deserialize, Serialize};

/// Subscription key for [`GridEvent`]s.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    NodeFailure,
    NodeRecovered,
    NodeQuarantined,
    NodeRecoveryFailed,
    TaskFailure,
    NodeUnhealthy,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::NodeFailure,
        EventKind::NodeRecovered,
        EventKind::NodeQuarantined,
        EventKind::NodeRecoveryFailed,
        EventKind::TaskFailure,
        EventKind::NodeUnhealthy,
    ];
}

/// Everything operators can observe about failure handling is delivered through these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GridEvent {
    /// A failure signal was processed for a node.
    NodeFailure {
        node_id: NodeId,
        failure_type: FailureType,
        error: Option<String>,
        failure_count: u32,
        timestamp: u64,
    },

    NodeRecovered {
        node_id: NodeId,
        recovery_attempts: u32,
        timestamp: u64,
    },

    /// The node shows a repeating failure pattern and is isolated until `quarantine_until`.
    NodeQuarantined {
        node_id: NodeId,
        quarantine_until: u64,
        dominant_failure_type: Option<FailureType>,
        timestamp: u64,
    },

    /// Automatic recovery is exhausted; the node needs external intervention.
    NodeRecoveryFailed {
        node_id: NodeId,
        recovery_attempts: u32,
        timestamp: u64,
    },

    TaskFailure {
        task_id: TaskId,
        node_id: Option<NodeId>,
        error: String,
        retry_count: u32,
        timestamp: u64,
    },

    /// The load balancer's health probe failed repeatedly for this node.
    NodeUnhealthy {
        node_id: NodeId,
        consecutive_failures: u32,
        timestamp: u64,
    },
}

impl GridEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            GridEvent::NodeFailure { .. } => EventKind::NodeFailure,
            GridEvent::NodeRecovered { .. } => EventKind::NodeRecovered,
            GridEvent::NodeQuarantined { .. } => EventKind::NodeQuarantined,
            GridEvent::NodeRecoveryFailed { .. } => EventKind::NodeRecoveryFailed,
            GridEvent::TaskFailure { .. } => EventKind::TaskFailure,
            GridEvent::NodeUnhealthy { .. } => EventKind::NodeUnhealthy,
        }
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            GridEvent::NodeFailure { node_id, .. }
            | GridEvent::NodeRecovered { node_id, .. }
            | GridEvent::NodeQuarantined { node_id, .. }
            | GridEvent::NodeRecoveryFailed { node_id, .. }
            | GridEvent::NodeUnhealthy { node_id, .. } => Some(node_id),
            GridEvent::TaskFailure { node_id, .. } => node_id.as_ref(),
        }
    }
}
