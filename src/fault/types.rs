use crate::registry::types::NodeId;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of response-time samples kept per node.
pub const RESPONSE_HISTORY_LEN: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Disconnect,
    Timeout,
    ProbeError,
    HeartbeatTimeout,
    TaskError,
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureType::Disconnect => "disconnect",
            FailureType::Timeout => "timeout",
            FailureType::ProbeError => "probe_error",
            FailureType::HeartbeatTimeout => "heartbeat_timeout",
            FailureType::TaskError => "task_error",
            FailureType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub failure_type: FailureType,
    pub timestamp: u64,
    pub error: Option<String>,
}

/// A failure observed by some component (heartbeat monitor, balancer probe, task layer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureSignal {
    pub node_id: NodeId,
    pub failure_type: FailureType,
    pub error: Option<String>,
    pub timestamp: u64,
}

impl FailureSignal {
    pub fn new(node_id: NodeId, failure_type: FailureType, error: Option<String>) -> Self {
        Self {
            node_id,
            failure_type,
            error,
            timestamp: crate::clock::now_ms(),
        }
    }
}

/// Sink for failure signals. Implementations must not block the caller; signals are
/// queued and handled asynchronously.
pub trait FailureReporter: Send + Sync {
    fn report_failure(&self, signal: FailureSignal);

    /// Called when a node is permanently removed from the grid.
    fn forget_node(&self, _node_id: &NodeId) {}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Immediate,
    Delayed,
    Quarantine,
}

/// Repeating failures quarantine the node; a node that failed `max_failure_count` times or
/// more backs off; anything else is retried right away.
pub fn choose_strategy(is_repeating: bool, failure_count: u32, max_failure_count: u32) -> RecoveryStrategy {
    if is_repeating {
        RecoveryStrategy::Quarantine
    } else if failure_count >= max_failure_count {
        RecoveryStrategy::Delayed
    } else {
        RecoveryStrategy::Immediate
    }
}

/// `min(base × 2^attempt, cap)`, saturating instead of overflowing for large attempts.
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

/// Per-node view of the fault tolerance manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealthState {
    pub node_id: NodeId,
    pub consecutive_failures: u32,
    pub last_heartbeat: u64,
    pub failure_count: u32,
    pub last_failure: Option<FailureRecord>,
    pub recovery_attempts: u32,
    pub is_quarantined: bool,
    pub quarantine_until: Option<u64>,
    pub task_success_rate: f64,
    pub response_time_history: VecDeque<u64>,
    pub utilization: f64,
    /// Automatic recovery gave up; only `reset_node` brings the node back into rotation.
    pub recovery_exhausted: bool,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
}

impl NodeHealthState {
    pub fn new(node_id: NodeId, now: u64) -> Self {
        Self {
            node_id,
            consecutive_failures: 0,
            last_heartbeat: now,
            failure_count: 0,
            last_failure: None,
            recovery_attempts: 0,
            is_quarantined: false,
            quarantine_until: None,
            task_success_rate: 1.0,
            response_time_history: VecDeque::with_capacity(RESPONSE_HISTORY_LEN),
            utilization: 0.0,
            recovery_exhausted: false,
            tasks_succeeded: 0,
            tasks_failed: 0,
        }
    }

    pub fn is_quarantine_active(&self, now: u64) -> bool {
        self.is_quarantined && self.quarantine_until.is_some_and(|until| until > now)
    }

    pub fn is_failing(&self) -> bool {
        self.failure_count > 0
    }

    pub fn record_response_time(&mut self, ms: u64) {
        if self.response_time_history.len() == RESPONSE_HISTORY_LEN {
            self.response_time_history.pop_front();
        }
        self.response_time_history.push_back(ms);
    }

    pub fn record_task_result(&mut self, success: bool) {
        if success {
            self.tasks_succeeded += 1;
        } else {
            self.tasks_failed += 1;
        }
        let total = self.tasks_succeeded + self.tasks_failed;
        self.task_success_rate = self.tasks_succeeded as f64 / total as f64;
    }

    /// Back to a clean slate after a successful recovery.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
        self.failure_count = 0;
        self.recovery_attempts = 0;
        self.is_quarantined = false;
        self.quarantine_until = None;
        self.recovery_exhausted = false;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
}

impl SystemStatus {
    /// Healthy above 70% healthy nodes, degraded above 50%, critical otherwise.
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        let healthy = healthy as f64;
        let total = total as f64;
        if total > 0.0 && healthy > 0.7 * total {
            SystemStatus::Healthy
        } else if total > 0.0 && healthy > 0.5 * total {
            SystemStatus::Degraded
        } else {
            SystemStatus::Critical
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemHealth {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub quarantined_nodes: usize,
    pub health_percentage: f64,
    pub system_status: SystemStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FaultToleranceStats {
    pub node_failures: u64,
    pub task_failures: u64,
    pub tasks_recovered: u64,
    pub tasks_restored_from_checkpoint: u64,
    pub tasks_abandoned: u64,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    pub exhausted_recoveries: u64,
    pub quarantines: u64,
    pub checkpoints_created: u64,
    pub checkpoints_stored: usize,
    pub replication_repairs: u64,
    pub replication_groups: usize,
    pub under_replicated_groups: usize,
    pub tracked_nodes: usize,
    pub failing_nodes: usize,
    pub quarantined_nodes: usize,
}

/// Monotonic counters behind [`FaultToleranceStats`].
#[derive(Debug, Default)]
pub struct FaultCounters {
    pub node_failures: AtomicU64,
    pub task_failures: AtomicU64,
    pub tasks_recovered: AtomicU64,
    pub tasks_restored_from_checkpoint: AtomicU64,
    pub tasks_abandoned: AtomicU64,
    pub recovery_attempts: AtomicU64,
    pub successful_recoveries: AtomicU64,
    pub exhausted_recoveries: AtomicU64,
    pub quarantines: AtomicU64,
    pub checkpoints_created: AtomicU64,
    pub replication_repairs: AtomicU64,
}

impl FaultCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Result of one recovery retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    /// Probe failed; another attempt was scheduled.
    Rescheduled,
    /// Probe failed and the attempt budget is spent.
    Exhausted,
    /// Nothing to do: unknown node, quarantined, healthy or already exhausted.
    Skipped,
}
