use crate::registry::types::NodeId;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Node selection algorithm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Adaptive,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "least_connections" => Ok(Algorithm::LeastConnections),
            "weighted_round_robin" => Ok(Algorithm::WeightedRoundRobin),
            "adaptive" => Ok(Algorithm::Adaptive),
            other => Err(format!("unknown load balancing algorithm: {}", other)),
        }
    }
}

/// The balancer's own view of a node, independent of the registry status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerNodeState {
    pub node_id: NodeId,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub current_load: u32,
    pub max_load: u32,
    pub utilization_history: VecDeque<f64>,
    pub response_time_history: VecDeque<u64>,
    pub total_selections: u64,
    pub last_health_check: Option<u64>,
    /// `NodeUnhealthy` already published for the current unhealthy episode.
    #[serde(skip)]
    pub unhealthy_reported: bool,
}

impl BalancerNodeState {
    pub fn new(node_id: NodeId, current_load: u32, max_load: u32) -> Self {
        Self {
            node_id,
            healthy: true,
            consecutive_failures: 0,
            current_load,
            max_load: max_load.max(1),
            utilization_history: VecDeque::new(),
            response_time_history: VecDeque::new(),
            total_selections: 0,
            last_health_check: None,
            unhealthy_reported: false,
        }
    }

    pub fn utilization(&self) -> f64 {
        (self.current_load as f64 / self.max_load.max(1) as f64).clamp(0.0, 1.0)
    }

    /// Mean of the sampled utilization history, or the current value when empty.
    pub fn avg_utilization(&self) -> f64 {
        if self.utilization_history.is_empty() {
            return self.utilization();
        }
        self.utilization_history.iter().sum::<f64>() / self.utilization_history.len() as f64
    }

    /// Mean response time in ms. Nodes with no samples yet count as instantaneous.
    pub fn avg_response_time(&self) -> f64 {
        if self.response_time_history.is_empty() {
            return 0.0;
        }
        self.response_time_history.iter().sum::<u64>() as f64
            / self.response_time_history.len() as f64
    }

    pub fn set_load(&mut self, current_load: u32, max_load: u32, history_size: usize) {
        self.current_load = current_load;
        self.max_load = max_load.max(1);
        let utilization = self.utilization();
        push_bounded(&mut self.utilization_history, utilization, history_size);
    }

    pub fn record_response_time(&mut self, ms: u64, history_size: usize) {
        push_bounded(&mut self.response_time_history, ms, history_size);
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T, limit: usize) {
    while history.len() >= limit.max(1) {
        history.pop_front();
    }
    history.push_back(value);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BalancerStats {
    pub algorithm: Algorithm,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub total_selections: u64,
    pub total_migrations: u64,
    pub rebalance_runs: u64,
    pub average_utilization: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeLoad {
    pub node_id: NodeId,
    pub current_load: u32,
    pub max_load: u32,
    pub utilization: f64,
    pub avg_response_time_ms: f64,
    pub healthy: bool,
    /// Utilization is above the configured load threshold.
    pub overloaded: bool,
    pub selections: u64,
}

/// Outcome of a rebalancing pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RebalanceReport {
    pub imbalance: f64,
    pub overloaded: Vec<NodeId>,
    pub underloaded: Vec<NodeId>,
    pub migrated: usize,
}
