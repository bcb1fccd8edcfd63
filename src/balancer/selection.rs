//! Selection Math
//!
//! Pure scoring functions behind the load balancing algorithms. Kept free of shared state so
//! they can be tested deterministically with a seeded RNG.

use super::types::BalancerNodeState;
use crate::registry::types::{Node, NodeId};
use crate::tasks::types::TaskRequirements;

use rand::Rng;

/// Rebalancing starts once the utilization spread exceeds this.
pub const IMBALANCE_THRESHOLD: f64 = 0.3;
/// Distance from the average utilization that marks a node over/under loaded.
pub const LOAD_BAND: f64 = 0.2;
/// Candidates kept by adaptive selection before the weighted draw.
pub const ADAPTIVE_TOP_K: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("no candidates to select from")]
    Empty,

    #[error("weights are not usable (total {0})")]
    InvalidWeights(f64),
}

/// Weighted round robin weight.
///
/// `100 + (1 − utilization)×50 + max(0, (5000 − avg_rt)/100)`, scaled down for unhealthy
/// nodes and for failure streaks, floored at 1.
pub fn compute_weight(
    utilization: f64,
    avg_response_time_ms: f64,
    healthy: bool,
    consecutive_failures: u32,
) -> f64 {
    let mut weight = 100.0
        + (1.0 - utilization) * 50.0
        + ((5000.0 - avg_response_time_ms) / 100.0).max(0.0);

    if !healthy {
        weight *= 0.1;
    }
    weight *= (1.0 - consecutive_failures as f64 * 0.2).max(0.1);

    weight.max(1.0)
}

/// Up to 70 points: workload match (40), enough VRAM (20), enough CPU (10).
pub fn compatibility_score(task: &TaskRequirements, node: &Node) -> f64 {
    let mut score = 0.0;

    let workload_ok = task
        .workload_type
        .as_deref()
        .is_none_or(|workload| node.capabilities.supports(workload));
    if workload_ok {
        score += 40.0;
    }
    if node.hardware_info.available_vram_gb >= task.min_vram_gb {
        score += 20.0;
    }
    if node.hardware_info.available_cpu_cores >= task.min_cpu_cores {
        score += 10.0;
    }

    score
}

/// Up to 20 points for fast nodes, zero at 5 seconds or slower.
pub fn response_time_factor(avg_response_time_ms: f64) -> f64 {
    ((5000.0 - avg_response_time_ms) / 250.0).clamp(0.0, 20.0)
}

pub fn adaptive_score(task: &TaskRequirements, node: &Node, state: &BalancerNodeState) -> f64 {
    let load_ratio = state.current_load as f64 / state.max_load.max(1) as f64;

    let mut score = compatibility_score(task, node)
        + (1.0 - load_ratio) * 30.0
        + response_time_factor(state.avg_response_time());

    if !state.healthy {
        score *= 0.5;
    }
    score *= (1.0 - state.consecutive_failures as f64 * 0.15).max(0.3);

    score
}

/// Roulette-wheel draw: index `i` is picked with probability `weights[i] / Σweights`.
pub fn roulette<R: Rng>(weights: &[f64], rng: &mut R) -> Result<usize, SelectionError> {
    if weights.is_empty() {
        return Err(SelectionError::Empty);
    }

    let total: f64 = weights.iter().sum();
    if !total.is_finite() || total <= 0.0 || weights.iter().any(|w| *w < 0.0) {
        return Err(SelectionError::InvalidWeights(total));
    }

    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if draw < cumulative {
            return Ok(index);
        }
    }

    Ok(weights.len() - 1)
}

/// Indices of the `k` highest scores, best first. Ties keep candidate order.
pub fn top_k(scores: &[f64], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));
    order.truncate(k);
    order
}

/// Which nodes should shed load and which can take it.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalancePlan {
    pub imbalance: f64,
    pub overloaded: Vec<NodeId>,
    /// Least loaded first.
    pub underloaded: Vec<NodeId>,
}

/// Returns a plan when the spread between the most and least utilized node exceeds
/// [`IMBALANCE_THRESHOLD`].
pub fn plan_rebalance(utilizations: &[(NodeId, f64)]) -> Option<RebalancePlan> {
    if utilizations.len() < 2 {
        return None;
    }

    let count = utilizations.len() as f64;
    let average = utilizations.iter().map(|(_, u)| u).sum::<f64>() / count;
    let max = utilizations.iter().map(|(_, u)| *u).fold(f64::MIN, f64::max);
    let min = utilizations.iter().map(|(_, u)| *u).fold(f64::MAX, f64::min);
    let imbalance = max - min;

    if imbalance <= IMBALANCE_THRESHOLD {
        return None;
    }

    let mut overloaded: Vec<&(NodeId, f64)> = utilizations
        .iter()
        .filter(|(_, u)| *u > average + LOAD_BAND)
        .collect();
    overloaded.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut underloaded: Vec<&(NodeId, f64)> = utilizations
        .iter()
        .filter(|(_, u)| *u < average - LOAD_BAND)
        .collect();
    underloaded.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    Some(RebalancePlan {
        imbalance,
        overloaded: overloaded.into_iter().map(|(id, _)| id.clone()).collect(),
        underloaded: underloaded.into_iter().map(|(id, _)| id.clone()).collect(),
    })
}
