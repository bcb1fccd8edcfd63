//! Load Balancer Service
//!
//! Picks a node for each unit of work and keeps the grid's load even.
//!
//! ## Responsibilities
//! - **Selection**: one of four algorithms over a candidate list. Selection never fails: any
//!   internal problem degrades to the first candidate.
//! - **Health probing**: a periodic probe of every tracked node, independent of heartbeats.
//!   A node failing the probe `unhealthy_threshold` times in a row is reported unhealthy and
//!   its running tasks are migrated away.
//! - **Rebalancing**: a periodic, debounced pass that moves low-priority work from
//!   overloaded nodes to underloaded ones.

use super::selection::*;
use super::types::*;
use crate::clock::now_ms;
use crate::config::BalancerConfig;
use crate::events::bus::EventBus;
use crate::events::types::GridEvent;
use crate::probe::{Probe, ProbeOutcome, probe_with_timeout};
use crate::registry::service::NodeRegistry;
use crate::registry::types::{Node, NodeId};
use crate::tasks::service::TaskService;
use crate::tasks::types::{NewTask, TaskFilter, TaskRecord, TaskRequirements};

use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::{JoinHandle, JoinSet};

/// Tasks above this priority are never moved by the rebalancer.
pub const MAX_MIGRATABLE_PRIORITY: u8 = 7;
/// Tasks moved off each overloaded node per rebalancing pass.
pub const MIGRATIONS_PER_NODE: usize = 2;

/// Slack for the rebalance debounce: ticks come from the interval timer while `now` is wall
/// time, so a tick may land a little short of a full interval after the previous run.
pub const REBALANCE_TOLERANCE_MS: u64 = 1_000;

pub struct LoadBalancer {
    registry: Arc<NodeRegistry>,
    tasks: Arc<dyn TaskService>,
    probe: Arc<dyn Probe>,
    events: Arc<EventBus>,
    config: BalancerConfig,

    algorithm: RwLock<Algorithm>,
    nodes: DashMap<NodeId, BalancerNodeState>,
    round_robin_index: AtomicUsize,
    last_rebalance: AtomicU64,

    total_selections: AtomicU64,
    total_migrations: AtomicU64,
    rebalance_runs: AtomicU64,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<NodeRegistry>,
        tasks: Arc<dyn TaskService>,
        probe: Arc<dyn Probe>,
        events: Arc<EventBus>,
        config: BalancerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            tasks,
            probe,
            events,
            algorithm: RwLock::new(config.algorithm),
            config,
            nodes: DashMap::new(),
            round_robin_index: AtomicUsize::new(0),
            last_rebalance: AtomicU64::new(0),
            total_selections: AtomicU64::new(0),
            total_migrations: AtomicU64::new(0),
            rebalance_runs: AtomicU64::new(0),
        })
    }

    /// Spawns the health probe and rebalancing loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let health_handle = {
            let balancer = self.clone();
            tokio::spawn(async move {
                balancer.health_check_loop().await;
            })
        };

        let rebalance_handle = {
            let balancer = self.clone();
            tokio::spawn(async move {
                balancer.rebalance_loop().await;
            })
        };

        tracing::info!(
            "Load balancer started ({}, health checks every {} ms, rebalancing every {} ms)",
            self.algorithm(),
            self.config.health_check_interval_ms,
            self.config.balancing_interval_ms
        );

        vec![health_handle, rebalance_handle]
    }

    async fn health_check_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval());
        interval.tick().await;

        loop {
            interval.tick().await;
            self.run_health_checks_at(now_ms()).await;
        }
    }

    async fn rebalance_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.balancing_interval());
        interval.tick().await;

        loop {
            interval.tick().await;
            self.rebalance_at(now_ms()).await;
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        *self.algorithm.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_algorithm(&self, algorithm: Algorithm) {
        let mut current = self.algorithm.write().unwrap_or_else(PoisonError::into_inner);
        if *current != algorithm {
            tracing::info!("Load balancing algorithm changed: {} -> {}", *current, algorithm);
            *current = algorithm;
        }
    }

    // ------------------------------------------------------------
    // Node tracking
    // ------------------------------------------------------------

    pub fn track_node(&self, node: &Node) {
        self.nodes.entry(node.id.clone()).or_insert_with(|| {
            BalancerNodeState::new(
                node.id.clone(),
                node.hardware_info.current_tasks,
                node.capabilities.max_concurrent_tasks,
            )
        });
    }

    /// Replaces any previous state of the node with a fresh, healthy one.
    pub fn reset_node(&self, node: &Node) {
        let previous = self.nodes.insert(
            node.id.clone(),
            BalancerNodeState::new(
                node.id.clone(),
                node.hardware_info.current_tasks,
                node.capabilities.max_concurrent_tasks,
            ),
        );
        if previous.is_some_and(|state| !state.healthy) {
            tracing::info!("Load balancer reset unhealthy node {}", node.id);
        }
    }

    pub fn remove_node(&self, node_id: &NodeId) -> bool {
        let removed = self.nodes.remove(node_id).is_some();
        if removed {
            tracing::debug!("Load balancer stopped tracking {}", node_id);
        }
        removed
    }

    pub fn is_tracked(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn get_node_state(&self, node_id: &NodeId) -> Option<BalancerNodeState> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn record_response_time(&self, node_id: &NodeId, response_time_ms: u64) {
        if let Some(mut state) = self.nodes.get_mut(node_id) {
            state.record_response_time(response_time_ms, self.config.history_size);
        }
    }

    /// Feeds back the outcome of a dispatched task.
    pub fn record_task_result(&self, node_id: &NodeId, success: bool, response_time_ms: u64) {
        if let Some(mut state) = self.nodes.get_mut(node_id) {
            state.record_response_time(response_time_ms, self.config.history_size);
            if success {
                state.consecutive_failures = 0;
            } else {
                state.consecutive_failures += 1;
            }
        }
    }

    pub fn update_node_load(&self, node_id: &NodeId, current_load: u32) {
        if let Some(mut state) = self.nodes.get_mut(node_id) {
            let max_load = state.max_load;
            state.set_load(current_load, max_load, self.config.history_size);
        }
    }

    /// Clears the unhealthy flag, e.g. after the fault manager recovered the node.
    pub fn mark_node_healthy(&self, node_id: &NodeId) {
        if let Some(mut state) = self.nodes.get_mut(node_id) {
            if !state.healthy {
                tracing::info!("Load balancer marks {} healthy again", node_id);
            }
            state.healthy = true;
            state.consecutive_failures = 0;
            state.unhealthy_reported = false;
        }
    }

    // ------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------

    pub fn select_node(&self, task: &TaskRequirements, candidates: &[Node]) -> Option<Node> {
        self.select_node_with_rng(task, candidates, &mut rand::thread_rng())
    }

    /// Picks a candidate using the configured algorithm. Returns `None` only when
    /// `candidates` is empty.
    pub fn select_node_with_rng<R: Rng>(
        &self,
        task: &TaskRequirements,
        candidates: &[Node],
        rng: &mut R,
    ) -> Option<Node> {
        if candidates.is_empty() {
            return None;
        }

        let states = self.refresh_candidates(candidates);
        let algorithm = self.algorithm();

        let index = match self.select_index(algorithm, task, candidates, &states, rng) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!("{} selection failed ({}), using first candidate", algorithm, e);
                0
            }
        };

        let chosen = candidates[index].clone();
        self.total_selections.fetch_add(1, Ordering::Relaxed);
        if let Some(mut state) = self.nodes.get_mut(&chosen.id) {
            state.total_selections += 1;
        }

        tracing::debug!(
            "Selected node {} via {} among {} candidate(s)",
            chosen.id,
            algorithm,
            candidates.len()
        );
        Some(chosen)
    }

    /// Samples each candidate's load into its history and returns state snapshots in
    /// candidate order.
    fn refresh_candidates(&self, candidates: &[Node]) -> Vec<BalancerNodeState> {
        candidates
            .iter()
            .map(|node| {
                let mut state = self.nodes.entry(node.id.clone()).or_insert_with(|| {
                    BalancerNodeState::new(
                        node.id.clone(),
                        node.hardware_info.current_tasks,
                        node.capabilities.max_concurrent_tasks,
                    )
                });
                state.set_load(
                    node.hardware_info.current_tasks,
                    node.capabilities.max_concurrent_tasks,
                    self.config.history_size,
                );
                state.clone()
            })
            .collect()
    }

    fn select_index<R: Rng>(
        &self,
        algorithm: Algorithm,
        task: &TaskRequirements,
        candidates: &[Node],
        states: &[BalancerNodeState],
        rng: &mut R,
    ) -> Result<usize, SelectionError> {
        match algorithm {
            Algorithm::RoundRobin => {
                let next = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
                Ok(next % candidates.len())
            }
            Algorithm::LeastConnections => states
                .iter()
                .enumerate()
                .min_by_key(|(_, state)| state.current_load)
                .map(|(index, _)| index)
                .ok_or(SelectionError::Empty),
            Algorithm::WeightedRoundRobin => {
                let weights: Vec<f64> = states
                    .iter()
                    .map(|state| {
                        compute_weight(
                            state.avg_utilization(),
                            state.avg_response_time(),
                            state.healthy,
                            state.consecutive_failures,
                        )
                    })
                    .collect();
                roulette(&weights, rng)
            }
            Algorithm::Adaptive => {
                let scores: Vec<f64> = candidates
                    .iter()
                    .zip(states)
                    .map(|(node, state)| adaptive_score(task, node, state))
                    .collect();
                let top = top_k(&scores, ADAPTIVE_TOP_K);
                let weights: Vec<f64> = top.iter().map(|&i| scores[i].max(1.0)).collect();
                roulette(&weights, rng).map(|pick| top[pick])
            }
        }
    }

    // ------------------------------------------------------------
    // Health probing
    // ------------------------------------------------------------

    /// Probes every tracked node concurrently. Returns the nodes that became unhealthy in
    /// this pass.
    pub async fn run_health_checks_at(&self, now: u64) -> Vec<NodeId> {
        let targets: Vec<Node> = self
            .nodes
            .iter()
            .filter_map(|entry| self.registry.get_node(entry.key()))
            .collect();

        let timeout = self.config.health_check_interval();
        let mut probes = JoinSet::new();
        for node in targets {
            let probe = self.probe.clone();
            probes.spawn(async move {
                let outcome = probe_with_timeout(probe.as_ref(), &node, timeout).await;
                (node.id, outcome)
            });
        }

        let mut newly_unhealthy = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((node_id, outcome)) => {
                    if self.apply_probe_outcome(&node_id, &outcome, now) {
                        newly_unhealthy.push(node_id);
                    }
                }
                Err(e) => tracing::warn!("Health probe task failed: {}", e),
            }
        }
        newly_unhealthy.sort();

        for node_id in &newly_unhealthy {
            if self.config.enable_migration {
                self.migrate_tasks_from_node(node_id, "node_unhealthy").await;
            }
        }

        newly_unhealthy
    }

    /// Updates the node's health from one probe. Returns `true` when the node crossed the
    /// unhealthy threshold in this call.
    fn apply_probe_outcome(&self, node_id: &NodeId, outcome: &ProbeOutcome, now: u64) -> bool {
        let consecutive_failures = {
            let Some(mut state) = self.nodes.get_mut(node_id) else {
                return false;
            };
            state.last_health_check = Some(now);

            if outcome.healthy {
                if !state.healthy {
                    tracing::info!("Node {} passed its health check again", node_id);
                }
                state.healthy = true;
                state.consecutive_failures = 0;
                state.unhealthy_reported = false;
                state.record_response_time(outcome.latency_ms, self.config.history_size);
                return false;
            }

            state.consecutive_failures += 1;
            tracing::debug!(
                "Health check of {} failed ({} in a row): {}",
                node_id,
                state.consecutive_failures,
                outcome.error.as_deref().unwrap_or("unknown error")
            );

            if state.consecutive_failures < self.config.unhealthy_threshold || state.unhealthy_reported {
                return false;
            }
            state.healthy = false;
            state.unhealthy_reported = true;
            state.consecutive_failures
        };

        tracing::warn!(
            "Node {} is unhealthy after {} failed health checks",
            node_id,
            consecutive_failures
        );
        self.events.publish(GridEvent::NodeUnhealthy {
            node_id: node_id.clone(),
            consecutive_failures,
            timestamp: now,
        });
        true
    }

    // ------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------

    /// Moves every running task off `node_id`. Returns the number of migrated tasks.
    pub async fn migrate_tasks_from_node(&self, node_id: &NodeId, reason: &str) -> usize {
        let running = match self.tasks.get_tasks(TaskFilter::running_on(node_id)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("Could not list tasks on {}: {}", node_id, e);
                return 0;
            }
        };

        let mut migrated = 0;
        for task in &running {
            if self.migrate_task(task, None, reason).await.is_some() {
                migrated += 1;
            }
        }

        if migrated > 0 {
            tracing::info!("Migrated {} task(s) off {} ({})", migrated, node_id, reason);
        }
        migrated
    }

    /// Cancels `task` and recreates it with priority +1 and migration metadata.
    pub async fn migrate_task(
        &self,
        task: &TaskRecord,
        target: Option<&NodeId>,
        reason: &str,
    ) -> Option<TaskRecord> {
        if let Err(e) = self.tasks.cancel_task(&task.id).await {
            tracing::warn!("Could not cancel task {} for migration: {}", task.id, e);
            return None;
        }

        let mut new_task = NewTask::derived_from(task)
            .with_priority_bump(1)
            .with_metadata("migration_reason", reason)
            .with_metadata("migrated_at", now_ms());
        if let Some(source) = &task.assigned_node {
            new_task = new_task.with_metadata("migrated_from", source.0.clone());
        }
        if let Some(target) = target {
            new_task = new_task.with_metadata("migrated_to", target.0.clone());
            new_task.assigned_node = Some(target.clone());
        }

        match self.tasks.create_task(new_task).await {
            Ok(record) => {
                self.total_migrations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Migrated task {} -> {} (target: {:?})",
                    task.id,
                    record.id,
                    target
                );
                Some(record)
            }
            Err(e) => {
                tracing::warn!("Could not recreate migrated task {}: {}", task.id, e);
                None
            }
        }
    }

    // ------------------------------------------------------------
    // Rebalancing
    // ------------------------------------------------------------

    /// Runs a rebalancing pass unless one already ran within the balancing interval.
    pub async fn rebalance_at(&self, now: u64) -> Option<RebalanceReport> {
        let last = self.last_rebalance.load(Ordering::Acquire);
        let elapsed = now.saturating_sub(last);
        if last != 0
            && elapsed.saturating_add(REBALANCE_TOLERANCE_MS) < self.config.balancing_interval_ms
        {
            tracing::trace!("Rebalance skipped, last run {} ms ago", elapsed);
            return None;
        }
        if self
            .last_rebalance
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        self.rebalance_runs.fetch_add(1, Ordering::Relaxed);
        let utilizations = self.current_utilizations();

        let Some(plan) = plan_rebalance(&utilizations) else {
            return Some(RebalanceReport::default());
        };

        tracing::info!(
            "Load imbalance {:.2}: {} overloaded, {} underloaded node(s)",
            plan.imbalance,
            plan.overloaded.len(),
            plan.underloaded.len()
        );

        let mut migrated = 0;
        if !plan.underloaded.is_empty() {
            let mut target_index = 0;
            for source in &plan.overloaded {
                for task in self.migration_candidates(source).await {
                    let target = &plan.underloaded[target_index % plan.underloaded.len()];
                    target_index += 1;
                    if self.migrate_task(&task, Some(target), "load_rebalance").await.is_some() {
                        migrated += 1;
                    }
                }
            }
        }

        Some(RebalanceReport {
            imbalance: plan.imbalance,
            overloaded: plan.overloaded,
            underloaded: plan.underloaded,
            migrated,
        })
    }

    /// Utilization of every healthy tracked node, refreshed from the registry.
    fn current_utilizations(&self) -> Vec<(NodeId, f64)> {
        let mut utilizations = Vec::new();
        for mut entry in self.nodes.iter_mut() {
            if let Some(node) = self.registry.get_node(entry.key()) {
                entry.set_load(
                    node.hardware_info.current_tasks,
                    node.capabilities.max_concurrent_tasks,
                    self.config.history_size,
                );
            }
            if entry.healthy {
                utilizations.push((entry.key().clone(), entry.utilization()));
            }
        }
        utilizations.sort_by(|a, b| a.0.cmp(&b.0));
        utilizations
    }

    /// Lowest-priority running tasks on `node_id` that may be moved.
    async fn migration_candidates(&self, node_id: &NodeId) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = match self.tasks.get_tasks(TaskFilter::running_on(node_id)).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("Could not list tasks on {}: {}", node_id, e);
                return Vec::new();
            }
        };

        tasks.retain(|task| task.priority <= MAX_MIGRATABLE_PRIORITY);
        tasks.sort_by_key(|task| task.priority);
        tasks.truncate(MIGRATIONS_PER_NODE);
        tasks
    }

    // ------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------

    pub fn get_balancer_stats(&self) -> BalancerStats {
        let (healthy_nodes, utilization_sum) = self.nodes.iter().fold((0, 0.0), |(healthy, sum), entry| {
            (healthy + entry.healthy as usize, sum + entry.utilization())
        });
        let total_nodes = self.nodes.len();

        BalancerStats {
            algorithm: self.algorithm(),
            total_nodes,
            healthy_nodes,
            total_selections: self.total_selections.load(Ordering::Relaxed),
            total_migrations: self.total_migrations.load(Ordering::Relaxed),
            rebalance_runs: self.rebalance_runs.load(Ordering::Relaxed),
            average_utilization: if total_nodes == 0 {
                0.0
            } else {
                utilization_sum / total_nodes as f64
            },
        }
    }

    pub fn get_load_distribution(&self) -> Vec<NodeLoad> {
        let mut loads: Vec<NodeLoad> = self
            .nodes
            .iter()
            .map(|entry| {
                let state = entry.value();
                NodeLoad {
                    node_id: state.node_id.clone(),
                    current_load: state.current_load,
                    max_load: state.max_load,
                    utilization: state.utilization(),
                    avg_response_time_ms: state.avg_response_time(),
                    healthy: state.healthy,
                    overloaded: state.utilization() > self.config.load_threshold,
                    selections: state.total_selections,
                }
            })
            .collect();
        loads.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        loads
    }
}
