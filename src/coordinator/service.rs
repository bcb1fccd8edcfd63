//! Grid Coordinator
//!
//! Builds the registry, heartbeat monitor, load balancer and fault tolerance manager around a
//! shared [`EventBus`] and wires the failure-propagation path between them:
//!
//! - heartbeat timeouts from the monitor and `NodeUnhealthy` from the balancer both become
//!   failure signals for the fault manager;
//! - `NodeRecovered` from the fault manager clears the balancer's unhealthy flag;
//! - nodes deactivated by the cleanup sweep are forgotten by both components.
//!
//! ## Lifecycle
//! `new` (construct) → `start` (spawn background loops) → `shutdown` (abort and await them).

use crate::balancer::service::LoadBalancer;
use crate::balancer::types::{Algorithm, BalancerStats, NodeLoad};
use crate::clock::now_ms;
use crate::config::GridConfig;
use crate::error::GridError;
use crate::events::bus::EventBus;
use crate::events::types::{EventKind, GridEvent};
use crate::fault::pattern::FailurePattern;
use crate::fault::replication::ReplicationGroup;
use crate::fault::service::FaultToleranceManager;
use crate::fault::types::{
    FailureReporter, FailureSignal, FailureType, FaultToleranceStats, NodeHealthState, SystemHealth,
};
use crate::probe::Probe;
use crate::registry::monitor::HeartbeatMonitor;
use crate::registry::service::NodeRegistry;
use crate::registry::types::{HeartbeatPayload, Node, NodeDescriptor, NodeId, NodeRequirements};
use crate::tasks::service::TaskService;
use crate::tasks::types::{TaskRecord, TaskRequirements};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// Routes monitor output to the components that keep per-node state.
struct FailureRouter {
    fault: Arc<FaultToleranceManager>,
    balancer: Arc<LoadBalancer>,
}

impl FailureReporter for FailureRouter {
    fn report_failure(&self, signal: FailureSignal) {
        self.fault.report_failure(signal);
    }

    fn forget_node(&self, node_id: &NodeId) {
        self.fault.forget(node_id);
        self.balancer.remove_node(node_id);
    }
}

pub struct GridCoordinator {
    config: GridConfig,
    events: Arc<EventBus>,
    registry: Arc<NodeRegistry>,
    monitor: Arc<HeartbeatMonitor>,
    balancer: Arc<LoadBalancer>,
    fault: Arc<FaultToleranceManager>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl GridCoordinator {
    pub fn new(config: GridConfig, tasks: Arc<dyn TaskService>, probe: Arc<dyn Probe>) -> Arc<Self> {
        let events = EventBus::new();
        let registry = NodeRegistry::new(config.registry.clone());

        let fault = FaultToleranceManager::new(
            registry.clone(),
            tasks.clone(),
            probe.clone(),
            events.clone(),
            config.fault.clone(),
        );
        let balancer = LoadBalancer::new(
            registry.clone(),
            tasks,
            probe,
            events.clone(),
            config.balancer.clone(),
        );

        let router = Arc::new(FailureRouter {
            fault: fault.clone(),
            balancer: balancer.clone(),
        });
        let monitor = HeartbeatMonitor::new(registry.clone(), router, config.registry.clone());

        Self::subscribe(&events, &fault, &balancer);

        Arc::new(Self {
            config,
            events,
            registry,
            monitor,
            balancer,
            fault,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Cross-component subscriptions. Handlers hold weak references: the components own the
    /// bus, so strong ones would keep them alive forever.
    fn subscribe(events: &EventBus, fault: &Arc<FaultToleranceManager>, balancer: &Arc<LoadBalancer>) {
        let weak_fault = Arc::downgrade(fault);
        events.subscribe(EventKind::NodeUnhealthy, move |event| {
            if let GridEvent::NodeUnhealthy {
                node_id,
                consecutive_failures,
                timestamp,
            } = event
                && let Some(fault) = weak_fault.upgrade()
            {
                let mut signal = FailureSignal::new(
                    node_id.clone(),
                    FailureType::ProbeError,
                    Some(format!("{} consecutive health checks failed", consecutive_failures)),
                );
                signal.timestamp = *timestamp;
                fault.report_failure(signal);
            }
        });

        let weak_balancer = Arc::downgrade(balancer);
        events.subscribe(EventKind::NodeRecovered, move |event| {
            if let GridEvent::NodeRecovered { node_id, .. } = event
                && let Some(balancer) = weak_balancer.upgrade()
            {
                balancer.mark_node_healthy(node_id);
            }
        });
    }

    /// Spawns every background loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() {
            tracing::warn!("Coordinator already started");
            return;
        }

        handles.extend(self.monitor.start());
        handles.extend(self.balancer.start());
        handles.extend(self.fault.start());

        tracing::info!("Grid coordinator started with {} background task(s)", handles.len());
    }

    /// Aborts the background loops, waits for them to wind down and drops pending timers.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };

        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        self.fault.shutdown();
        tracing::info!("Grid coordinator stopped");
    }

    pub fn background_task_count(&self) -> usize {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn fault(&self) -> &Arc<FaultToleranceManager> {
        &self.fault
    }

    // ------------------------------------------------------------
    // Node lifecycle
    // ------------------------------------------------------------

    /// Registers a node. A node that registers again (e.g. after a restart) starts over
    /// with clean health state in the balancer and the fault manager.
    pub async fn register_node(&self, descriptor: NodeDescriptor) -> Result<Node, GridError> {
        let node = self.registry.register_node(descriptor)?;
        self.fault.reset_node_state(&node.id, node.registered_at).await;
        self.balancer.reset_node(&node);
        Ok(node)
    }

    /// Applies a heartbeat and feeds the reported load to the balancer and fault manager.
    pub fn process_heartbeat(&self, node_id: &NodeId, payload: HeartbeatPayload) -> bool {
        let now = now_ms();
        if !self.registry.process_heartbeat_at(node_id, payload, now) {
            return false;
        }

        if let Some(node) = self.registry.get_node(node_id) {
            self.fault.record_heartbeat(node_id, node.utilization(), now);
            self.balancer.track_node(&node);
            self.balancer.update_node_load(node_id, node.hardware_info.current_tasks);
        }
        true
    }

    /// Removes a node from the registry and from every component's state.
    pub fn deactivate_node(&self, node_id: &NodeId) -> bool {
        if self.registry.deactivate_node(node_id).is_none() {
            return false;
        }
        self.fault.forget(node_id);
        self.balancer.remove_node(node_id);
        true
    }

    pub fn get_available_nodes(&self, requirements: &NodeRequirements) -> Vec<Node> {
        self.registry.get_available_nodes(requirements)
    }

    // ------------------------------------------------------------
    // Work placement
    // ------------------------------------------------------------

    /// Picks a node for a task among available, non-quarantined nodes.
    pub fn select_node(&self, task: &TaskRequirements) -> Option<Node> {
        let mut candidates: Vec<Node> = self
            .registry
            .get_available_nodes(&NodeRequirements::from(task))
            .into_iter()
            .filter(|node| !self.fault.is_quarantined(&node.id))
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        self.balancer.select_node(task, &candidates)
    }

    pub fn report_task_success(&self, node_id: &NodeId, response_time_ms: u64) {
        self.fault.record_task_success(node_id, response_time_ms);
        self.balancer.record_task_result(node_id, true, response_time_ms);
    }

    /// Recovers a failed task. Returns the replacement, if one was created.
    pub async fn report_task_failure(&self, task: &TaskRecord, error: &str) -> Option<TaskRecord> {
        self.fault.handle_task_failure(task, error).await
    }

    // ------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------

    pub fn get_system_health(&self) -> SystemHealth {
        self.fault.get_system_health()
    }

    pub fn get_failure_patterns(&self) -> BTreeMap<NodeId, FailurePattern> {
        self.fault.get_failure_patterns()
    }

    pub async fn get_fault_tolerance_stats(&self) -> FaultToleranceStats {
        self.fault.get_fault_tolerance_stats().await
    }

    /// Per-node fault state, ordered by node id.
    pub fn get_node_states(&self) -> Vec<NodeHealthState> {
        self.fault.get_node_states()
    }

    pub async fn get_replication_groups(&self) -> Vec<ReplicationGroup> {
        self.fault.get_replication_groups().await
    }

    pub async fn create_replication_group(&self, group_id: &str, nodes: Vec<NodeId>) -> ReplicationGroup {
        self.fault.create_replication_group(group_id, nodes).await
    }

    pub fn get_balancer_stats(&self) -> BalancerStats {
        self.balancer.get_balancer_stats()
    }

    pub fn get_load_distribution(&self) -> Vec<NodeLoad> {
        self.balancer.get_load_distribution()
    }

    pub fn set_algorithm(&self, algorithm: Algorithm) {
        self.balancer.set_algorithm(algorithm);
    }
}
