use super::types::*;
use crate::clock::now_ms;
use crate::config::RegistryConfig;
use crate::error::GridError;

use dashmap::DashMap;
use std::sync::Arc;

/// Canonical set of known nodes.
///
/// Reads return cloned snapshots so callers never iterate the live map while other
/// components mutate it.
pub struct NodeRegistry {
    nodes: Arc<DashMap<NodeId, Node>>,
    config: RegistryConfig,
}

impl NodeRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            nodes: Arc::new(DashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn register_node(&self, descriptor: NodeDescriptor) -> Result<Node, GridError> {
        self.register_node_at(descriptor, now_ms())
    }

    /// Validates and stores a node record, initially `Online` with a fresh heartbeat.
    pub fn register_node_at(&self, descriptor: NodeDescriptor, now: u64) -> Result<Node, GridError> {
        Self::validate(&descriptor)?;

        let id = descriptor.id.unwrap_or_default();

        if !self.config.allow_reregistration && self.nodes.contains_key(&id) {
            tracing::warn!("Rejected duplicate registration for node {}", id);
            return Err(GridError::DuplicateNode(id));
        }

        let hardware_info = descriptor.hardware_info.unwrap_or_else(|| HardwareInfo {
            available_vram_gb: descriptor.capabilities.max_vram_gb,
            available_cpu_cores: descriptor.capabilities.cpu_cores,
            current_tasks: 0,
        });

        let node = Node {
            id: id.clone(),
            capabilities: descriptor.capabilities,
            hardware_info,
            status: NodeStatus::Online,
            reputation_score: descriptor.reputation_score.unwrap_or(1.0),
            version: descriptor.version,
            registered_at: now,
            last_seen: now,
            last_heartbeat: now,
            offline_since: None,
            current_task: None,
            tasks_completed: 0,
            uptime_secs: 0,
        };

        if self.nodes.insert(id.clone(), node.clone()).is_some() {
            tracing::info!("Node {} re-registered", id);
        } else {
            tracing::info!(
                "Registered node {} ({} cores, {:.1} GB VRAM, workloads: {:?})",
                id,
                node.capabilities.cpu_cores,
                node.capabilities.max_vram_gb,
                node.capabilities.workload_types
            );
        }

        Ok(node)
    }

    fn validate(descriptor: &NodeDescriptor) -> Result<(), GridError> {
        if let Some(id) = &descriptor.id
            && id.0.trim().is_empty()
        {
            return Err(GridError::InvalidDescriptor("node id must not be empty".into()));
        }

        let caps = &descriptor.capabilities;
        if caps.max_concurrent_tasks == 0 {
            return Err(GridError::InvalidDescriptor(
                "max_concurrent_tasks must be positive".into(),
            ));
        }
        if !caps.max_vram_gb.is_finite() || caps.max_vram_gb < 0.0 {
            return Err(GridError::InvalidDescriptor(format!(
                "max_vram_gb must be a non-negative number, got {}",
                caps.max_vram_gb
            )));
        }
        if let Some(score) = descriptor.reputation_score
            && !(score.is_finite() && score >= 0.0)
        {
            return Err(GridError::InvalidDescriptor(format!(
                "reputation_score must be a non-negative number, got {}",
                score
            )));
        }

        Ok(())
    }

    pub fn process_heartbeat(&self, node_id: &NodeId, payload: HeartbeatPayload) -> bool {
        self.process_heartbeat_at(node_id, payload, now_ms())
    }

    /// Applies a heartbeat. Unknown senders are expected transient noise: they are logged
    /// and rejected with `false`, never treated as an error.
    pub fn process_heartbeat_at(&self, node_id: &NodeId, payload: HeartbeatPayload, now: u64) -> bool {
        let Some(mut node) = self.nodes.get_mut(node_id) else {
            tracing::warn!("Heartbeat from unknown node {}", node_id);
            return false;
        };

        if let Some(vram) = payload.available_vram_gb {
            node.hardware_info.available_vram_gb = vram;
        }
        if let Some(cores) = payload.available_cpu_cores {
            node.hardware_info.available_cpu_cores = cores;
        }
        if let Some(current) = payload.current_tasks {
            node.hardware_info.current_tasks = current;
        }
        if let Some(completed) = payload.tasks_completed {
            node.tasks_completed = completed;
        }
        if let Some(uptime) = payload.uptime_secs {
            node.uptime_secs = uptime;
        }
        node.current_task = payload.current_task;

        let at_capacity =
            node.hardware_info.current_tasks >= node.capabilities.max_concurrent_tasks;
        let status = if payload.status == ReportedStatus::Busy || at_capacity {
            NodeStatus::Busy
        } else {
            NodeStatus::Online
        };

        if node.status == NodeStatus::Offline {
            tracing::info!("Node {} is back online after heartbeat", node_id);
        }

        node.status = status;
        node.offline_since = None;
        node.last_seen = now;
        node.last_heartbeat = now;

        tracing::trace!(
            "Heartbeat from {}: {:?}, {} tasks",
            node_id,
            status,
            node.hardware_info.current_tasks
        );

        true
    }

    pub fn get_available_nodes(&self, requirements: &NodeRequirements) -> Vec<Node> {
        self.get_available_nodes_at(requirements, now_ms())
    }

    /// Nodes that are not offline, heard from within `node_timeout`, and satisfy the
    /// requirements. A stale node is unavailable even when its stored status is online.
    pub fn get_available_nodes_at(&self, requirements: &NodeRequirements, now: u64) -> Vec<Node> {
        let timeout = self.config.node_timeout_ms;
        self.nodes
            .iter()
            .filter(|entry| {
                let node = entry.value();
                !node.is_offline() && node.is_fresh(now, timeout) && node.satisfies(requirements)
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_node(&self, node_id: &NodeId) -> Option<Node> {
        self.nodes.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn get_all_nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Nodes whose status is not `Offline`.
    pub fn get_active_nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|entry| !entry.value().is_offline())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn update_node_status(&self, node_id: &NodeId, status: NodeStatus) -> Result<(), GridError> {
        self.update_node_status_at(node_id, status, now_ms())
    }

    /// Sets a node's status. Bringing an offline node back refreshes its heartbeat so the
    /// next sweep gives it a full timeout window before declaring it dead again.
    pub fn update_node_status_at(
        &self,
        node_id: &NodeId,
        status: NodeStatus,
        now: u64,
    ) -> Result<(), GridError> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| GridError::NodeNotFound(node_id.clone()))?;

        let previous = node.status;
        if previous == status {
            return Ok(());
        }

        match status {
            NodeStatus::Offline => {
                node.offline_since = Some(now);
            }
            NodeStatus::Online | NodeStatus::Busy => {
                node.offline_since = None;
                if previous == NodeStatus::Offline {
                    node.last_heartbeat = now;
                    node.last_seen = now;
                }
            }
        }
        node.status = status;

        tracing::debug!("Node {} status {:?} -> {:?}", node_id, previous, status);
        Ok(())
    }

    /// Transitions every live node whose heartbeat is older than `timeout_ms` to `Offline`
    /// and returns their ids. Nodes already offline are left untouched, so a single silence
    /// episode is reported exactly once.
    pub(crate) fn expire_heartbeats(&self, now: u64, timeout_ms: u64) -> Vec<NodeId> {
        let mut expired = Vec::new();

        for mut entry in self.nodes.iter_mut() {
            let node = entry.value_mut();
            if node.is_offline() {
                continue;
            }

            let silence = now.saturating_sub(node.last_heartbeat);
            if silence > timeout_ms {
                tracing::warn!(
                    "Node {} missed heartbeats for {} ms, marking offline",
                    node.id,
                    silence
                );
                node.status = NodeStatus::Offline;
                node.offline_since = Some(now);
                expired.push(node.id.clone());
            }
        }

        expired
    }

    /// Offline nodes that have been offline for longer than `grace_ms`.
    pub(crate) fn stale_offline_nodes(&self, now: u64, grace_ms: u64) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|entry| {
                let node = entry.value();
                node.is_offline()
                    && node
                        .offline_since
                        .is_some_and(|since| now.saturating_sub(since) > grace_ms)
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Removes a node from the active set. This is the only point where a node's
    /// lifecycle terminates.
    pub fn deactivate_node(&self, node_id: &NodeId) -> Option<Node> {
        let removed = self.nodes.remove(node_id).map(|(_, node)| node);
        if removed.is_some() {
            tracing::info!("Deactivated node {}", node_id);
        }
        removed
    }
}
