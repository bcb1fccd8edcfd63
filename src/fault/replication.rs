//! Replication Groups
//!
//! A replication group is a set of nodes holding copies of the same task state. Each group
//! targets `replication_factor` members. Removing a node can leave a group
//! under-replicated; the fault manager then asks [`ReplicationManager::repair_group`] to
//! top it up from the eligible candidates it supplies. Running out of candidates is not an
//! error: the group stays short and is repaired again on the next membership change.

use crate::registry::types::NodeId;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationGroup {
    pub group_id: String,
    pub nodes: BTreeSet<NodeId>,
    pub created_at: u64,
    pub last_repaired: Option<u64>,
}

impl ReplicationGroup {
    pub fn is_under_replicated(&self, factor: usize) -> bool {
        self.nodes.len() < factor
    }
}

pub struct ReplicationManager {
    groups: RwLock<HashMap<String, ReplicationGroup>>,
    factor: usize,
}

impl ReplicationManager {
    pub fn new(factor: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            factor: factor.max(1),
        }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Creates (or replaces) a group with the given members.
    pub async fn create_group(&self, group_id: &str, nodes: Vec<NodeId>, now: u64) -> ReplicationGroup {
        let group = ReplicationGroup {
            group_id: group_id.to_string(),
            nodes: nodes.into_iter().collect(),
            created_at: now,
            last_repaired: None,
        };

        if group.is_under_replicated(self.factor) {
            tracing::warn!(
                "Replication group {} created with {} of {} nodes",
                group_id,
                group.nodes.len(),
                self.factor
            );
        } else {
            tracing::info!("Created replication group {} with {} nodes", group_id, group.nodes.len());
        }

        self.groups
            .write()
            .await
            .insert(group_id.to_string(), group.clone());
        group
    }

    /// Adds a node to an existing group. Returns `false` if the group does not exist or the
    /// node is already a member.
    pub async fn add_node(&self, group_id: &str, node_id: &NodeId) -> bool {
        let mut groups = self.groups.write().await;
        match groups.get_mut(group_id) {
            Some(group) => group.nodes.insert(node_id.clone()),
            None => false,
        }
    }

    /// Removes `node_id` from every group and returns the ids of groups it was in.
    pub async fn remove_node_from_groups(&self, node_id: &NodeId) -> Vec<String> {
        let mut groups = self.groups.write().await;
        let mut affected: Vec<String> = groups
            .values_mut()
            .filter_map(|group| group.nodes.remove(node_id).then(|| group.group_id.clone()))
            .collect();
        affected.sort();

        if !affected.is_empty() {
            tracing::info!("Removed node {} from {} replication group(s)", node_id, affected.len());
        }
        affected
    }

    /// Adds candidates that are not already members until the group reaches the target
    /// size. Returns the number of nodes added.
    pub async fn repair_group(&self, group_id: &str, candidates: &[NodeId], now: u64) -> usize {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get_mut(group_id) else {
            return 0;
        };

        let mut added = 0;
        for candidate in candidates {
            if !group.is_under_replicated(self.factor) {
                break;
            }
            if group.nodes.insert(candidate.clone()) {
                added += 1;
            }
        }

        if added > 0 {
            group.last_repaired = Some(now);
            tracing::info!(
                "Repaired replication group {}: added {} node(s), now {}/{}",
                group_id,
                added,
                group.nodes.len(),
                self.factor
            );
        }
        if group.is_under_replicated(self.factor) {
            tracing::warn!(
                "Replication group {} remains under-replicated ({}/{}): no eligible candidates",
                group_id,
                group.nodes.len(),
                self.factor
            );
        }

        added
    }

    /// Puts a recovered node back into every group that is short of members.
    pub async fn readd_node(&self, node_id: &NodeId, now: u64) -> Vec<String> {
        let mut groups = self.groups.write().await;
        let mut rejoined = Vec::new();

        for group in groups.values_mut() {
            if group.is_under_replicated(self.factor) && group.nodes.insert(node_id.clone()) {
                group.last_repaired = Some(now);
                rejoined.push(group.group_id.clone());
            }
        }

        rejoined.sort();
        if !rejoined.is_empty() {
            tracing::info!("Node {} rejoined replication group(s) {:?}", node_id, rejoined);
        }
        rejoined
    }

    pub async fn under_replicated_groups(&self) -> Vec<String> {
        let groups = self.groups.read().await;
        let mut short: Vec<String> = groups
            .values()
            .filter(|group| group.is_under_replicated(self.factor))
            .map(|group| group.group_id.clone())
            .collect();
        short.sort();
        short
    }

    pub async fn get_group(&self, group_id: &str) -> Option<ReplicationGroup> {
        self.groups.read().await.get(group_id).cloned()
    }

    /// All groups sorted by id.
    pub async fn snapshot(&self) -> Vec<ReplicationGroup> {
        let mut all: Vec<ReplicationGroup> = self.groups.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        all
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }
}
