//! Heartbeat Monitor
//!
//! Periodically scans the registry for silent nodes. Two independent background loops:
//! - **Heartbeat sweep**: nodes whose last heartbeat is older than `heartbeat_timeout` go
//!   `Offline` and a `HeartbeatTimeout` failure signal is raised. Already-offline nodes are
//!   skipped, so one silence episode produces exactly one signal.
//! - **Cleanup sweep**: nodes offline for longer than the stale grace period are
//!   deactivated and forgotten by the rest of the coordinator.

use super::service::NodeRegistry;
use super::types::NodeId;
use crate::clock::now_ms;
use crate::config::RegistryConfig;
use crate::fault::types::{FailureReporter, FailureSignal, FailureType};

use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct HeartbeatMonitor {
    registry: Arc<NodeRegistry>,
    reporter: Arc<dyn FailureReporter>,
    config: RegistryConfig,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        reporter: Arc<dyn FailureReporter>,
        config: RegistryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            reporter,
            config,
        })
    }

    /// Spawns the heartbeat and cleanup loops. The returned handles are owned by the caller,
    /// which aborts them on shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let heartbeat_handle = {
            let monitor = self.clone();
            tokio::spawn(async move {
                monitor.heartbeat_loop().await;
            })
        };

        let cleanup_handle = {
            let monitor = self.clone();
            tokio::spawn(async move {
                monitor.cleanup_loop().await;
            })
        };

        tracing::info!(
            "Heartbeat monitor started (sweep every {} ms, timeout {} ms)",
            self.config.heartbeat_interval_ms,
            self.config.heartbeat_timeout_ms
        );

        vec![heartbeat_handle, cleanup_handle]
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());

        loop {
            interval.tick().await;
            self.sweep_heartbeats_at(now_ms());
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval());

        loop {
            interval.tick().await;
            self.sweep_stale_at(now_ms());
        }
    }

    /// Marks timed-out nodes offline and raises one failure signal per node.
    pub fn sweep_heartbeats_at(&self, now: u64) -> Vec<NodeId> {
        let expired = self
            .registry
            .expire_heartbeats(now, self.config.heartbeat_timeout_ms);

        for node_id in &expired {
            self.reporter.report_failure(FailureSignal {
                node_id: node_id.clone(),
                failure_type: FailureType::HeartbeatTimeout,
                error: Some(format!(
                    "no heartbeat within {} ms",
                    self.config.heartbeat_timeout_ms
                )),
                timestamp: now,
            });
        }

        if !expired.is_empty() {
            tracing::info!("Heartbeat sweep: {} node(s) timed out", expired.len());
        }

        expired
    }

    /// Deactivates nodes that stayed offline beyond the grace period.
    pub fn sweep_stale_at(&self, now: u64) -> Vec<NodeId> {
        let stale = self
            .registry
            .stale_offline_nodes(now, self.config.stale_node_grace_ms);

        for node_id in &stale {
            if self.registry.deactivate_node(node_id).is_some() {
                self.reporter.forget_node(node_id);
            }
        }

        if !stale.is_empty() {
            tracing::info!("Cleanup sweep: deactivated {} stale node(s)", stale.len());
        }

        stale
    }
}
