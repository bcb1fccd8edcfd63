//! Node Health Probes
//!
//! The load balancer's health checks and the fault manager's recovery attempts both ask
//! the same question: is this node answering right now? `Probe` is that abstraction.
//! Every call goes through [`probe_with_timeout`] so a hung node cannot leak a probe.

use crate::clock::now_ms;
use crate::registry::types::Node;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Result of a single health probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub latency_ms: u64,
    pub checked_at: u64,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            checked_at: now_ms(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: 0,
            checked_at: now_ms(),
            error: Some(error.into()),
        }
    }
}

#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, node: &Node) -> Result<ProbeOutcome>;
}

/// Runs a probe bounded by `timeout`. Errors and timeouts become unhealthy outcomes.
pub async fn probe_with_timeout(probe: &dyn Probe, node: &Node, timeout: Duration) -> ProbeOutcome {
    match tokio::time::timeout(timeout, probe.probe(node)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::debug!("Probe of {} failed: {}", node.id, e);
            ProbeOutcome::failed(e.to_string())
        }
        Err(_) => {
            tracing::debug!("Probe of {} timed out after {:?}", node.id, timeout);
            ProbeOutcome::failed(format!("probe timed out after {} ms", timeout.as_millis()))
        }
    }
}

/// Probes a node by issuing `GET {endpoint}{path}` against its advertised endpoint.
pub struct HttpProbe {
    http_client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self::with_path("/health")
    }

    pub fn with_path(path: &str) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            path: path.to_string(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, node: &Node) -> Result<ProbeOutcome> {
        let endpoint = node
            .capabilities
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Node {} has no health endpoint", node.id))?;

        let url = format!("{}{}", endpoint.trim_end_matches('/'), self.path);
        let started = Instant::now();
        let response = self.http_client.get(url).send().await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if response.status().is_success() {
            Ok(ProbeOutcome::healthy(latency_ms))
        } else {
            Ok(ProbeOutcome {
                healthy: false,
                latency_ms,
                checked_at: now_ms(),
                error: Some(format!("health endpoint returned {}", response.status())),
            })
        }
    }
}
