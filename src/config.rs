//! Coordinator Configuration
//!
//! Every tunable of the registry, load balancer and fault tolerance manager lives here with
//! its default. Durations are expressed in milliseconds so the TOML file reads the same way
//! the timestamps in the rest of the system do.
//!
//! ```toml
//! [registry]
//! heartbeat_timeout_ms = 45000
//!
//! [balancer]
//! algorithm = "weighted_round_robin"
//!
//! [fault]
//! replication_factor = 3
//! ```

use crate::balancer::types::Algorithm;
use crate::error::GridError;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub registry: RegistryConfig,
    pub balancer: BalancerConfig,
    pub fault: FaultConfig,
}

impl GridConfig {
    /// Loads a configuration file, falling back to defaults for every missing key.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: GridConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GridError> {
        let r = &self.registry;
        if r.heartbeat_interval_ms == 0 || r.cleanup_interval_ms == 0 {
            return Err(GridError::Config("sweep intervals must be positive".into()));
        }
        if r.heartbeat_timeout_ms < r.heartbeat_interval_ms {
            return Err(GridError::Config(format!(
                "heartbeat_timeout_ms ({}) must not be shorter than heartbeat_interval_ms ({})",
                r.heartbeat_timeout_ms, r.heartbeat_interval_ms
            )));
        }

        let b = &self.balancer;
        if b.health_check_interval_ms == 0 || b.balancing_interval_ms == 0 {
            return Err(GridError::Config("balancer intervals must be positive".into()));
        }
        if !(0.0..=1.0).contains(&b.load_threshold) {
            return Err(GridError::Config(format!(
                "load_threshold must be within [0, 1], got {}",
                b.load_threshold
            )));
        }
        if b.history_size == 0 {
            return Err(GridError::Config("history_size must be positive".into()));
        }

        let f = &self.fault;
        if f.replication_factor == 0 {
            return Err(GridError::Config("replication_factor must be at least 1".into()));
        }
        if f.checkpoint_capacity == 0 {
            return Err(GridError::Config("checkpoint_capacity must be positive".into()));
        }
        if f.checkpoint_interval_ms == 0 || f.recovery_scan_interval_ms == 0 {
            return Err(GridError::Config("fault intervals must be positive".into()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Period of the heartbeat sweep.
    pub heartbeat_interval_ms: u64,
    /// A node silent for longer than this is marked offline and signaled as failed.
    pub heartbeat_timeout_ms: u64,
    /// Recency window used by availability queries.
    pub node_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Offline nodes older than this are deactivated by the cleanup sweep.
    pub stale_node_grace_ms: u64,
    /// Whether registering an already-known id overwrites the record.
    pub allow_reregistration: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
            node_timeout_ms: 90_000,
            cleanup_interval_ms: 60_000,
            stale_node_grace_ms: 24 * 60 * 60 * 1000,
            allow_reregistration: true,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub algorithm: Algorithm,
    pub health_check_interval_ms: u64,
    /// Utilization above which a node is reported as overloaded in the load distribution.
    pub load_threshold: f64,
    pub balancing_interval_ms: u64,
    pub enable_migration: bool,
    /// Consecutive probe failures before a node is declared unhealthy.
    pub unhealthy_threshold: u32,
    /// Number of utilization / response-time samples kept per node.
    pub history_size: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Adaptive,
            health_check_interval_ms: 30_000,
            load_threshold: 0.8,
            balancing_interval_ms: 60_000,
            enable_migration: true,
            unhealthy_threshold: 3,
            history_size: 20,
        }
    }
}

impl BalancerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn balancing_interval(&self) -> Duration {
        Duration::from_millis(self.balancing_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Failures after which recovery switches from immediate to delayed.
    pub max_failure_count: u32,
    pub checkpoint_interval_ms: u64,
    /// Running tasks younger than this are not checkpointed.
    pub checkpoint_min_task_age_ms: u64,
    pub checkpoint_capacity: usize,
    /// Upper bound of the exponential recovery backoff.
    pub recovery_timeout_ms: u64,
    pub base_retry_delay_ms: u64,
    /// Retry delay after a failed immediate recovery probe.
    pub immediate_retry_delay_ms: u64,
    pub quarantine_duration_ms: u64,
    pub max_recovery_attempts: u32,
    pub recovery_scan_interval_ms: u64,
    /// The recovery scan only retries nodes whose last failure is older than this.
    pub recovery_scan_min_age_ms: u64,
    pub replication_factor: usize,
    pub enable_replication: bool,
    /// Tasks that already reached this retry count are not restarted again.
    pub max_task_retries: u32,
    pub probe_timeout_ms: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_failure_count: 3,
            checkpoint_interval_ms: 120_000,
            checkpoint_min_task_age_ms: 60_000,
            checkpoint_capacity: 100,
            recovery_timeout_ms: 300_000,
            base_retry_delay_ms: 60_000,
            immediate_retry_delay_ms: 30_000,
            quarantine_duration_ms: 600_000,
            max_recovery_attempts: 5,
            recovery_scan_interval_ms: 30_000,
            recovery_scan_min_age_ms: 120_000,
            replication_factor: 2,
            enable_replication: true,
            max_task_retries: 3,
            probe_timeout_ms: 30_000,
        }
    }
}

impl FaultConfig {
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn recovery_scan_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_scan_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
