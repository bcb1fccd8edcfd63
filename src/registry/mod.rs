//! Node Registry & Heartbeat Monitor
//!
//! Owns the canonical set of worker nodes, their capability/hardware metadata and coarse
//! status (`online` / `busy` / `offline`).
//!
//! ## Core Mechanisms
//! - **Registration**: validated descriptors become `Node` records, initially online.
//! - **Heartbeats**: refresh `last_seen`, resource availability and busy/online status.
//! - **Availability queries**: filter by resources, workload type, region and recency, so a
//!   node that stopped reporting is never handed out even if its stored status is stale.
//! - **Sweeps**: the monitor turns silence into `Offline` transitions and failure signals,
//!   and eventually deactivates nodes that never came back.

pub mod monitor;
pub mod service;
pub mod types;
