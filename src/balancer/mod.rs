//! Load Balancer
//!
//! Routes work to nodes. Four selection algorithms are available (`round_robin`,
//! `least_connections`, `weighted_round_robin`, `adaptive`), switchable at runtime. The
//! balancer keeps its own per-node health and load view, probes nodes on its own schedule
//! and periodically evens out load by migrating low-priority tasks.

pub mod selection;
pub mod service;
pub mod types;
