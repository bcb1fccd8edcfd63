//! Compute Grid Coordinator Library
//!
//! This library crate defines the coordination layer of a distributed compute grid. It
//! serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! Three coupled components share one node-health view and one failure-propagation path
//! (node failure → task recovery → replication repair → rebalancing):
//!
//! - **`registry`**: The canonical node set. Registration, heartbeats, availability queries,
//!   and the heartbeat monitor that turns silence into failure signals.
//! - **`balancer`**: Node selection (round robin, least connections, weighted round robin,
//!   adaptive), independent health probing and periodic load rebalancing.
//! - **`fault`**: The fault tolerance manager. Failure patterns, recovery strategies
//!   (immediate, delayed, quarantine), task checkpoints and replication groups.
//!
//! Supporting modules:
//!
//! - **`coordinator`**: Builds and wires the components, owns their background loops.
//! - **`api`**: HTTP endpoints for nodes and operators.
//! - **`events`**: Publish/subscribe bus for grid events.
//! - **`tasks`**: Contract of the external task scheduler plus an in-memory implementation.
//! - **`probe`**: Node health probes.
//! - **`config`**, **`error`**, **`clock`**: Tunables, typed errors and timestamps.

pub mod api;
pub mod balancer;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fault;
pub mod probe;
pub mod registry;
pub mod tasks;
