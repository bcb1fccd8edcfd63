//! Fault Tolerance Manager
//!
//! The failure-handling side of the coordinator. Failure signals from the heartbeat
//! monitor, the load balancer's health probe or the task layer end up here.
//!
//! ## Core Mechanisms
//! - **Failure patterns**: a one-hour sliding window per node separates isolated incidents
//!   from repeating instability.
//! - **Recovery strategies**: immediate probe, exponential backoff, or a time-bounded
//!   quarantine for repeat offenders. Automatic recovery gives up after a fixed number of
//!   attempts.
//! - **Task recovery**: running tasks of a failed node are recreated, from a checkpoint
//!   when one exists.
//! - **Replication**: groups losing a member are repaired from the remaining healthy nodes.

pub mod checkpoint;
pub mod pattern;
pub mod replication;
pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
