//! Typed errors for the registry and configuration surfaces.
//!
//! Collaborator calls (task service, probes) return `anyhow::Result`; the variants here
//! cover the cases a caller is expected to match on.

use crate::registry::types::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// A node with this id is already registered and re-registration is disabled.
    #[error("node already registered: {0}")]
    DuplicateNode(NodeId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// The registration descriptor failed validation.
    #[error("invalid node descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
