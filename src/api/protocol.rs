//! HTTP Protocol Definitions
//!
//! Request/response bodies of the coordinator's HTTP surface and the endpoint paths.
//! Read-only endpoints return the component snapshot types directly.

use crate::balancer::types::Algorithm;
use crate::registry::types::{HeartbeatPayload, Node, NodeId};

use serde::{Deserialize, Serialize};

pub const ENDPOINT_REGISTER_NODE: &str = "/api/nodes/register";
pub const ENDPOINT_HEARTBEAT: &str = "/api/nodes/heartbeat";
pub const ENDPOINT_AVAILABLE_NODES: &str = "/api/nodes/available";
pub const ENDPOINT_SELECT_NODE: &str = "/api/nodes/select";
pub const ENDPOINT_HEALTH: &str = "/api/health";
pub const ENDPOINT_FAULT_PATTERNS: &str = "/api/fault/patterns";
pub const ENDPOINT_FAULT_STATS: &str = "/api/fault/stats";
pub const ENDPOINT_FAULT_NODES: &str = "/api/fault/nodes";
pub const ENDPOINT_REPLICATION_GROUPS: &str = "/api/fault/replication";
pub const ENDPOINT_BALANCER_STATS: &str = "/api/balancer/stats";
pub const ENDPOINT_LOAD_DISTRIBUTION: &str = "/api/balancer/distribution";
pub const ENDPOINT_ALGORITHM: &str = "/api/balancer/algorithm";

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub success: bool,
    pub node: Option<Node>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
    #[serde(flatten)]
    pub payload: HeartbeatPayload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SelectNodeResponse {
    pub node: Option<Node>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetAlgorithmRequest {
    pub algorithm: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetAlgorithmResponse {
    pub algorithm: Algorithm,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateReplicationGroupRequest {
    pub group_id: String,
    pub nodes: Vec<NodeId>,
}
