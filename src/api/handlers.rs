use super::protocol::*;
use crate::balancer::types::{Algorithm, BalancerStats, NodeLoad};
use crate::coordinator::service::GridCoordinator;
use crate::error::GridError;
use crate::fault::pattern::FailurePattern;
use crate::fault::replication::ReplicationGroup;
use crate::fault::types::{FaultToleranceStats, NodeHealthState, SystemHealth};
use crate::registry::types::{Node, NodeDescriptor, NodeId, NodeRequirements};
use crate::tasks::types::TaskRequirements;

use axum::{
    Json,
    extract::{Extension, Query},
    http::StatusCode,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub async fn handle_register_node(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
    Json(descriptor): Json<NodeDescriptor>,
) -> (StatusCode, Json<RegisterNodeResponse>) {
    match coordinator.register_node(descriptor).await {
        Ok(node) => (
            StatusCode::OK,
            Json(RegisterNodeResponse {
                success: true,
                node: Some(node),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!("Registration rejected: {}", e);
            let status = match e {
                GridError::DuplicateNode(_) => StatusCode::CONFLICT,
                _ => StatusCode::BAD_REQUEST,
            };
            (
                status,
                Json(RegisterNodeResponse {
                    success: false,
                    node: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub async fn handle_heartbeat(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
    Json(req): Json<HeartbeatRequest>,
) -> (StatusCode, Json<HeartbeatResponse>) {
    if coordinator.process_heartbeat(&req.node_id, req.payload) {
        (StatusCode::OK, Json(HeartbeatResponse { accepted: true }))
    } else {
        (StatusCode::NOT_FOUND, Json(HeartbeatResponse { accepted: false }))
    }
}

pub async fn handle_available_nodes(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
    Query(requirements): Query<NodeRequirements>,
) -> (StatusCode, Json<Vec<Node>>) {
    let mut nodes = coordinator.get_available_nodes(&requirements);
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    (StatusCode::OK, Json(nodes))
}

pub async fn handle_select_node(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
    Json(requirements): Json<TaskRequirements>,
) -> (StatusCode, Json<SelectNodeResponse>) {
    match coordinator.select_node(&requirements) {
        Some(node) => {
            tracing::debug!("Selected {} for {:?}", node.id, requirements.workload_type);
            (StatusCode::OK, Json(SelectNodeResponse { node: Some(node) }))
        }
        None => (StatusCode::SERVICE_UNAVAILABLE, Json(SelectNodeResponse { node: None })),
    }
}

pub async fn handle_health(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
) -> (StatusCode, Json<SystemHealth>) {
    (StatusCode::OK, Json(coordinator.get_system_health()))
}

pub async fn handle_failure_patterns(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
) -> (StatusCode, Json<BTreeMap<NodeId, FailurePattern>>) {
    (StatusCode::OK, Json(coordinator.get_failure_patterns()))
}

pub async fn handle_fault_stats(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
) -> (StatusCode, Json<FaultToleranceStats>) {
    (StatusCode::OK, Json(coordinator.get_fault_tolerance_stats().await))
}

pub async fn handle_node_states(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
) -> (StatusCode, Json<Vec<NodeHealthState>>) {
    (StatusCode::OK, Json(coordinator.get_node_states()))
}

pub async fn handle_replication_groups(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
) -> (StatusCode, Json<Vec<ReplicationGroup>>) {
    (StatusCode::OK, Json(coordinator.get_replication_groups().await))
}

pub async fn handle_create_replication_group(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
    Json(req): Json<CreateReplicationGroupRequest>,
) -> (StatusCode, Json<ReplicationGroup>) {
    let group = coordinator
        .create_replication_group(&req.group_id, req.nodes)
        .await;
    (StatusCode::OK, Json(group))
}

pub async fn handle_balancer_stats(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
) -> (StatusCode, Json<BalancerStats>) {
    (StatusCode::OK, Json(coordinator.get_balancer_stats()))
}

pub async fn handle_load_distribution(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
) -> (StatusCode, Json<Vec<NodeLoad>>) {
    (StatusCode::OK, Json(coordinator.get_load_distribution()))
}

pub async fn handle_set_algorithm(
    Extension(coordinator): Extension<Arc<GridCoordinator>>,
    Json(req): Json<SetAlgorithmRequest>,
) -> (StatusCode, Json<SetAlgorithmResponse>) {
    match req.algorithm.parse::<Algorithm>() {
        Ok(algorithm) => {
            coordinator.set_algorithm(algorithm);
            (
                StatusCode::OK,
                Json(SetAlgorithmResponse {
                    algorithm,
                    error: None,
                }),
            )
        }
        Err(e) => {
            tracing::warn!("Rejected algorithm change: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(SetAlgorithmResponse {
                    algorithm: coordinator.balancer().algorithm(),
                    error: Some(e),
                }),
            )
        }
    }
}
