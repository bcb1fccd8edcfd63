//! HTTP API
//!
//! Thin axum surface over the [`GridCoordinator`]: node registration and heartbeats from
//! worker nodes, node selection, and read-only health/stats endpoints for operators.

pub mod handlers;
pub mod protocol;


use crate::coordinator::service::GridCoordinator;
use handlers::*;
use protocol::*;

use axum::{
    Extension, Router,
    routing::{get, post},
};
use std::sync::Arc;

pub fn router(coordinator: Arc<GridCoordinator>) -> Router {
    Router::new()
        .route(ENDPOINT_REGISTER_NODE, post(handle_register_node))
        .route(ENDPOINT_HEARTBEAT, post(handle_heartbeat))
        .route(ENDPOINT_AVAILABLE_NODES, get(handle_available_nodes))
        .route(ENDPOINT_SELECT_NODE, post(handle_select_node))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(ENDPOINT_FAULT_PATTERNS, get(handle_failure_patterns))
        .route(ENDPOINT_FAULT_STATS, get(handle_fault_stats))
        .route(ENDPOINT_FAULT_NODES, get(handle_node_states))
        .route(
            ENDPOINT_REPLICATION_GROUPS,
            get(handle_replication_groups).post(handle_create_replication_group),
        )
        .route(ENDPOINT_BALANCER_STATS, get(handle_balancer_stats))
        .route(ENDPOINT_LOAD_DISTRIBUTION, get(handle_load_distribution))
        .route(ENDPOINT_ALGORITHM, post(handle_set_algorithm))
        .layer(Extension(coordinator))
}
