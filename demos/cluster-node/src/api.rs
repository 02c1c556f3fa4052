//! Debug HTTP routes served next to `/rpc`.

use std::sync::Arc;

use arena_cluster::node::ClusterNode;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;

/// Shared application state.
pub struct AppState {
    pub node: Arc<ClusterNode>,
    /// Registry the node's metrics were registered with.
    pub metrics: prometheus::Registry,
}

/// Health check response.
#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub state: String,
}

/// One entry of `/members`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    pub uuid: String,
    pub service_id: String,
    pub address: String,
    pub is_self: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct MembersResponse {
    pub generation: u64,
    pub members: Vec<MemberView>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/members", get(members))
        .route("/members/:service_id", get(members_by_id))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        state: format!("{:?}", state.node.registry().state()),
    })
}

async fn members(State(state): State<Arc<AppState>>) -> Json<MembersResponse> {
    let snapshot = state.node.registry().get_nodes();
    Json(MembersResponse {
        generation: snapshot.generation,
        members: snapshot.members.iter().map(view).collect(),
    })
}

async fn members_by_id(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(service_id): axum::extract::Path<String>,
) -> Json<Vec<MemberView>> {
    let members = state.node.registry().get_nodes_by_id(&service_id);
    Json(members.iter().map(view).collect())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&state.metrics.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn view(member: &arena_cluster::types::Member) -> MemberView {
    MemberView {
        uuid: member.data.uuid.clone(),
        service_id: member.data.service_id.clone(),
        address: member.data.address().to_string(),
        is_self: member.is_self,
    }
}
