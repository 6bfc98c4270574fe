//! Handlers for `/cluster` endpoints.

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use concord_core::cluster::{ClusterNode, NodeRegistration, RaftRole};
use concord_sync::{PeerTransport, SyncBackend};
use serde::Deserialize;

use crate::{ApiState, error::ApiError};

/// `POST /cluster/nodes`: create or refresh a node. Returns 201.
pub async fn register<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Json(body): Json<NodeRegistration>,
) -> Result<impl IntoResponse, ApiError> {
  if body.node_id.trim().is_empty() {
    return Err(ApiError::BadRequest("node_id must not be empty".into()));
  }
  let node = state.sync.store().register_node(body).await?;
  Ok((StatusCode::CREATED, Json(node)))
}

/// `GET /cluster/nodes`
pub async fn list<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
) -> Result<Json<Vec<ClusterNode>>, ApiError> {
  Ok(Json(state.sync.store().list_nodes().await?))
}

/// `GET /cluster/voters`
pub async fn voters<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
) -> Result<Json<Vec<ClusterNode>>, ApiError> {
  Ok(Json(state.sync.store().list_voters().await?))
}

/// `POST /cluster/nodes/{id}/heartbeat`
pub async fn heartbeat<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Path(node_id): Path<String>,
) -> Result<Json<ClusterNode>, ApiError> {
  Ok(Json(state.sync.store().heartbeat(&node_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RoleBody {
  /// `null` clears the label.
  pub role: Option<RaftRole>,
}

/// `PUT /cluster/nodes/{id}/role`, body `{"role":"leader"}`.
pub async fn set_role<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Path(node_id): Path<String>,
  Json(body): Json<RoleBody>,
) -> Result<Json<ClusterNode>, ApiError> {
  Ok(Json(state.sync.store().set_role(&node_id, body.role).await?))
}

/// `GET /cluster/leader`
pub async fn leader<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
) -> Result<Json<ClusterNode>, ApiError> {
  state
    .sync
    .store()
    .leader()
    .await?
    .map(Json)
    .ok_or_else(|| ApiError::NotFound("no active leader".into()))
}
