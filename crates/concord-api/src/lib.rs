//! JSON REST API for Concord.
//!
//! Exposes an axum [`Router`] backed by a [`SyncCoordinator`]; every store
//! operation goes through the coordinator's storage handle. TLS and transport
//! concerns are the caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", concord_api::api_router(coordinator, capabilities))
//! ```

pub mod cluster;
pub mod error;
pub mod facts;
pub mod sync;

use std::sync::Arc;

use axum::{
  Json, Router,
  extract::State,
  routing::{get, post, put},
};
use concord_sync::{PeerTransport, SyncBackend, SyncCoordinator};

pub use error::ApiError;

/// Shared handler state.
pub struct ApiState<S, T> {
  pub sync:         SyncCoordinator<S, T>,
  /// Startup capability flags, served verbatim.
  pub capabilities: Arc<serde_json::Value>,
}

impl<S, T> Clone for ApiState<S, T> {
  fn clone(&self) -> Self {
    Self { sync: self.sync.clone(), capabilities: Arc::clone(&self.capabilities) }
  }
}

/// Build a fully-materialised API router.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S, T>(sync: SyncCoordinator<S, T>, capabilities: serde_json::Value) -> Router<()>
where
  S: SyncBackend,
  T: PeerTransport,
{
  let state = ApiState { sync, capabilities: Arc::new(capabilities) };
  Router::new()
    // Facts and votes
    .route("/facts", get(facts::list::<S, T>).post(facts::create::<S, T>))
    .route("/facts/{id}", get(facts::get_one::<S, T>))
    .route("/facts/{id}/votes", post(facts::vote::<S, T>))
    // Cluster
    .route(
      "/cluster/nodes",
      get(cluster::list::<S, T>).post(cluster::register::<S, T>),
    )
    .route("/cluster/voters", get(cluster::voters::<S, T>))
    .route("/cluster/nodes/{id}/heartbeat", post(cluster::heartbeat::<S, T>))
    .route("/cluster/nodes/{id}/role", put(cluster::set_role::<S, T>))
    .route("/cluster/leader", get(cluster::leader::<S, T>))
    // Sync
    .route("/sync/rounds", post(sync::run_round::<S, T>))
    .route("/sync/log", get(sync::log::<S, T>))
    .route("/sync/state", get(sync::current_state::<S, T>))
    .route("/sync/exchange", post(sync::exchange::<S, T>))
    .route("/capabilities", get(get_capabilities::<S, T>))
    .with_state(state)
}

/// `GET /capabilities`
async fn get_capabilities<S, T>(State(state): State<ApiState<S, T>>) -> Json<serde_json::Value>
where
  S: SyncBackend,
  T: PeerTransport,
{
  Json((*state.capabilities).clone())
}
