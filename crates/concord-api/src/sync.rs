//! Handlers for `/sync` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/sync/rounds` | run a round; `?detach=true` returns 202 immediately |
//! | `GET`  | `/sync/log` | recent audit entries, newest first |
//! | `GET`  | `/sync/state` | coordinator state |
//! | `POST` | `/sync/exchange` | peer-to-peer exchange |

use axum::{
  Json,
  extract::{Query, State},
  http::StatusCode,
  response::{IntoResponse, Response},
};
use concord_core::audit::SyncLogEntry;
use concord_sync::{
  CancellationToken, ExchangeRequest, PeerTransport, SyncBackend, SyncPayload, SyncState,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::{ApiState, error::ApiError};

#[derive(Debug, Deserialize, Default)]
pub struct RoundParams {
  /// Audit label for the round; defaults to this node.
  pub initiator: Option<String>,
  #[serde(default)]
  pub detach:    bool,
}

/// `POST /sync/rounds[?detach=true][&initiator=...]`
pub async fn run_round<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Query(params): Query<RoundParams>,
) -> Result<Response, ApiError> {
  let initiator = params
    .initiator
    .unwrap_or_else(|| state.sync.local_node_id().to_owned());

  if params.detach {
    let handle = state
      .sync
      .spawn_round(initiator.clone(), CancellationToken::new())?;
    tokio::spawn(async move {
      match handle.await {
        Ok(Ok(outcome)) => info!(status = %outcome.status, "detached sync round finished"),
        Ok(Err(e)) => error!(error = %e, "detached sync round failed"),
        Err(e) => error!(error = %e, "detached sync round panicked"),
      }
    });
    let body = json!({ "initiator": initiator, "state": "started" });
    return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
  }

  let outcome = state.sync.run_round(&initiator).await?;
  Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
  pub limit: Option<usize>,
}

/// `GET /sync/log[?limit=...]`
pub async fn log<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Query(params): Query<LogParams>,
) -> Result<Json<Vec<SyncLogEntry>>, ApiError> {
  let entries = state
    .sync
    .store()
    .recent(params.limit.unwrap_or(50))
    .await?;
  Ok(Json(entries))
}

#[derive(Debug, Serialize)]
pub struct StateView {
  pub node_id: String,
  pub state:   SyncState,
}

/// `GET /sync/state`
pub async fn current_state<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
) -> Json<StateView> {
  Json(StateView {
    node_id: state.sync.local_node_id().to_owned(),
    state:   state.sync.state(),
  })
}

/// `POST /sync/exchange`: answer with our deltas, then merge the caller's payload.
pub async fn exchange<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Json(body): Json<ExchangeRequest>,
) -> Result<Json<SyncPayload>, ApiError> {
  Ok(Json(state.sync.accept_exchange(body).await?))
}
