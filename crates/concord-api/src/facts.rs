//! Handlers for `/facts` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/facts` | optional `fact_type`, `limit` |
//! | `GET`  | `/facts/{id}` | fact plus its current votes |
//! | `POST` | `/facts` | Body: [`NewFact`]; returns 201 + stored fact |
//! | `POST` | `/facts/{id}/votes` | Body: [`VoteBody`]; returns the new score |
//!
//! Writes go through the coordinator so they stamp this node's clock.

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use concord_core::{
  consensus::ConsensusVote,
  fact::{Confidence, Fact, NewFact},
};
use concord_sync::{PeerTransport, SyncBackend};
use serde::{Deserialize, Serialize};

use crate::{ApiState, error::ApiError};

const DEFAULT_LIMIT: usize = 100;

// ─── List ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub fact_type: Option<String>,
  pub limit:     Option<usize>,
}

/// `GET /facts[?fact_type=...][&limit=...]`
pub async fn list<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<Fact>>, ApiError> {
  let facts = state
    .sync
    .store()
    .list_facts(params.fact_type.as_deref(), params.limit.unwrap_or(DEFAULT_LIMIT))
    .await?;
  Ok(Json(facts))
}

// ─── Get one ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct FactWithVotes {
  #[serde(flatten)]
  pub fact:  Fact,
  pub votes: Vec<ConsensusVote>,
}

/// `GET /facts/{id}`
pub async fn get_one<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Path(id): Path<i64>,
) -> Result<Json<FactWithVotes>, ApiError> {
  let store = state.sync.store();
  let fact = store
    .get_fact(id)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("fact {id} not found")))?;
  let votes = store.votes_for(id).await?;
  Ok(Json(FactWithVotes { fact, votes }))
}

// ─── Create ───────────────────────────────────────────────────────────────────

/// `POST /facts`: returns 201 and the stored [`Fact`].
pub async fn create<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Json(body): Json<NewFact>,
) -> Result<impl IntoResponse, ApiError> {
  let fact = state.sync.record_local_fact(body).await?;
  Ok((StatusCode::CREATED, Json(fact)))
}

// ─── Vote ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VoteBody {
  pub agent: String,
  /// -1, 0 (retract) or 1.
  pub value: i64,
}

#[derive(Debug, Serialize)]
pub struct VoteResult {
  pub fact_id:         i64,
  pub agent:           String,
  pub consensus_score: f64,
  pub confidence:      Confidence,
}

/// `POST /facts/{id}/votes`, body `{"agent":"...","value":1}`.
pub async fn vote<S: SyncBackend, T: PeerTransport>(
  State(state): State<ApiState<S, T>>,
  Path(id): Path<i64>,
  Json(body): Json<VoteBody>,
) -> Result<Json<VoteResult>, ApiError> {
  if body.agent.trim().is_empty() {
    return Err(ApiError::BadRequest("agent must not be empty".into()));
  }
  let score = state.sync.cast_local_vote(id, &body.agent, body.value).await?;
  let confidence = state
    .sync
    .store()
    .get_fact(id)
    .await?
    .map(|f| f.confidence)
    .unwrap_or_default();
  Ok(Json(VoteResult {
    fact_id: id,
    agent: body.agent,
    consensus_score: score,
    confidence,
  }))
}
