//! Error types for `concord-core`.
//!
//! Every component trait in [`crate::store`] reports failures through this
//! enum, so the sync coordinator can treat backends uniformly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid vote value {0}: expected -1, 0 or 1")]
  InvalidVoteValue(i64),

  #[error("fact not found: {0}")]
  FactNotFound(i64),

  /// An incoming fact reuses a stored id for a different assertion.
  #[error("fact {0} already exists with different content")]
  FactConflict(i64),

  #[error("fact id space of node {0:?} is exhausted")]
  FactIdsExhausted(String),

  #[error("node not found: {0:?}")]
  NodeNotFound(String),

  /// A write would have lowered a stored clock version.
  #[error(
    "clock regression on {node_id}/{entity_type}/{entity_id}: stored version \
     {stored} would drop to {attempted}"
  )]
  ClockRegression {
    node_id:     String,
    entity_type: String,
    entity_id:   String,
    stored:      u64,
    attempted:   u64,
  },

  #[error("peer {node_id:?} unreachable: {reason}")]
  PeerUnreachable { node_id: String, reason: String },

  #[error("sync log entry not found: {0}")]
  AuditEntryNotFound(i64),

  #[error("sync log entry {0} is already closed")]
  AuditEntryClosed(i64),

  #[error("sync round {0} was orphaned and has been marked failed")]
  OrphanedRound(i64),

  #[error("a sync round is already in progress")]
  RoundInProgress,

  #[error("unknown {kind} value: {value:?}")]
  UnknownVariant { kind: &'static str, value: String },

  #[error("storage error: {0}")]
  Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  /// Wrap any backend failure as [`Error::Storage`].
  pub fn storage(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Storage(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
