use std::time::Duration;

/// Errors from talking to a peer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] concord_core::Error),

  #[error("HTTP request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("peer answered {status}: {body}")]
  Status { status: u16, body: String },

  #[error("timed out after {0:?}")]
  Timeout(Duration),

  #[error("exchange task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
