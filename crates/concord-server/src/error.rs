//! Startup and background-task errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("store error: {0}")]
  Store(#[from] concord_store_sqlite::Error),

  #[error(transparent)]
  Core(#[from] concord_core::Error),

  #[error("peer transport error: {0}")]
  Transport(#[from] concord_sync::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
