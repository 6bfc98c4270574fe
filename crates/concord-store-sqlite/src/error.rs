//! Error type for `concord-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] concord_core::Error),

  #[error("database error: {0}")]
  Database(tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("integer out of range for column {0}")]
  OutOfRange(&'static str),
}

/// Domain errors raised inside a connection closure travel back as
/// `tokio_rusqlite::Error::Other`; unwrap them here so callers see the
/// original [`concord_core::Error`].
impl From<tokio_rusqlite::Error> for Error {
  fn from(e: tokio_rusqlite::Error) -> Self {
    match e {
      tokio_rusqlite::Error::Other(inner) => {
        match inner.downcast::<concord_core::Error>() {
          Ok(core) => Error::Core(*core),
          Err(other) => Error::Database(tokio_rusqlite::Error::Other(other)),
        }
      }
      other => Error::Database(other),
    }
  }
}

impl From<Error> for concord_core::Error {
  fn from(e: Error) -> Self {
    match e {
      Error::Core(core) => core,
      other => concord_core::Error::storage(other),
    }
  }
}

/// Lift a domain error into the error type connection closures return.
pub(crate) fn abort(e: concord_core::Error) -> tokio_rusqlite::Error {
  tokio_rusqlite::Error::Other(Box::new(e))
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
