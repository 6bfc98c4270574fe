//! SQLite backend for the Concord fact store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. One [`SqliteStore`] implements every
//! component trait from [`concord_core::store`].

mod audit;
mod clock;
mod cluster;
mod consensus;
mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{Capabilities, SqliteStore};
