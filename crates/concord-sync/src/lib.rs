//! Replication between Concord nodes.
//!
//! A [`SyncCoordinator`] runs rounds: it collects local deltas since the last
//! successful round, exchanges them with every active voter peer (or a single
//! hub) over a [`PeerTransport`], merges what comes back and records the
//! outcome in the sync audit log.

#![allow(async_fn_in_trait)]

pub mod cancel;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod payload;
pub mod transport;

pub use cancel::CancellationToken;
pub use coordinator::{CoordinatorConfig, SyncBackend, SyncCoordinator, SyncOutcome, SyncState};
pub use error::{Error, Result};
pub use payload::{ExchangeRequest, SyncPayload, VoteRecord};
pub use transport::{HttpTransport, Peer, PeerTransport};

#[cfg(test)]
mod tests;
