//! Sync audit log records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Details written when a stale `running` entry is closed at startup.
pub const ORPHANED_DETAILS: &str = "orphaned: recovered on restart";
/// Details written when the caller cancels a round.
pub const CANCELLED_DETAILS: &str = "cancelled";

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncStatus {
  Running,
  Success,
  Partial,
  Failed,
}

impl SyncStatus {
  pub fn is_terminal(self) -> bool { !matches!(self, Self::Running) }
}

/// One synchronization round. Immutable once `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
  pub id:           i64,
  /// The initiating node.
  pub node_id:      String,
  pub sync_type:    String,
  pub entity_type:  String,
  pub entity_count: u64,
  pub started_at:   DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub status:       SyncStatus,
  pub details:      Option<String>,
}

/// Input to [`crate::store::SyncAuditLog::begin`].
#[derive(Debug, Clone)]
pub struct NewSyncLogEntry {
  pub node_id:     String,
  pub sync_type:   String,
  pub entity_type: String,
}

/// Terminal state handed to [`crate::store::SyncAuditLog::complete`].
#[derive(Debug, Clone)]
pub struct SyncCompletion {
  pub status:       SyncStatus,
  pub entity_count: u64,
  pub details:      Option<String>,
}
