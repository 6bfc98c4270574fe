//! Cluster membership records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Role label maintained by an external leader-election process. The
/// registry stores it; it never assigns it.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RaftRole {
  Leader,
  Follower,
  Candidate,
}

/// A known cluster member. Nodes are never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
  pub node_id:      String,
  pub node_name:    String,
  pub node_address: String,
  pub node_region:  Option<String>,
  pub is_active:    bool,
  pub is_voter:     bool,
  pub joined_at:    DateTime<Utc>,
  pub last_seen_at: DateTime<Utc>,
  pub raft_role:    Option<RaftRole>,
  /// Opaque, caller-defined metadata.
  #[serde(default)]
  pub meta:         BTreeMap<String, String>,
}

impl ClusterNode {
  /// Active voters form the quorum population.
  pub fn is_quorum_member(&self) -> bool { self.is_active && self.is_voter }
}

/// Input to [`crate::store::ClusterRegistry::register_node`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
  pub node_id:      String,
  pub node_name:    String,
  pub node_address: String,
  #[serde(default)]
  pub node_region:  Option<String>,
  #[serde(default = "default_true")]
  pub is_voter:     bool,
  #[serde(default)]
  pub meta:         BTreeMap<String, String>,
}

fn default_true() -> bool { true }

impl NodeRegistration {
  pub fn new(
    node_id: impl Into<String>,
    node_name: impl Into<String>,
    node_address: impl Into<String>,
  ) -> Self {
    Self {
      node_id:      node_id.into(),
      node_name:    node_name.into(),
      node_address: node_address.into(),
      node_region:  None,
      is_voter:     true,
      meta:         BTreeMap::new(),
    }
  }
}

impl From<&ClusterNode> for NodeRegistration {
  fn from(node: &ClusterNode) -> Self {
    Self {
      node_id:      node.node_id.clone(),
      node_name:    node.node_name.clone(),
      node_address: node.node_address.clone(),
      node_region:  node.node_region.clone(),
      is_voter:     node.is_voter,
      meta:         node.meta.clone(),
    }
  }
}

// ─── Liveness ────────────────────────────────────────────────────────────────

/// How long a node may stay silent before it is marked inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessPolicy {
  pub heartbeat_interval: std::time::Duration,
  /// Consecutive heartbeats a node may miss before deactivation.
  pub missed_heartbeats:  u32,
}

impl LivenessPolicy {
  pub fn timeout(&self) -> std::time::Duration {
    self.heartbeat_interval.saturating_mul(self.missed_heartbeats)
  }

  /// Nodes last seen strictly before this instant are considered dead.
  pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    let timeout = chrono::Duration::from_std(self.timeout())
      .unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use chrono::TimeZone;

  use super::*;

  #[test]
  fn cutoff_is_interval_times_missed() {
    let policy = LivenessPolicy {
      heartbeat_interval: Duration::from_secs(10),
      missed_heartbeats:  3,
    };
    let now = Utc.timestamp_opt(1_000, 0).unwrap();
    assert_eq!(policy.cutoff(now), Utc.timestamp_opt(970, 0).unwrap());
  }

  #[test]
  fn registration_defaults_to_voter() {
    let reg: NodeRegistration = serde_json::from_str(
      r#"{"node_id":"n1","node_name":"one","node_address":"http://n1"}"#,
    )
    .unwrap();
    assert!(reg.is_voter);
    assert!(reg.node_region.is_none());
  }

  #[test]
  fn role_parses_lowercase() {
    assert_eq!("leader".parse::<RaftRole>().unwrap(), RaftRole::Leader);
    assert_eq!(RaftRole::Candidate.as_ref(), "candidate");
  }
}
