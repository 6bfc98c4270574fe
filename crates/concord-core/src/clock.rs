//! Vector clocks for causal ordering of entity revisions across nodes.
//!
//! Each `(node_id, entity_type, entity_id)` row carries a version that only
//! moves forward. Grouping every node's row for one entity yields a
//! [`ClockSnapshot`], and two snapshots of the same entity are ordered with
//! [`ClockSnapshot::compare`].

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Entity identity ─────────────────────────────────────────────────────────

/// Entity type tag for facts.
pub const FACT_ENTITY: &str = "fact";
/// Entity type tag for votes.
pub const VOTE_ENTITY: &str = "vote";

/// The `(entity_type, entity_id)` pair a clock row tracks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
  pub entity_type: String,
  pub entity_id:   String,
}

impl EntityKey {
  pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
    Self { entity_type: entity_type.into(), entity_id: entity_id.into() }
  }

  pub fn fact(fact_id: i64) -> Self { Self::new(FACT_ENTITY, fact_id.to_string()) }

  /// Votes are keyed `"<fact_id>:<agent>"`.
  pub fn vote(fact_id: i64, agent: &str) -> Self {
    Self::new(VOTE_ENTITY, format!("{fact_id}:{agent}"))
  }

  /// Split a vote entity id back into `(fact_id, agent)`.
  pub fn as_vote(&self) -> Option<(i64, &str)> {
    if self.entity_type != VOTE_ENTITY {
      return None;
    }
    let (fact, agent) = self.entity_id.split_once(':')?;
    Some((fact.parse().ok()?, agent))
  }

  pub fn as_fact(&self) -> Option<i64> {
    if self.entity_type != FACT_ENTITY {
      return None;
    }
    self.entity_id.parse().ok()
  }

  /// The fact a fact or vote entity belongs to.
  pub fn fact_ref(&self) -> Option<i64> {
    self.as_fact().or_else(|| self.as_vote().map(|(fact_id, _)| fact_id))
  }
}

impl fmt::Display for EntityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.entity_type, self.entity_id)
  }
}

// ─── VectorClockEntry ────────────────────────────────────────────────────────

/// One node's version of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClockEntry {
  pub node_id:     String,
  pub entity_type: String,
  pub entity_id:   String,
  pub version:     u64,
  /// When `version` last moved.
  pub timestamp:   DateTime<Utc>,
}

impl VectorClockEntry {
  pub fn key(&self) -> EntityKey {
    EntityKey::new(self.entity_type.clone(), self.entity_id.clone())
  }

  /// The entry that results from merging `remote` into `self`.
  ///
  /// Versions take the maximum. The remote timestamp is adopted only when the
  /// remote version is strictly higher; a node stamps each version once, so
  /// equal versions carry the same bump.
  pub fn merged_with(&self, remote: &VectorClockEntry) -> VectorClockEntry {
    if remote.version > self.version {
      VectorClockEntry { node_id: self.node_id.clone(), ..remote.clone() }
    } else {
      self.clone()
    }
  }
}

// ─── Causal order ────────────────────────────────────────────────────────────

/// How two snapshots of the same entity relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CausalOrder {
  /// Left happened before right.
  Before,
  /// Right happened before left.
  After,
  Equal,
  /// Neither dominates; a merge policy has to pick.
  Concurrent,
}

// ─── ClockSnapshot ───────────────────────────────────────────────────────────

/// Per-node versions of a single entity, with the timestamp of each node's
/// last bump. Nodes absent from the map count as version 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSnapshot {
  entries: BTreeMap<String, (u64, DateTime<Utc>)>,
}

impl ClockSnapshot {
  pub fn new() -> Self { Self::default() }

  /// Build a snapshot from clock rows. Rows are assumed to belong to one
  /// entity; duplicates for a node are merged.
  pub fn from_entries<'a>(rows: impl IntoIterator<Item = &'a VectorClockEntry>) -> Self {
    let mut snap = Self::new();
    for row in rows {
      snap.observe(&row.node_id, row.version, row.timestamp);
    }
    snap
  }

  /// Fold one node's version in, keeping the maximum.
  pub fn observe(&mut self, node_id: &str, version: u64, timestamp: DateTime<Utc>) {
    match self.entries.get_mut(node_id) {
      Some(slot) => {
        if version > slot.0 {
          *slot = (version, timestamp);
        }
      }
      None => {
        self.entries.insert(node_id.to_owned(), (version, timestamp));
      }
    }
  }

  pub fn get(&self, node_id: &str) -> u64 {
    self.entries.get(node_id).map_or(0, |(v, _)| *v)
  }

  pub fn nodes(&self) -> impl Iterator<Item = &str> { self.entries.keys().map(String::as_str) }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  /// Element-wise maximum with `other`.
  pub fn merge(&mut self, other: &ClockSnapshot) {
    for (node, (version, ts)) in &other.entries {
      self.observe(node, *version, *ts);
    }
  }

  /// Causal relation of `self` to `other`.
  pub fn compare(&self, other: &ClockSnapshot) -> CausalOrder {
    let mut less = false;
    let mut greater = false;
    for node in self.entries.keys().chain(other.entries.keys()) {
      match self.get(node).cmp(&other.get(node)) {
        Ordering::Less => less = true,
        Ordering::Greater => greater = true,
        Ordering::Equal => {}
      }
    }
    match (less, greater) {
      (false, false) => CausalOrder::Equal,
      (true, false) => CausalOrder::Before,
      (false, true) => CausalOrder::After,
      (true, true) => CausalOrder::Concurrent,
    }
  }

  pub fn happens_before(&self, other: &ClockSnapshot) -> bool {
    self.compare(other) == CausalOrder::Before
  }

  /// The most recent bump in this snapshot and the node that made it. Ties on
  /// timestamp go to the greater node id.
  pub fn last_write(&self) -> Option<(DateTime<Utc>, &str)> {
    self
      .entries
      .iter()
      .map(|(node, (_, ts))| (*ts, node.as_str()))
      .max()
  }
}

// ─── Merge policy ────────────────────────────────────────────────────────────

/// Which side of a concurrent revision to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  KeepLocal,
  TakeRemote,
}

/// Decides the winner between two concurrent revisions of one entity.
pub trait MergePolicy: Send + Sync {
  fn resolve(
    &self,
    entity: &EntityKey,
    local: &ClockSnapshot,
    remote: &ClockSnapshot,
  ) -> Resolution;
}

/// Last writer wins by timestamp; equal timestamps fall back to the greater
/// node id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl MergePolicy for LastWriterWins {
  fn resolve(
    &self,
    _entity: &EntityKey,
    local: &ClockSnapshot,
    remote: &ClockSnapshot,
  ) -> Resolution {
    match (local.last_write(), remote.last_write()) {
      (Some(l), Some(r)) if r > l => Resolution::TakeRemote,
      (None, Some(_)) => Resolution::TakeRemote,
      _ => Resolution::KeepLocal,
    }
  }
}

/// Decide whether a remote revision should replace the local one.
pub fn should_apply_remote(
  policy: &dyn MergePolicy,
  entity: &EntityKey,
  local: &ClockSnapshot,
  remote: &ClockSnapshot,
) -> (CausalOrder, bool) {
  let order = local.compare(remote);
  let apply = match order {
    CausalOrder::Before => true,
    CausalOrder::After | CausalOrder::Equal => false,
    CausalOrder::Concurrent => {
      policy.resolve(entity, local, remote) == Resolution::TakeRemote
    }
  };
  (order, apply)
}
