//! Wire format for peer exchange.
//!
//! A payload carries every clock row of each changed entity, the current
//! value of each changed vote (0 when retracted) and the records of any facts
//! those entities refer to. It is sent as JSON in both directions.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use concord_core::{
  clock::{ClockSnapshot, EntityKey, VectorClockEntry},
  cluster::NodeRegistration,
  fact::Fact,
  store::{ClockTracker, ConsensusEngine, FactStore},
};

/// A vote as exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
  pub fact_id: i64,
  pub agent:   String,
  /// -1, 0 or 1; 0 means the agent's vote was retracted.
  pub value:   i64,
}

impl VoteRecord {
  pub fn key(&self) -> EntityKey { EntityKey::vote(self.fact_id, &self.agent) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
  /// Node that assembled the payload.
  pub origin_node: String,
  #[serde(default)]
  pub facts:       Vec<Fact>,
  #[serde(default)]
  pub clocks:      Vec<VectorClockEntry>,
  #[serde(default)]
  pub votes:       Vec<VoteRecord>,
}

impl SyncPayload {
  pub fn empty(origin_node: impl Into<String>) -> Self {
    Self { origin_node: origin_node.into(), ..Self::default() }
  }

  /// Distinct changed entities in the payload. Fact records that only ride
  /// along with a vote are not counted.
  pub fn entity_keys(&self) -> BTreeSet<EntityKey> {
    self
      .clocks
      .iter()
      .map(VectorClockEntry::key)
      .chain(self.votes.iter().map(VoteRecord::key))
      .collect()
  }

  pub fn entity_count(&self) -> usize { self.entity_keys().len() }

  pub fn is_empty(&self) -> bool {
    self.facts.is_empty() && self.clocks.is_empty() && self.votes.is_empty()
  }

  /// Clock rows grouped into one snapshot per entity.
  pub fn snapshots(&self) -> BTreeMap<EntityKey, ClockSnapshot> {
    let mut out: BTreeMap<EntityKey, ClockSnapshot> = BTreeMap::new();
    for row in &self.clocks {
      out
        .entry(row.key())
        .or_default()
        .observe(&row.node_id, row.version, row.timestamp);
    }
    out
  }
}

/// Body of `POST /api/sync/exchange`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRequest {
  /// The calling node; the receiver registers or refreshes it.
  pub from:    NodeRegistration,
  /// The caller's watermark. The answer holds the receiver's changes since.
  pub since:   Option<DateTime<Utc>>,
  pub payload: SyncPayload,
}

/// Assemble every local change since `since` (everything when `None`).
pub async fn collect_deltas<S>(
  store: &S,
  origin_node: &str,
  since: Option<DateTime<Utc>>,
) -> concord_core::Result<SyncPayload>
where
  S: FactStore + ConsensusEngine + ClockTracker,
{
  let mut payload = SyncPayload::empty(origin_node);
  let mut fact_ids = BTreeSet::new();

  for key in store.changed_since(since).await? {
    payload.clocks.extend(store.entries_for(&key).await?);

    if let Some((fact_id, agent)) = key.as_vote() {
      let value = store
        .get_vote(fact_id, agent)
        .await?
        .map_or(0, |v| v.value.as_i64());
      payload.votes.push(VoteRecord { fact_id, agent: agent.to_owned(), value });
      fact_ids.insert(fact_id);
    } else if let Some(fact_id) = key.as_fact() {
      fact_ids.insert(fact_id);
    }
  }

  // Votes travel with their fact so the receiver can always replay them.
  for fact_id in fact_ids {
    if let Some(fact) = store.get_fact(fact_id).await? {
      payload.facts.push(fact);
    }
  }

  Ok(payload)
}
