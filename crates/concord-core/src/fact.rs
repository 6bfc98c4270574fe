//! Facts: the assertions agents record and vote on.
//!
//! A fact's `content` and `fact_type` never change after it is recorded. The
//! only mutable fields are `confidence` and `consensus_score`, and those are
//! written exclusively by the consensus recompute step.
//!
//! Fact ids are partitioned by the node that recorded the fact: the high bits
//! hold a prefix derived from the origin node's id and the low
//! [`FACT_SEQ_BITS`] bits a sequence local to that node. Nodes recording
//! facts independently therefore never hand out the same id.

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumString};

// ─── Ids ─────────────────────────────────────────────────────────────────────

/// Width of the per-node sequence in a fact id.
pub const FACT_SEQ_BITS: u32 = 32;

const SEQ_MASK: i64 = (1 << FACT_SEQ_BITS) - 1;

/// The 31-bit id prefix owned by `node_id`.
pub fn node_prefix(node_id: &str) -> i64 {
  let digest = Sha256::digest(node_id.as_bytes());
  let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
  i64::from(head & 0x7FFF_FFFF)
}

/// Every id `node_id` may assign to a fact it records. Sequences start at 1.
pub fn fact_id_range(node_id: &str) -> RangeInclusive<i64> {
  let base = node_prefix(node_id) << FACT_SEQ_BITS;
  (base | 1)..=(base | SEQ_MASK)
}

/// The prefix half of a fact id.
pub fn fact_id_prefix(fact_id: i64) -> i64 { fact_id >> FACT_SEQ_BITS }

// ─── Confidence ──────────────────────────────────────────────────────────────

/// Classification derived from the consensus score.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  AsRefStr,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Confidence {
  #[default]
  Unverified,
  Verified,
  Disputed,
}

// ─── Fact ────────────────────────────────────────────────────────────────────

/// A stored assertion together with its live consensus state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
  pub fact_id:         i64,
  /// Node that recorded the fact; its prefix is in `fact_id`.
  pub origin_node:     String,
  pub content:         String,
  pub fact_type:       String,
  pub confidence:      Confidence,
  pub consensus_score: f64,
  pub created_at:      DateTime<Utc>,
  /// Last time the consensus fields were recomputed.
  pub updated_at:      DateTime<Utc>,
}

/// Input to [`crate::store::FactStore::record_fact`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFact {
  pub content:   String,
  pub fact_type: String,
}

impl Fact {
  /// Whether `other` is the same assertion: same id, origin and content.
  /// Consensus fields are replica-local and not compared.
  pub fn same_assertion(&self, other: &Fact) -> bool {
    self.fact_id == other.fact_id
      && self.origin_node == other.origin_node
      && self.content == other.content
      && self.fact_type == other.fact_type
  }
}

impl NewFact {
  pub fn new(content: impl Into<String>, fact_type: impl Into<String>) -> Self {
    Self { content: content.into(), fact_type: fact_type.into() }
  }
}
