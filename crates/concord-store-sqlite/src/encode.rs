//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings with a fixed microsecond
//! precision and a `Z` suffix, so lexical order in SQL equals time order.
//! Enums are stored as their lowercase names; `meta` is compact JSON.

use std::{collections::BTreeMap, str::FromStr};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use concord_core::{
  audit::{SyncLogEntry, SyncStatus},
  clock::VectorClockEntry,
  cluster::{ClusterNode, RaftRole},
  consensus::{ConsensusVote, VoteValue},
  fact::{Confidence, Fact},
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

/// The current time at storage precision, so values handed back to callers
/// equal what a later read returns.
pub fn now() -> DateTime<Utc> { Utc::now().trunc_subsecs(6) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Enums ───────────────────────────────────────────────────────────────────

fn decode_variant<T: FromStr>(kind: &'static str, s: &str) -> Result<T> {
  s.parse().map_err(|_| {
    Error::Core(concord_core::Error::UnknownVariant { kind, value: s.to_owned() })
  })
}

pub fn decode_confidence(s: &str) -> Result<Confidence> { decode_variant("confidence", s) }

pub fn decode_status(s: &str) -> Result<SyncStatus> { decode_variant("sync status", s) }

pub fn decode_role(s: &str) -> Result<RaftRole> { decode_variant("raft role", s) }

// ─── Meta ────────────────────────────────────────────────────────────────────

pub fn encode_meta(meta: &BTreeMap<String, String>) -> Result<String> {
  Ok(serde_json::to_string(meta)?)
}

pub fn decode_meta(s: &str) -> Result<BTreeMap<String, String>> {
  Ok(serde_json::from_str(s)?)
}

// ─── Integers ────────────────────────────────────────────────────────────────

pub fn encode_u64(v: u64, column: &'static str) -> Result<i64> {
  i64::try_from(v).map_err(|_| Error::OutOfRange(column))
}

pub fn decode_u64(v: i64, column: &'static str) -> Result<u64> {
  u64::try_from(v).map_err(|_| Error::OutOfRange(column))
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Raw values read directly from a `facts` row.
pub struct RawFact {
  pub fact_id:         i64,
  pub origin_node:     String,
  pub content:         String,
  pub fact_type:       String,
  pub confidence:      String,
  pub consensus_score: f64,
  pub created_at:      String,
  pub updated_at:      String,
}

pub const FACT_COLUMNS: &str =
  "fact_id, origin_node, content, fact_type, confidence, consensus_score, created_at, updated_at";

impl RawFact {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      fact_id:         row.get(0)?,
      origin_node:     row.get(1)?,
      content:         row.get(2)?,
      fact_type:       row.get(3)?,
      confidence:      row.get(4)?,
      consensus_score: row.get(5)?,
      created_at:      row.get(6)?,
      updated_at:      row.get(7)?,
    })
  }

  pub fn into_fact(self) -> Result<Fact> {
    Ok(Fact {
      fact_id:         self.fact_id,
      origin_node:     self.origin_node,
      content:         self.content,
      fact_type:       self.fact_type,
      confidence:      decode_confidence(&self.confidence)?,
      consensus_score: self.consensus_score,
      created_at:      decode_dt(&self.created_at)?,
      updated_at:      decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw values read directly from a `consensus_votes` row.
pub struct RawVote {
  pub fact_id:  i64,
  pub agent:    String,
  pub vote:     i64,
  pub voted_at: String,
}

impl RawVote {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      fact_id:  row.get(0)?,
      agent:    row.get(1)?,
      vote:     row.get(2)?,
      voted_at: row.get(3)?,
    })
  }

  pub fn into_vote(self) -> Result<ConsensusVote> {
    Ok(ConsensusVote {
      fact_id:  self.fact_id,
      agent:    self.agent,
      value:    VoteValue::try_from(self.vote)?,
      voted_at: decode_dt(&self.voted_at)?,
    })
  }
}

/// Raw values read directly from a `vector_clocks` row.
pub struct RawClock {
  pub node_id:     String,
  pub entity_type: String,
  pub entity_id:   String,
  pub version:     i64,
  pub timestamp:   String,
}

pub const CLOCK_COLUMNS: &str = "node_id, entity_type, entity_id, version, timestamp";

impl RawClock {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      node_id:     row.get(0)?,
      entity_type: row.get(1)?,
      entity_id:   row.get(2)?,
      version:     row.get(3)?,
      timestamp:   row.get(4)?,
    })
  }

  pub fn into_entry(self) -> Result<VectorClockEntry> {
    Ok(VectorClockEntry {
      node_id:     self.node_id,
      entity_type: self.entity_type,
      entity_id:   self.entity_id,
      version:     decode_u64(self.version, "vector_clocks.version")?,
      timestamp:   decode_dt(&self.timestamp)?,
    })
  }
}

/// Raw values read directly from a `cluster_nodes` row.
pub struct RawNode {
  pub node_id:      String,
  pub node_name:    String,
  pub node_address: String,
  pub node_region:  Option<String>,
  pub is_active:    bool,
  pub is_voter:     bool,
  pub joined_at:    String,
  pub last_seen_at: String,
  pub raft_role:    Option<String>,
  pub meta:         String,
}

pub const NODE_COLUMNS: &str = "node_id, node_name, node_address, node_region, is_active, \
                                is_voter, joined_at, last_seen_at, raft_role, meta";

impl RawNode {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      node_id:      row.get(0)?,
      node_name:    row.get(1)?,
      node_address: row.get(2)?,
      node_region:  row.get(3)?,
      is_active:    row.get(4)?,
      is_voter:     row.get(5)?,
      joined_at:    row.get(6)?,
      last_seen_at: row.get(7)?,
      raft_role:    row.get(8)?,
      meta:         row.get(9)?,
    })
  }

  pub fn into_node(self) -> Result<ClusterNode> {
    Ok(ClusterNode {
      node_id:      self.node_id,
      node_name:    self.node_name,
      node_address: self.node_address,
      node_region:  self.node_region,
      is_active:    self.is_active,
      is_voter:     self.is_voter,
      joined_at:    decode_dt(&self.joined_at)?,
      last_seen_at: decode_dt(&self.last_seen_at)?,
      raft_role:    self.raft_role.as_deref().map(decode_role).transpose()?,
      meta:         decode_meta(&self.meta)?,
    })
  }
}

/// Raw values read directly from a `sync_log` row.
pub struct RawSyncLog {
  pub id:           i64,
  pub node_id:      String,
  pub sync_type:    String,
  pub entity_type:  String,
  pub entity_count: i64,
  pub started_at:   String,
  pub completed_at: Option<String>,
  pub status:       String,
  pub details:      Option<String>,
}

pub const SYNC_LOG_COLUMNS: &str = "id, node_id, sync_type, entity_type, entity_count, \
                                    started_at, completed_at, status, details";

impl RawSyncLog {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:           row.get(0)?,
      node_id:      row.get(1)?,
      sync_type:    row.get(2)?,
      entity_type:  row.get(3)?,
      entity_count: row.get(4)?,
      started_at:   row.get(5)?,
      completed_at: row.get(6)?,
      status:       row.get(7)?,
      details:      row.get(8)?,
    })
  }

  pub fn into_entry(self) -> Result<SyncLogEntry> {
    Ok(SyncLogEntry {
      id:           self.id,
      node_id:      self.node_id,
      sync_type:    self.sync_type,
      entity_type:  self.entity_type,
      entity_count: decode_u64(self.entity_count, "sync_log.entity_count")?,
      started_at:   decode_dt(&self.started_at)?,
      completed_at: self.completed_at.as_deref().map(decode_dt).transpose()?,
      status:       decode_status(&self.status)?,
      details:      self.details,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn encoded_timestamps_sort_chronologically() {
    let a = Utc.timestamp_opt(1_700_000_000, 5_000).unwrap();
    let b = Utc.timestamp_opt(1_700_000_000, 120_000_000).unwrap();
    let c = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
    let (ea, eb, ec) = (encode_dt(a), encode_dt(b), encode_dt(c));
    assert!(ea < eb && eb < ec, "{ea} {eb} {ec}");
    assert_eq!(decode_dt(&ea).unwrap(), a);
  }

  #[test]
  fn unknown_enum_text_is_rejected() {
    assert!(decode_confidence("maybe").is_err());
    assert_eq!(decode_status("partial").unwrap(), SyncStatus::Partial);
  }
}
