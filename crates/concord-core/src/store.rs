//! Component traits for the Concord fact store.
//!
//! Each concern (facts, votes, clocks, membership, audit) is its own trait so
//! the sync coordinator can be handed exactly the pieces it needs. A single
//! backend such as `concord-store-sqlite` may implement all of them.
//!
//! All methods return `Send` futures so the traits can be used in
//! multi-threaded async runtimes (e.g. tokio with `axum`).

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
  Result,
  audit::{NewSyncLogEntry, SyncCompletion, SyncLogEntry},
  clock::{ClockSnapshot, EntityKey, VectorClockEntry},
  cluster::{ClusterNode, NodeRegistration, RaftRole},
  consensus::ConsensusVote,
  fact::{Fact, NewFact},
};

// ─── Facts ───────────────────────────────────────────────────────────────────

pub trait FactStore: Send + Sync {
  /// Record a new fact originated by `origin_node`. It starts `unverified`
  /// with a score of 1.0 and takes the next id in the origin's range (see
  /// [`crate::fact::fact_id_range`]). The origin's clock row for the fact is
  /// bumped in the same transaction; on failure neither is written.
  fn record_fact<'a>(
    &'a self,
    origin_node: &'a str,
    input: NewFact,
  ) -> impl Future<Output = Result<Fact>> + Send + 'a;

  /// Insert a fact received from a peer, keeping its id. Returns `false` if
  /// the same assertion is already stored; existing facts are never
  /// overwritten. Fails with [`crate::Error::FactConflict`] when the id is
  /// taken by a different assertion.
  fn import_fact(&self, fact: Fact) -> impl Future<Output = Result<bool>> + Send + '_;

  fn get_fact(&self, fact_id: i64) -> impl Future<Output = Result<Option<Fact>>> + Send + '_;

  /// Facts in id order, optionally restricted to one `fact_type`.
  fn list_facts<'a>(
    &'a self,
    fact_type: Option<&'a str>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<Fact>>> + Send + 'a;
}

// ─── Consensus ───────────────────────────────────────────────────────────────

/// The consensus voting engine.
pub trait ConsensusEngine: Send + Sync {
  /// Cast, replace or (with `value == 0`) retract `agent`'s vote on a fact,
  /// then recompute the fact's score and classification in the same
  /// transaction. Returns the new score.
  ///
  /// Fails with [`crate::Error::InvalidVoteValue`] for values outside
  /// `{-1, 0, 1}` and [`crate::Error::FactNotFound`] for unknown facts,
  /// leaving state untouched in both cases.
  fn cast_vote<'a>(
    &'a self,
    fact_id: i64,
    agent: &'a str,
    value: i64,
  ) -> impl Future<Output = Result<f64>> + Send + 'a;

  /// [`ConsensusEngine::cast_vote`] for a vote cast on this node: `node_id`'s
  /// clock row for the vote is bumped in the same transaction, so the vote and
  /// its stamp are written together or not at all.
  fn cast_stamped_vote<'a>(
    &'a self,
    node_id: &'a str,
    fact_id: i64,
    agent: &'a str,
    value: i64,
  ) -> impl Future<Output = Result<f64>> + Send + 'a;

  fn get_vote<'a>(
    &'a self,
    fact_id: i64,
    agent: &'a str,
  ) -> impl Future<Output = Result<Option<ConsensusVote>>> + Send + 'a;

  fn votes_for(
    &self,
    fact_id: i64,
  ) -> impl Future<Output = Result<Vec<ConsensusVote>>> + Send + '_;
}

// ─── Vector clocks ───────────────────────────────────────────────────────────

pub trait ClockTracker: Send + Sync {
  /// Advance `node_id`'s version of `entity` by one, creating it at 1.
  fn bump<'a>(
    &'a self,
    node_id: &'a str,
    entity: &'a EntityKey,
  ) -> impl Future<Output = Result<VectorClockEntry>> + Send + 'a;

  /// Merge a remote row: the stored version becomes
  /// `max(local, remote.version)`. Returns the stored row after the merge.
  ///
  /// A write that would lower a stored version fails with
  /// [`crate::Error::ClockRegression`] and leaves the row unchanged.
  fn merge(
    &self,
    remote: VectorClockEntry,
  ) -> impl Future<Output = Result<VectorClockEntry>> + Send + '_;

  /// Every node's row for `entity`.
  fn entries_for<'a>(
    &'a self,
    entity: &'a EntityKey,
  ) -> impl Future<Output = Result<Vec<VectorClockEntry>>> + Send + 'a;

  fn snapshot<'a>(
    &'a self,
    entity: &'a EntityKey,
  ) -> impl Future<Output = Result<ClockSnapshot>> + Send + 'a {
    async move { Ok(ClockSnapshot::from_entries(&self.entries_for(entity).await?)) }
  }

  /// Entities with at least one row stamped after `since` (all entities when
  /// `since` is `None`).
  fn changed_since(
    &self,
    since: Option<DateTime<Utc>>,
  ) -> impl Future<Output = Result<Vec<EntityKey>>> + Send + '_;
}

// ─── Cluster membership ──────────────────────────────────────────────────────

pub trait ClusterRegistry: Send + Sync {
  /// Create or update a node and mark it active and seen now.
  fn register_node(
    &self,
    registration: NodeRegistration,
  ) -> impl Future<Output = Result<ClusterNode>> + Send + '_;

  /// Record contact with a known node. Reactivates inactive nodes.
  fn heartbeat<'a>(
    &'a self,
    node_id: &'a str,
  ) -> impl Future<Output = Result<ClusterNode>> + Send + 'a;

  fn get_node<'a>(
    &'a self,
    node_id: &'a str,
  ) -> impl Future<Output = Result<Option<ClusterNode>>> + Send + 'a;

  fn list_nodes(&self) -> impl Future<Output = Result<Vec<ClusterNode>>> + Send + '_;

  /// Active voter nodes only.
  fn list_voters(&self) -> impl Future<Output = Result<Vec<ClusterNode>>> + Send + '_;

  fn mark_inactive<'a>(
    &'a self,
    node_id: &'a str,
  ) -> impl Future<Output = Result<()>> + Send + 'a;

  /// Deactivate every active node last seen before `cutoff`, except
  /// `keep` (normally the local node). Returns the deactivated ids.
  fn mark_stale_inactive<'a>(
    &'a self,
    cutoff: DateTime<Utc>,
    keep: &'a str,
  ) -> impl Future<Output = Result<Vec<String>>> + Send + 'a;

  /// Store the role label assigned by an external election process.
  fn set_role<'a>(
    &'a self,
    node_id: &'a str,
    role: Option<RaftRole>,
  ) -> impl Future<Output = Result<ClusterNode>> + Send + 'a;

  /// The active node currently labelled leader, if any.
  fn leader(&self) -> impl Future<Output = Result<Option<ClusterNode>>> + Send + '_;
}

// ─── Sync audit log ──────────────────────────────────────────────────────────

pub trait SyncAuditLog: Send + Sync {
  /// Open a `running` entry stamped now.
  fn begin(
    &self,
    entry: NewSyncLogEntry,
  ) -> impl Future<Output = Result<SyncLogEntry>> + Send + '_;

  /// Close a `running` entry. Fails with
  /// [`crate::Error::AuditEntryClosed`] if it is already terminal.
  fn complete(
    &self,
    id: i64,
    completion: SyncCompletion,
  ) -> impl Future<Output = Result<SyncLogEntry>> + Send + '_;

  fn get_entry(&self, id: i64) -> impl Future<Output = Result<Option<SyncLogEntry>>> + Send + '_;

  /// Most recent entries first.
  fn recent(&self, limit: usize) -> impl Future<Output = Result<Vec<SyncLogEntry>>> + Send + '_;

  /// The latest `success` entry initiated by `node_id`.
  fn last_success<'a>(
    &'a self,
    node_id: &'a str,
  ) -> impl Future<Output = Result<Option<SyncLogEntry>>> + Send + 'a;

  /// Fail every `running` entry started before `older_than` with
  /// [`crate::audit::ORPHANED_DETAILS`]. Returns the closed entries.
  fn recover_orphans(
    &self,
    older_than: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<SyncLogEntry>>> + Send + '_;
}
