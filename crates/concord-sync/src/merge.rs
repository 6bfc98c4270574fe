//! Applying a remote payload to the local store.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use concord_core::{
  Error as CoreError,
  clock::{CausalOrder, ClockSnapshot, EntityKey, MergePolicy, should_apply_remote},
  store::{ClockTracker, ConsensusEngine, FactStore},
};

use crate::payload::SyncPayload;

/// What a single [`apply_payload`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
  pub facts_imported: usize,
  pub votes_applied:  usize,
  pub votes_skipped:  usize,
  /// Concurrent revisions handed to the merge policy.
  pub conflicts:      usize,
  pub clocks_merged:  usize,
  /// Incoming facts whose id is held locally by a different assertion.
  /// Nothing referring to them was applied.
  pub fact_conflicts: BTreeSet<i64>,
}

/// Merge `payload` into `store`.
///
/// Facts are imported first so replayed votes find them. Each vote is replayed
/// through [`ConsensusEngine::cast_vote`] only when the remote revision wins;
/// afterwards every clock row is merged. A vote whose fact is still unknown is
/// skipped together with its clock rows, so a later round can replay it.
///
/// An incoming fact that collides with a different local assertion is listed
/// in [`MergeReport::fact_conflicts`]; its votes and every clock row of the
/// fact or its votes are skipped.
///
/// Storage errors abort the merge; everything already applied stays applied
/// and is idempotent to apply again.
pub async fn apply_payload<S>(
  store: &S,
  policy: &dyn MergePolicy,
  payload: &SyncPayload,
) -> concord_core::Result<MergeReport>
where
  S: FactStore + ConsensusEngine + ClockTracker,
{
  let mut report = MergeReport::default();
  let origin = payload.origin_node.as_str();

  for fact in &payload.facts {
    match store.import_fact(fact.clone()).await {
      Ok(true) => report.facts_imported += 1,
      Ok(false) => {}
      Err(CoreError::FactConflict(fact_id)) => {
        warn!(fact_id, %origin, "remote fact collides with a local one; skipping it");
        report.fact_conflicts.insert(fact_id);
      }
      Err(e) => return Err(e),
    }
  }

  let remote_snapshots = payload.snapshots();
  let empty = ClockSnapshot::new();
  let mut deferred: BTreeSet<EntityKey> = BTreeSet::new();

  for vote in &payload.votes {
    let key = vote.key();
    if report.fact_conflicts.contains(&vote.fact_id) {
      report.votes_skipped += 1;
      continue;
    }
    let remote = remote_snapshots.get(&key).unwrap_or(&empty);
    let local = store.snapshot(&key).await?;

    let (order, apply) = should_apply_remote(policy, &key, &local, remote);
    if order == CausalOrder::Concurrent {
      report.conflicts += 1;
      debug!(entity = %key, %origin, take_remote = apply, "concurrent vote revision");
    }
    if !apply {
      report.votes_skipped += 1;
      continue;
    }

    match store.cast_vote(vote.fact_id, &vote.agent, vote.value).await {
      Ok(score) => {
        report.votes_applied += 1;
        debug!(entity = %key, %origin, value = vote.value, score, "replayed remote vote");
      }
      Err(CoreError::FactNotFound(_)) => {
        warn!(entity = %key, %origin, "remote vote refers to an unknown fact; deferring");
        deferred.insert(key);
        report.votes_skipped += 1;
      }
      Err(CoreError::InvalidVoteValue(value)) => {
        warn!(entity = %key, %origin, value, "remote vote has an invalid value; ignoring");
        deferred.insert(key);
        report.votes_skipped += 1;
      }
      Err(e) => return Err(e),
    }
  }

  for row in &payload.clocks {
    let key = row.key();
    let conflicted = key
      .fact_ref()
      .is_some_and(|fact_id| report.fact_conflicts.contains(&fact_id));
    if conflicted || deferred.contains(&key) {
      continue;
    }
    store.merge(row.clone()).await?;
    report.clocks_merged += 1;
  }

  debug!(%origin, ?report, "payload merged");
  Ok(report)
}
