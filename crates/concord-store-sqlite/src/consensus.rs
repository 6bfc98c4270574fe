//! [`ConsensusEngine`] for [`SqliteStore`].

use rusqlite::{OptionalExtension as _, TransactionBehavior};
use tracing::debug;

use concord_core::{
  Error as CoreError,
  clock::EntityKey,
  consensus::{ConsensusVote, Tally, VoteValue},
  store::ConsensusEngine,
};

use crate::{
  Result, SqliteStore,
  clock::bump_in,
  encode::{RawVote, decode_confidence, encode_dt, now},
  error::abort,
};

/// Apply one vote and recompute the fact's consensus fields inside the
/// caller's transaction.
fn vote_in(
  conn: &rusqlite::Connection,
  fact_id: i64,
  agent: &str,
  value: VoteValue,
  at_str: &str,
) -> Result<Tally, tokio_rusqlite::Error> {
  let prior: Option<String> = conn
    .query_row(
      "SELECT confidence FROM facts WHERE fact_id = ?1",
      rusqlite::params![fact_id],
      |row| row.get(0),
    )
    .optional()?;
  let Some(prior) = prior else {
    return Err(abort(CoreError::FactNotFound(fact_id)));
  };
  let prior = decode_confidence(&prior).map_err(|e| abort(e.into()))?;

  if value.is_retraction() {
    conn.execute(
      "DELETE FROM consensus_votes WHERE fact_id = ?1 AND agent = ?2",
      rusqlite::params![fact_id, agent],
    )?;
  } else {
    conn.execute(
      "INSERT INTO consensus_votes (fact_id, agent, vote, voted_at)
       VALUES (?1, ?2, ?3, ?4)
       ON CONFLICT(fact_id, agent) DO UPDATE
         SET vote = excluded.vote, voted_at = excluded.voted_at",
      rusqlite::params![fact_id, agent, value.as_i64(), at_str],
    )?;
  }

  let vote_sum: i64 = conn.query_row(
    "SELECT COALESCE(SUM(vote), 0) FROM consensus_votes WHERE fact_id = ?1",
    rusqlite::params![fact_id],
    |row| row.get(0),
  )?;
  let tally = Tally::recompute(vote_sum, prior);

  conn.execute(
    "UPDATE facts SET consensus_score = ?2, confidence = ?3, updated_at = ?4
     WHERE fact_id = ?1",
    rusqlite::params![fact_id, tally.score, tally.confidence.as_ref(), at_str],
  )?;
  Ok(tally)
}

impl SqliteStore {
  /// Cast a vote, optionally stamping `stamp_node`'s clock row for it, in one
  /// IMMEDIATE transaction.
  async fn cast(
    &self,
    stamp_node: Option<&str>,
    fact_id: i64,
    agent: &str,
    value: i64,
  ) -> concord_core::Result<f64> {
    // Validate before touching the database.
    let value = VoteValue::try_from(value)?;
    let agent = agent.to_owned();
    let stamp_node = stamp_node.map(str::to_owned);
    let stamped = stamp_node.is_some();
    let at_str = encode_dt(now());

    let tally = self
      .conn
      .call(move |conn| {
        // IMMEDIATE takes the write lock up front, so two casts on the same
        // fact cannot both read the pre-vote sum.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let tally = vote_in(&tx, fact_id, &agent, value, &at_str)?;
        if let Some(node_id) = &stamp_node {
          bump_in(&tx, node_id, &EntityKey::vote(fact_id, &agent), &at_str)?;
        }
        tx.commit()?;
        Ok(tally)
      })
      .await
      .map_err(crate::Error::from)?;

    debug!(
      fact_id,
      vote = value.as_i64(),
      vote_sum = tally.vote_sum,
      score = tally.score,
      confidence = %tally.confidence,
      stamped,
      "vote cast"
    );
    Ok(tally.score)
  }
}

impl ConsensusEngine for SqliteStore {
  async fn cast_vote(&self, fact_id: i64, agent: &str, value: i64) -> concord_core::Result<f64> {
    self.cast(None, fact_id, agent, value).await
  }

  async fn cast_stamped_vote(
    &self,
    node_id: &str,
    fact_id: i64,
    agent: &str,
    value: i64,
  ) -> concord_core::Result<f64> {
    self.cast(Some(node_id), fact_id, agent, value).await
  }

  async fn get_vote(
    &self,
    fact_id: i64,
    agent: &str,
  ) -> concord_core::Result<Option<ConsensusVote>> {
    let agent = agent.to_owned();
    let raw: Option<RawVote> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT fact_id, agent, vote, voted_at FROM consensus_votes
               WHERE fact_id = ?1 AND agent = ?2",
              rusqlite::params![fact_id, agent],
              RawVote::from_row,
            )
            .optional()?,
        )
      })
      .await
      .map_err(crate::Error::from)?;

    Ok(raw.map(RawVote::into_vote).transpose()?)
  }

  async fn votes_for(&self, fact_id: i64) -> concord_core::Result<Vec<ConsensusVote>> {
    let raws: Vec<RawVote> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT fact_id, agent, vote, voted_at FROM consensus_votes
           WHERE fact_id = ?1 ORDER BY agent",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![fact_id], RawVote::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await
      .map_err(crate::Error::from)?;

    Ok(raws.into_iter().map(RawVote::into_vote).collect::<Result<_>>()?)
  }
}
