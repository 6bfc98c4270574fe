//! Votes and the consensus scoring rule.
//!
//! The score is always recomputed from the full set of stored votes rather
//! than adjusted incrementally, so it can never drift from the vote table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, fact::Confidence};

/// Score at or above which a fact becomes [`Confidence::Verified`].
pub const VERIFIED_THRESHOLD: f64 = 1.5;
/// Score at or below which a fact becomes [`Confidence::Disputed`].
pub const DISPUTED_THRESHOLD: f64 = 0.5;

// ─── VoteValue ───────────────────────────────────────────────────────────────

/// An agent's stance on a fact. `Retract` removes any stored vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum VoteValue {
  Disagree,
  Retract,
  Agree,
}

impl VoteValue {
  pub fn as_i64(self) -> i64 {
    match self {
      Self::Disagree => -1,
      Self::Retract => 0,
      Self::Agree => 1,
    }
  }

  pub fn is_retraction(self) -> bool { matches!(self, Self::Retract) }
}

impl TryFrom<i64> for VoteValue {
  type Error = Error;

  fn try_from(value: i64) -> Result<Self> {
    match value {
      -1 => Ok(Self::Disagree),
      0 => Ok(Self::Retract),
      1 => Ok(Self::Agree),
      other => Err(Error::InvalidVoteValue(other)),
    }
  }
}

impl From<VoteValue> for i64 {
  fn from(v: VoteValue) -> Self { v.as_i64() }
}

// ─── ConsensusVote ───────────────────────────────────────────────────────────

/// A stored vote. Never holds [`VoteValue::Retract`]; retractions delete the
/// row instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVote {
  pub fact_id:  i64,
  pub agent:    String,
  pub value:    VoteValue,
  pub voted_at: DateTime<Utc>,
}

// ─── Scoring ─────────────────────────────────────────────────────────────────

/// `max(0, 1 + 0.1 × vote_sum)`.
///
/// Computed as `(10 + sum) / 10` so integer sums land exactly on the
/// classification thresholds.
pub fn consensus_score(vote_sum: i64) -> f64 {
  ((10 + vote_sum) as f64 / 10.0).max(0.0)
}

/// Classify a score. Scores strictly inside the neutral band keep `prior`.
pub fn classify(score: f64, prior: Confidence) -> Confidence {
  if score >= VERIFIED_THRESHOLD {
    Confidence::Verified
  } else if score <= DISPUTED_THRESHOLD {
    Confidence::Disputed
  } else {
    prior
  }
}

/// The outcome of recomputing a fact's consensus state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tally {
  pub vote_sum:   i64,
  pub score:      f64,
  pub confidence: Confidence,
}

impl Tally {
  pub fn recompute(vote_sum: i64, prior: Confidence) -> Self {
    let score = consensus_score(vote_sum);
    Self { vote_sum, score, confidence: classify(score, prior) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn score_without_votes_is_one() {
    assert_eq!(consensus_score(0), 1.0);
  }

  #[test]
  fn score_is_floored_at_zero() {
    assert_eq!(consensus_score(-10), 0.0);
    assert_eq!(consensus_score(-25), 0.0);
  }

  #[test]
  fn five_agreements_verify() {
    let t = Tally::recompute(5, Confidence::Unverified);
    assert_eq!(t.score, 1.5);
    assert_eq!(t.confidence, Confidence::Verified);
  }

  #[test]
  fn five_disagreements_dispute() {
    let t = Tally::recompute(-5, Confidence::Unverified);
    assert_eq!(t.score, 0.5);
    assert_eq!(t.confidence, Confidence::Disputed);
  }

  #[test]
  fn neutral_band_keeps_prior_classification() {
    assert_eq!(classify(1.0, Confidence::Verified), Confidence::Verified);
    assert_eq!(classify(1.4, Confidence::Disputed), Confidence::Disputed);
    assert_eq!(classify(0.6, Confidence::Unverified), Confidence::Unverified);
  }

  #[test]
  fn vote_value_rejects_out_of_range() {
    assert!(matches!(VoteValue::try_from(2), Err(Error::InvalidVoteValue(2))));
    assert!(matches!(
      VoteValue::try_from(-7),
      Err(Error::InvalidVoteValue(-7))
    ));
    assert_eq!(VoteValue::try_from(-1).unwrap(), VoteValue::Disagree);
  }

  #[test]
  fn vote_value_serialises_as_integer() {
    assert_eq!(serde_json::to_string(&VoteValue::Agree).unwrap(), "1");
    let v: VoteValue = serde_json::from_str("-1").unwrap();
    assert_eq!(v, VoteValue::Disagree);
    assert!(serde_json::from_str::<VoteValue>("3").is_err());
  }
}
