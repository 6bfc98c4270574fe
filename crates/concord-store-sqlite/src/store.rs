//! [`SqliteStore`]: the connection handle shared by every component, plus
//! the [`FactStore`] implementation.

use std::path::Path;

use rusqlite::{OptionalExtension as _, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use concord_core::{
  Error as CoreError,
  clock::EntityKey,
  fact::{Confidence, Fact, NewFact, fact_id_range},
  store::FactStore,
};

use crate::{
  Result,
  clock::bump_in,
  encode::{FACT_COLUMNS, RawFact, encode_dt, now},
  error::abort,
  schema::{PRAGMAS, SCHEMA},
};

// ─── Capabilities ────────────────────────────────────────────────────────────

/// Optional SQLite features, checked once when the store is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
  /// A vector-search extension (`sqlite-vec`) is loaded.
  pub vector_search: bool,
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Concord store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted. Every
/// component trait is implemented on this one handle; hand clones of it to
/// whichever components need storage.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn: tokio_rusqlite::Connection,
  capabilities:    Capabilities,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open an in-memory store for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    let capabilities = conn
      .call(|conn| {
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA)?;
        let vector_search = conn
          .query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
          .is_ok();
        Ok(Capabilities { vector_search })
      })
      .await?;
    info!(vector_search = capabilities.vector_search, "sqlite store ready");
    Ok(Self { conn, capabilities })
  }

  /// Capability flags resolved at open time.
  pub fn capabilities(&self) -> Capabilities { self.capabilities }

  /// Close the underlying connection, flushing the WAL.
  pub async fn close(self) -> Result<()> {
    self.conn.close().await?;
    Ok(())
  }
}

// ─── FactStore impl ──────────────────────────────────────────────────────────

impl FactStore for SqliteStore {
  async fn record_fact(&self, origin_node: &str, input: NewFact) -> concord_core::Result<Fact> {
    let created_at = now();
    let at_str = encode_dt(created_at);
    let confidence_str = Confidence::default().as_ref().to_owned();
    let origin = origin_node.to_owned();
    let (content, fact_type) = (input.content.clone(), input.fact_type.clone());
    let ids = fact_id_range(origin_node);

    let fact_id = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let last: Option<i64> = tx.query_row(
          "SELECT MAX(fact_id) FROM facts WHERE fact_id BETWEEN ?1 AND ?2",
          rusqlite::params![*ids.start(), *ids.end()],
          |row| row.get(0),
        )?;
        let fact_id = match last {
          None => *ids.start(),
          Some(last) if last < *ids.end() => last + 1,
          Some(_) => return Err(abort(CoreError::FactIdsExhausted(origin))),
        };
        tx.execute(
          "INSERT INTO facts
             (fact_id, origin_node, content, fact_type, confidence, consensus_score,
              created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, 1.0, ?6, ?6)",
          rusqlite::params![fact_id, origin, content, fact_type, confidence_str, at_str],
        )?;
        bump_in(&tx, &origin, &EntityKey::fact(fact_id), &at_str)?;
        tx.commit()?;
        Ok(fact_id)
      })
      .await
      .map_err(crate::Error::from)?;

    debug!(fact_id, origin_node, fact_type = %input.fact_type, "recorded fact");
    Ok(Fact {
      fact_id,
      origin_node: origin_node.to_owned(),
      content: input.content,
      fact_type: input.fact_type,
      confidence: Confidence::default(),
      consensus_score: 1.0,
      created_at,
      updated_at: created_at,
    })
  }

  async fn import_fact(&self, fact: Fact) -> concord_core::Result<bool> {
    let created_str = encode_dt(fact.created_at);
    let updated_str = encode_dt(fact.updated_at);
    let confidence_str = fact.confidence.as_ref().to_owned();
    let row = fact.clone();

    let (inserted, existing): (bool, Option<RawFact>) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let n = tx.execute(
          "INSERT OR IGNORE INTO facts
             (fact_id, origin_node, content, fact_type, confidence, consensus_score,
              created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          rusqlite::params![
            row.fact_id,
            row.origin_node,
            row.content,
            row.fact_type,
            confidence_str,
            row.consensus_score,
            created_str,
            updated_str,
          ],
        )?;
        let existing = if n == 1 {
          None
        } else {
          tx.query_row(
            &format!("SELECT {FACT_COLUMNS} FROM facts WHERE fact_id = ?1"),
            rusqlite::params![row.fact_id],
            RawFact::from_row,
          )
          .optional()?
        };
        tx.commit()?;
        Ok((n == 1, existing))
      })
      .await
      .map_err(crate::Error::from)?;

    if let Some(existing) = existing {
      let existing = existing.into_fact()?;
      if !existing.same_assertion(&fact) {
        warn!(
          fact_id = fact.fact_id,
          stored_origin = %existing.origin_node,
          incoming_origin = %fact.origin_node,
          "fact id already holds a different assertion"
        );
        return Err(CoreError::FactConflict(fact.fact_id));
      }
    }
    Ok(inserted)
  }

  async fn get_fact(&self, fact_id: i64) -> concord_core::Result<Option<Fact>> {
    let raw: Option<RawFact> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {FACT_COLUMNS} FROM facts WHERE fact_id = ?1"),
              rusqlite::params![fact_id],
              RawFact::from_row,
            )
            .optional()?,
        )
      })
      .await
      .map_err(crate::Error::from)?;

    Ok(raw.map(RawFact::into_fact).transpose()?)
  }

  async fn list_facts(
    &self,
    fact_type: Option<&str>,
    limit: usize,
  ) -> concord_core::Result<Vec<Fact>> {
    let fact_type = fact_type.map(str::to_owned);
    let limit_val = i64::try_from(limit).unwrap_or(i64::MAX);

    let raws: Vec<RawFact> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {FACT_COLUMNS} FROM facts
           WHERE (?1 IS NULL OR fact_type = ?1)
           ORDER BY fact_id
           LIMIT ?2"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![fact_type, limit_val], RawFact::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await
      .map_err(crate::Error::from)?;

    Ok(raws.into_iter().map(RawFact::into_fact).collect::<Result<_>>()?)
  }
}
