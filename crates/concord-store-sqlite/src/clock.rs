//! [`ClockTracker`] for [`SqliteStore`].

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior};
use tracing::{debug, error};

use concord_core::{
  Error as CoreError,
  clock::{EntityKey, VectorClockEntry},
  store::ClockTracker,
};

use crate::{
  Result, SqliteStore,
  encode::{CLOCK_COLUMNS, RawClock, encode_dt, encode_u64, now},
  error::abort,
};

fn regression(entry: &VectorClockEntry, stored: u64) -> CoreError {
  CoreError::ClockRegression {
    node_id: entry.node_id.clone(),
    entity_type: entry.entity_type.clone(),
    entity_id: entry.entity_id.clone(),
    stored,
    attempted: entry.version,
  }
}

/// Advance `node_id`'s row for `entity` inside the caller's transaction.
pub(crate) fn bump_in(
  conn: &rusqlite::Connection,
  node_id: &str,
  entity: &EntityKey,
  ts_str: &str,
) -> rusqlite::Result<RawClock> {
  conn.execute(
    "INSERT INTO vector_clocks (node_id, entity_type, entity_id, version, timestamp, touched_at)
     VALUES (?1, ?2, ?3, 1, ?4, ?4)
     ON CONFLICT(node_id, entity_type, entity_id) DO UPDATE
       SET version    = vector_clocks.version + 1,
           timestamp  = excluded.timestamp,
           touched_at = excluded.touched_at",
    rusqlite::params![node_id, entity.entity_type, entity.entity_id, ts_str],
  )?;
  conn.query_row(
    &format!(
      "SELECT {CLOCK_COLUMNS} FROM vector_clocks
       WHERE node_id = ?1 AND entity_type = ?2 AND entity_id = ?3"
    ),
    rusqlite::params![node_id, entity.entity_type, entity.entity_id],
    RawClock::from_row,
  )
}

impl ClockTracker for SqliteStore {
  async fn bump(&self, node_id: &str, entity: &EntityKey) -> concord_core::Result<VectorClockEntry> {
    let node_id = node_id.to_owned();
    let entity = entity.clone();
    let ts_str = encode_dt(now());

    let raw: RawClock = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = bump_in(&tx, &node_id, &entity, &ts_str)?;
        tx.commit()?;
        Ok(raw)
      })
      .await
      .map_err(crate::Error::from)?;

    let entry = raw.into_entry()?;
    debug!(
      node_id = %entry.node_id,
      entity = %entry.key(),
      version = entry.version,
      "clock bumped"
    );
    Ok(entry)
  }

  async fn merge(&self, remote: VectorClockEntry) -> concord_core::Result<VectorClockEntry> {
    let remote_version = encode_u64(remote.version, "vector_clocks.version")?;
    let touched_str = encode_dt(now());

    let stored: RawClock = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let select = format!(
          "SELECT {CLOCK_COLUMNS} FROM vector_clocks
           WHERE node_id = ?1 AND entity_type = ?2 AND entity_id = ?3"
        );
        let local: Option<RawClock> = tx
          .query_row(
            &select,
            rusqlite::params![remote.node_id, remote.entity_type, remote.entity_id],
            RawClock::from_row,
          )
          .optional()?;

        match local {
          None => {
            tx.execute(
              "INSERT INTO vector_clocks
                 (node_id, entity_type, entity_id, version, timestamp, touched_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
              rusqlite::params![
                remote.node_id,
                remote.entity_type,
                remote.entity_id,
                remote_version,
                encode_dt(remote.timestamp),
                touched_str,
              ],
            )?;
          }
          Some(local) => {
            let local = local.into_entry().map_err(|e| abort(e.into()))?;
            let merged = local.merged_with(&remote);
            if merged.version < local.version {
              return Err(abort(regression(&merged, local.version)));
            }
            if merged != local {
              // The version guard makes the database itself refuse a
              // lowering write; zero affected rows means the invariant
              // would have been broken.
              let changed = tx.execute(
                "UPDATE vector_clocks SET version = ?4, timestamp = ?5, touched_at = ?6
                 WHERE node_id = ?1 AND entity_type = ?2 AND entity_id = ?3
                   AND version <= ?4",
                rusqlite::params![
                  merged.node_id,
                  merged.entity_type,
                  merged.entity_id,
                  remote_version,
                  encode_dt(merged.timestamp),
                  touched_str,
                ],
              )?;
              if changed != 1 {
                return Err(abort(regression(&merged, local.version)));
              }
            }
          }
        }

        let stored = tx.query_row(
          &select,
          rusqlite::params![remote.node_id, remote.entity_type, remote.entity_id],
          RawClock::from_row,
        )?;
        tx.commit()?;
        Ok(stored)
      })
      .await
      .map_err(|e| {
        let e = crate::Error::from(e);
        if let crate::Error::Core(CoreError::ClockRegression { .. }) = &e {
          error!(error = %e, "rejected clock merge");
        }
        e
      })?;

    Ok(stored.into_entry()?)
  }

  async fn entries_for(&self, entity: &EntityKey) -> concord_core::Result<Vec<VectorClockEntry>> {
    let entity = entity.clone();
    let raws: Vec<RawClock> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {CLOCK_COLUMNS} FROM vector_clocks
           WHERE entity_type = ?1 AND entity_id = ?2
           ORDER BY node_id"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![entity.entity_type, entity.entity_id],
            RawClock::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await
      .map_err(crate::Error::from)?;

    Ok(raws.into_iter().map(RawClock::into_entry).collect::<Result<_>>()?)
  }

  async fn changed_since(
    &self,
    since: Option<DateTime<Utc>>,
  ) -> concord_core::Result<Vec<EntityKey>> {
    let since_str = since.map(encode_dt);
    let keys: Vec<(String, String)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT DISTINCT entity_type, entity_id FROM vector_clocks
           WHERE ?1 IS NULL OR touched_at > ?1
           ORDER BY entity_type, entity_id",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![since_str], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await
      .map_err(crate::Error::from)?;

    Ok(keys.into_iter().map(|(t, id)| EntityKey::new(t, id)).collect())
  }
}
