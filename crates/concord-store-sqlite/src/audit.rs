//! [`SyncAuditLog`] for [`SqliteStore`].
//!
//! Rows are only ever inserted as `running` and closed once; no statement
//! touches a row whose status is already terminal.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior, types::Value};
use tracing::{info, warn};

use concord_core::{
  Error as CoreError,
  audit::{NewSyncLogEntry, ORPHANED_DETAILS, SyncCompletion, SyncLogEntry, SyncStatus},
  store::SyncAuditLog,
};

use crate::{
  Result, SqliteStore,
  encode::{RawSyncLog, SYNC_LOG_COLUMNS, encode_dt, encode_u64, now},
  error::abort,
};

impl SqliteStore {
  async fn select_log(&self, tail: &'static str, params: Vec<Value>) -> Result<Vec<SyncLogEntry>> {
    let raws: Vec<RawSyncLog> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!("SELECT {SYNC_LOG_COLUMNS} FROM sync_log {tail}"))?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawSyncLog::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSyncLog::into_entry).collect()
  }
}

impl SyncAuditLog for SqliteStore {
  async fn begin(&self, entry: NewSyncLogEntry) -> concord_core::Result<SyncLogEntry> {
    let started_at = now();
    let at_str = encode_dt(started_at);
    let NewSyncLogEntry { node_id, sync_type, entity_type } = entry;
    let row = (node_id.clone(), sync_type.clone(), entity_type.clone());

    let id = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO sync_log (node_id, sync_type, entity_type, entity_count, started_at, status)
           VALUES (?1, ?2, ?3, 0, ?4, 'running')",
          rusqlite::params![row.0, row.1, row.2, at_str],
        )?;
        Ok(conn.last_insert_rowid())
      })
      .await
      .map_err(crate::Error::from)?;

    info!(id, %node_id, %sync_type, "sync round started");
    Ok(SyncLogEntry {
      id,
      node_id,
      sync_type,
      entity_type,
      entity_count: 0,
      started_at,
      completed_at: None,
      status: SyncStatus::Running,
      details: None,
    })
  }

  async fn complete(
    &self,
    id: i64,
    completion: SyncCompletion,
  ) -> concord_core::Result<SyncLogEntry> {
    if !completion.status.is_terminal() {
      return Err(CoreError::UnknownVariant {
        kind:  "terminal sync status",
        value: completion.status.to_string(),
      });
    }
    let at_str = encode_dt(now());
    let count = encode_u64(completion.entity_count, "sync_log.entity_count")?;
    let status_str = completion.status.as_ref().to_owned();
    let details = completion.details;

    let raw: RawSyncLog = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let status: Option<String> = tx
          .query_row(
            "SELECT status FROM sync_log WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
          )
          .optional()?;
        match status.as_deref() {
          None => return Err(abort(CoreError::AuditEntryNotFound(id))),
          Some("running") => {}
          Some(_) => return Err(abort(CoreError::AuditEntryClosed(id))),
        }
        tx.execute(
          "UPDATE sync_log
             SET completed_at = ?2, status = ?3, entity_count = ?4, details = ?5
           WHERE id = ?1 AND status = 'running'",
          rusqlite::params![id, at_str, status_str, count, details],
        )?;
        let raw = tx.query_row(
          &format!("SELECT {SYNC_LOG_COLUMNS} FROM sync_log WHERE id = ?1"),
          rusqlite::params![id],
          RawSyncLog::from_row,
        )?;
        tx.commit()?;
        Ok(raw)
      })
      .await
      .map_err(crate::Error::from)?;

    let entry = raw.into_entry()?;
    info!(
      id,
      status = %entry.status,
      entity_count = entry.entity_count,
      "sync round closed"
    );
    Ok(entry)
  }

  async fn get_entry(&self, id: i64) -> concord_core::Result<Option<SyncLogEntry>> {
    let raw: Option<RawSyncLog> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {SYNC_LOG_COLUMNS} FROM sync_log WHERE id = ?1"),
              rusqlite::params![id],
              RawSyncLog::from_row,
            )
            .optional()?,
        )
      })
      .await
      .map_err(crate::Error::from)?;

    Ok(raw.map(RawSyncLog::into_entry).transpose()?)
  }

  async fn recent(&self, limit: usize) -> concord_core::Result<Vec<SyncLogEntry>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    Ok(
      self
        .select_log("ORDER BY id DESC LIMIT ?1", vec![Value::Integer(limit)])
        .await?,
    )
  }

  async fn last_success(&self, node_id: &str) -> concord_core::Result<Option<SyncLogEntry>> {
    let mut rows = self
      .select_log(
        "WHERE node_id = ?1 AND status = 'success' ORDER BY id DESC LIMIT 1",
        vec![Value::Text(node_id.to_owned())],
      )
      .await?;
    Ok(rows.pop())
  }

  async fn recover_orphans(
    &self,
    older_than: DateTime<Utc>,
  ) -> concord_core::Result<Vec<SyncLogEntry>> {
    let cutoff_str = encode_dt(older_than);
    let at_str = encode_dt(now());

    let raws: Vec<RawSyncLog> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = {
          let mut stmt = tx.prepare(&format!(
            "UPDATE sync_log
               SET status = 'failed', completed_at = ?2, details = ?3
             WHERE status = 'running' AND started_at < ?1
             RETURNING {SYNC_LOG_COLUMNS}"
          ))?;
          stmt
            .query_map(
              rusqlite::params![cutoff_str, at_str, ORPHANED_DETAILS],
              RawSyncLog::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        Ok(rows)
      })
      .await
      .map_err(crate::Error::from)?;

    let mut entries = raws
      .into_iter()
      .map(RawSyncLog::into_entry)
      .collect::<Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.id);
    for entry in &entries {
      warn!(
        error = %CoreError::OrphanedRound(entry.id),
        node_id = %entry.node_id,
        "recovered orphaned sync round"
      );
    }
    Ok(entries)
  }
}
