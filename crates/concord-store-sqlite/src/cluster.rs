//! [`ClusterRegistry`] for [`SqliteStore`].

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use tracing::{debug, info};

use concord_core::{
  Error as CoreError,
  cluster::{ClusterNode, NodeRegistration, RaftRole},
  store::ClusterRegistry,
};

use crate::{
  Result, SqliteStore,
  encode::{NODE_COLUMNS, RawNode, encode_dt, encode_meta, now},
  error::abort,
};

impl SqliteStore {
  async fn select_nodes(&self, where_clause: &'static str) -> Result<Vec<ClusterNode>> {
    let raws: Vec<RawNode> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {NODE_COLUMNS} FROM cluster_nodes {where_clause} ORDER BY node_id"
        ))?;
        let rows = stmt
          .query_map([], RawNode::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawNode::into_node).collect()
  }

  /// Run `update` (binding `?1 = node_id`, `?2 = value`) and return the row
  /// afterwards, or [`CoreError::NodeNotFound`] if no row matched.
  async fn update_node(
    &self,
    node_id: &str,
    update: &'static str,
    value: Option<String>,
  ) -> Result<ClusterNode> {
    let node_id = node_id.to_owned();
    let raw: RawNode = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(update, rusqlite::params![node_id, value])?;
        if changed == 0 {
          return Err(abort(CoreError::NodeNotFound(node_id)));
        }
        let raw = tx.query_row(
          &format!("SELECT {NODE_COLUMNS} FROM cluster_nodes WHERE node_id = ?1"),
          rusqlite::params![node_id],
          RawNode::from_row,
        )?;
        tx.commit()?;
        Ok(raw)
      })
      .await?;

    raw.into_node()
  }
}

impl ClusterRegistry for SqliteStore {
  async fn register_node(
    &self,
    registration: NodeRegistration,
  ) -> concord_core::Result<ClusterNode> {
    let at_str = encode_dt(now());
    let meta_str = encode_meta(&registration.meta)?;
    let node_id = registration.node_id.clone();

    // `joined_at` is kept from the first registration.
    let raw: RawNode = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO cluster_nodes
             (node_id, node_name, node_address, node_region, is_active, is_voter,
              joined_at, last_seen_at, meta)
           VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6, ?7)
           ON CONFLICT(node_id) DO UPDATE SET
             node_name    = excluded.node_name,
             node_address = excluded.node_address,
             node_region  = excluded.node_region,
             is_active    = 1,
             is_voter     = excluded.is_voter,
             last_seen_at = excluded.last_seen_at,
             meta         = excluded.meta",
          rusqlite::params![
            registration.node_id,
            registration.node_name,
            registration.node_address,
            registration.node_region,
            registration.is_voter,
            at_str,
            meta_str,
          ],
        )?;
        let raw = tx.query_row(
          &format!("SELECT {NODE_COLUMNS} FROM cluster_nodes WHERE node_id = ?1"),
          rusqlite::params![registration.node_id],
          RawNode::from_row,
        )?;
        tx.commit()?;
        Ok(raw)
      })
      .await
      .map_err(crate::Error::from)?;

    info!(%node_id, "node registered");
    Ok(raw.into_node()?)
  }

  async fn heartbeat(&self, node_id: &str) -> concord_core::Result<ClusterNode> {
    let node = self
      .update_node(
        node_id,
        "UPDATE cluster_nodes SET last_seen_at = ?2, is_active = 1 WHERE node_id = ?1",
        Some(encode_dt(now())),
      )
      .await?;
    debug!(node_id, "heartbeat");
    Ok(node)
  }

  async fn get_node(&self, node_id: &str) -> concord_core::Result<Option<ClusterNode>> {
    let node_id = node_id.to_owned();
    let raw: Option<RawNode> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              &format!("SELECT {NODE_COLUMNS} FROM cluster_nodes WHERE node_id = ?1"),
              rusqlite::params![node_id],
              RawNode::from_row,
            )
            .optional()?,
        )
      })
      .await
      .map_err(crate::Error::from)?;

    Ok(raw.map(RawNode::into_node).transpose()?)
  }

  async fn list_nodes(&self) -> concord_core::Result<Vec<ClusterNode>> {
    Ok(self.select_nodes("").await?)
  }

  async fn list_voters(&self) -> concord_core::Result<Vec<ClusterNode>> {
    Ok(self.select_nodes("WHERE is_active = 1 AND is_voter = 1").await?)
  }

  async fn mark_inactive(&self, node_id: &str) -> concord_core::Result<()> {
    let id = node_id.to_owned();
    self
      .conn
      .call(move |conn| {
        let changed = conn.execute(
          "UPDATE cluster_nodes SET is_active = 0 WHERE node_id = ?1",
          rusqlite::params![id],
        )?;
        if changed == 0 {
          return Err(abort(CoreError::NodeNotFound(id)));
        }
        Ok(())
      })
      .await
      .map_err(crate::Error::from)?;
    info!(node_id, "node marked inactive");
    Ok(())
  }

  async fn mark_stale_inactive(
    &self,
    cutoff: DateTime<Utc>,
    keep: &str,
  ) -> concord_core::Result<Vec<String>> {
    let cutoff_str = encode_dt(cutoff);
    let keep = keep.to_owned();

    let ids: Vec<String> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let ids = {
          let mut stmt = tx.prepare(
            "UPDATE cluster_nodes SET is_active = 0
             WHERE is_active = 1 AND last_seen_at < ?1 AND node_id != ?2
             RETURNING node_id",
          )?;
          stmt
            .query_map(rusqlite::params![cutoff_str, keep], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?
        };
        tx.commit()?;
        Ok(ids)
      })
      .await
      .map_err(crate::Error::from)?;

    for id in &ids {
      info!(node_id = %id, "node missed its heartbeats; marked inactive");
    }
    Ok(ids)
  }

  async fn set_role(
    &self,
    node_id: &str,
    role: Option<RaftRole>,
  ) -> concord_core::Result<ClusterNode> {
    let node = self
      .update_node(
        node_id,
        "UPDATE cluster_nodes SET raft_role = ?2 WHERE node_id = ?1",
        role.map(|r| r.as_ref().to_owned()),
      )
      .await?;
    debug!(node_id, role = ?role, "role label updated");
    Ok(node)
  }

  async fn leader(&self) -> concord_core::Result<Option<ClusterNode>> {
    let mut leaders = self
      .select_nodes("WHERE is_active = 1 AND raft_role = 'leader'")
      .await?;
    // An election in progress can briefly leave two labels; report the most
    // recently seen one.
    leaders.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
    Ok(leaders.into_iter().next())
  }
}
