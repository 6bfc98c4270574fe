//! Background tasks: heartbeats, the liveness sweep and periodic sync.

use std::time::Duration;

use chrono::Utc;
use concord_core::{Error as CoreError, cluster::LivenessPolicy, store::ClusterRegistry};
use tokio::{
  task::{JoinHandle, JoinSet},
  time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{Node, Result};

/// One liveness pass: announce this node to every active peer, then mark
/// peers that have been silent past the policy's timeout inactive. Returns
/// the ids deactivated by this pass.
pub async fn tick(node: &Node, policy: &LivenessPolicy) -> Result<Vec<String>> {
  let local = node.config.registration();
  let store = node.sync.store();

  store.heartbeat(&local.node_id).await?;

  let mut announces = JoinSet::new();
  for peer in store.list_nodes().await? {
    if !peer.is_active || peer.node_id == local.node_id {
      continue;
    }
    let transport = node.transport.clone();
    let local = local.clone();
    announces.spawn(async move {
      let res = transport.announce(&peer.node_address, &local).await;
      (peer.node_id, res)
    });
  }
  while let Some(joined) = announces.join_next().await {
    match joined {
      Ok((peer, Ok(_))) => debug!(%peer, "heartbeat delivered"),
      Ok((peer, Err(e))) => debug!(%peer, error = %e, "heartbeat not delivered"),
      Err(e) => warn!(error = %e, "heartbeat task failed"),
    }
  }

  let dead = store
    .mark_stale_inactive(policy.cutoff(Utc::now()), &local.node_id)
    .await?;
  Ok(dead)
}

/// Run [`tick`] every heartbeat interval until the task is aborted.
pub fn spawn_liveness(node: Node, policy: LivenessPolicy) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(policy.heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
      interval = ?policy.heartbeat_interval,
      timeout = ?policy.timeout(),
      "liveness sweeper started"
    );
    loop {
      interval.tick().await;
      if let Err(e) = tick(&node, &policy).await {
        warn!(error = %e, "liveness pass failed");
      }
    }
  })
}

/// Start a sync round every `every`. Skips a tick while a round is running.
pub fn spawn_periodic_sync(node: Node, every: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; give the node a moment to join.
    interval.tick().await;
    loop {
      interval.tick().await;
      match node.sync.run_round(node.sync.local_node_id()).await {
        Ok(outcome) => debug!(status = %outcome.status, "periodic sync round"),
        Err(CoreError::RoundInProgress) => debug!("round already running; tick skipped"),
        Err(e) => warn!(error = %e, "periodic sync round could not run"),
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use concord_core::cluster::NodeRegistration;
  use concord_store_sqlite::SqliteStore;

  use super::*;
  use crate::ServerConfig;

  #[tokio::test]
  async fn silent_peers_are_deactivated_but_self_is_kept() {
    let settings = config::Config::builder()
      .add_source(config::File::from_str(
        "[node]\nnode_id = \"me\"\n[sync]\npeer_timeout_ms = 200\n",
        config::FileFormat::Toml,
      ))
      .build()
      .unwrap();
    let cfg: ServerConfig = settings.try_deserialize().unwrap();
    let store = SqliteStore::open_in_memory().await.unwrap();
    let node = Node::start(store, cfg).await.unwrap();

    // Nothing listens on the discard port, so the heartbeat is not delivered.
    node
      .sync
      .store()
      .register_node(NodeRegistration::new("ghost", "ghost", "http://127.0.0.1:9"))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let policy = LivenessPolicy {
      heartbeat_interval: Duration::from_millis(5),
      missed_heartbeats:  2,
    };
    let dead = tick(&node, &policy).await.unwrap();
    assert_eq!(dead, vec!["ghost".to_string()]);

    let store = node.sync.store();
    assert!(!store.get_node("ghost").await.unwrap().unwrap().is_active);
    assert!(store.get_node("me").await.unwrap().unwrap().is_active);
    assert!(store.list_voters().await.unwrap().iter().all(|n| n.node_id == "me"));
  }
}
