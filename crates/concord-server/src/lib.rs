//! A Concord node: configuration, startup wiring and the HTTP router.
//!
//! The binary in `main.rs` loads a [`ServerConfig`], opens the SQLite store
//! and hands both to [`Node::start`]. Background liveness and periodic sync
//! tasks live in [`liveness`].

pub mod error;
pub mod liveness;

pub use error::{Error, Result};

use std::{path::PathBuf, sync::Arc, time::Duration};

use axum::{Router, routing::get};
use concord_core::{
  cluster::{LivenessPolicy, NodeRegistration},
  store::ClusterRegistry,
};
use concord_store_sqlite::SqliteStore;
use concord_sync::{CoordinatorConfig, HttpTransport, SyncCoordinator};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `concord.toml` and
/// `CONCORD_*` environment variables. Every field has a default.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:       String,
  #[serde(default = "default_port")]
  pub port:       u16,
  #[serde(default = "default_store_path")]
  pub store_path: PathBuf,
  #[serde(default)]
  pub node:       NodeConfig,
  #[serde(default)]
  pub sync:       SyncConfig,
  #[serde(default)]
  pub liveness:   LivenessConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
  #[serde(default = "default_node_id")]
  pub node_id:           String,
  /// Defaults to `node_id`.
  pub node_name:         Option<String>,
  /// Base URL peers use to reach this node. Defaults to `http://host:port`.
  pub advertise_address: Option<String>,
  pub region:            Option<String>,
  #[serde(default = "default_true")]
  pub is_voter:          bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
  #[serde(default = "default_peer_timeout_ms")]
  pub peer_timeout_ms:     u64,
  /// `running` rounds older than this are failed at startup.
  #[serde(default = "default_orphan_timeout_secs")]
  pub orphan_timeout_secs: u64,
  /// Exchange only with this hub instead of every voter.
  pub hub_address:         Option<String>,
  /// Addresses contacted at startup to learn the membership.
  #[serde(default)]
  pub seeds:               Vec<String>,
  /// Run a round this often. Unset means rounds are only started via the API.
  pub interval_secs:       Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LivenessConfig {
  #[serde(default = "default_heartbeat_interval_secs")]
  pub heartbeat_interval_secs: u64,
  #[serde(default = "default_missed_heartbeats")]
  pub missed_heartbeats:       u32,
}

fn default_host() -> String { "127.0.0.1".to_owned() }
fn default_port() -> u16 { 7400 }
fn default_store_path() -> PathBuf { PathBuf::from("~/.local/share/concord/concord.db") }
fn default_node_id() -> String { "concord-1".to_owned() }
fn default_true() -> bool { true }
fn default_peer_timeout_ms() -> u64 { 5_000 }
fn default_orphan_timeout_secs() -> u64 { 300 }
fn default_heartbeat_interval_secs() -> u64 { 10 }
fn default_missed_heartbeats() -> u32 { 3 }

impl Default for NodeConfig {
  fn default() -> Self {
    Self {
      node_id:           default_node_id(),
      node_name:         None,
      advertise_address: None,
      region:            None,
      is_voter:          true,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      peer_timeout_ms:     default_peer_timeout_ms(),
      orphan_timeout_secs: default_orphan_timeout_secs(),
      hub_address:         None,
      seeds:               Vec::new(),
      interval_secs:       None,
    }
  }
}

impl Default for LivenessConfig {
  fn default() -> Self {
    Self {
      heartbeat_interval_secs: default_heartbeat_interval_secs(),
      missed_heartbeats:       default_missed_heartbeats(),
    }
  }
}

impl LivenessConfig {
  pub fn policy(&self) -> LivenessPolicy {
    LivenessPolicy {
      heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
      missed_heartbeats:  self.missed_heartbeats,
    }
  }
}

impl ServerConfig {
  pub fn advertise_address(&self) -> String {
    self
      .node
      .advertise_address
      .clone()
      .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
  }

  /// How this node describes itself to the registry and to peers.
  pub fn registration(&self) -> NodeRegistration {
    let mut reg = NodeRegistration::new(
      self.node.node_id.clone(),
      self.node.node_name.clone().unwrap_or_else(|| self.node.node_id.clone()),
      self.advertise_address(),
    );
    reg.node_region = self.node.region.clone();
    reg.is_voter = self.node.is_voter;
    reg
  }

  pub fn coordinator_config(&self) -> CoordinatorConfig {
    let mut cfg = CoordinatorConfig::new(self.registration());
    cfg.peer_timeout = Duration::from_millis(self.sync.peer_timeout_ms);
    cfg.hub_address = self.sync.hub_address.clone();
    cfg
  }
}

// ─── Node ─────────────────────────────────────────────────────────────────────

pub type Coordinator = SyncCoordinator<SqliteStore, HttpTransport>;

/// A running node's shared handles.
#[derive(Clone)]
pub struct Node {
  pub sync:      Coordinator,
  pub transport: Arc<HttpTransport>,
  pub config:    Arc<ServerConfig>,
}

impl Node {
  /// Wire a node around an opened store: register this node in its own
  /// registry and fail any round a previous process left `running`.
  pub async fn start(store: SqliteStore, config: ServerConfig) -> Result<Self> {
    let transport = Arc::new(HttpTransport::new(Duration::from_millis(
      config.sync.peer_timeout_ms,
    ))?);
    let sync = SyncCoordinator::new(
      Arc::new(store),
      Arc::clone(&transport),
      config.coordinator_config(),
    );

    sync.store().register_node(config.registration()).await?;
    let recovered = sync
      .recover_orphans(Duration::from_secs(config.sync.orphan_timeout_secs))
      .await?;
    if !recovered.is_empty() {
      warn!(count = recovered.len(), "failed orphaned sync rounds from a previous run");
    }

    info!(
      node_id = %config.node.node_id,
      address = %config.advertise_address(),
      hub = config.sync.hub_address.as_deref().unwrap_or("-"),
      "node started"
    );
    Ok(Self { sync, transport, config: Arc::new(config) })
  }

  /// Announce this node to every seed and register the members they know.
  /// Unreachable seeds are logged and skipped. Returns how many remote nodes
  /// were learned.
  pub async fn join(&self) -> usize {
    let local = self.config.registration();
    let mut learned = 0;
    for seed in &self.config.sync.seeds {
      if let Err(e) = self.transport.announce(seed, &local).await {
        warn!(%seed, error = %e, "seed unreachable");
        continue;
      }
      let members = match self.transport.members(seed).await {
        Ok(members) => members,
        Err(e) => {
          warn!(%seed, error = %e, "could not list seed members");
          continue;
        }
      };
      for member in members.iter().filter(|m| m.node_id != local.node_id) {
        match self.sync.store().register_node(member.into()).await {
          Ok(_) => learned += 1,
          Err(e) => warn!(node_id = %member.node_id, error = %e, "could not register member"),
        }
      }
    }
    if learned > 0 {
      info!(learned, "joined cluster");
    }
    learned
  }

  /// The full HTTP surface: the JSON API under `/api` plus `/health`.
  pub fn router(&self) -> Router {
    let caps = self.sync.store().capabilities();
    let capabilities = json!({ "vector_search": caps.vector_search });
    Router::new()
      .nest("/api", concord_api::api_router(self.sync.clone(), capabilities))
      .route("/health", get(|| async { "ok" }))
      .layer(TraceLayer::new_for_http())
  }

  /// Close the store, flushing the WAL.
  pub async fn shutdown(self) -> Result<()> {
    let store = self.sync.store().as_ref().clone();
    drop(self);
    store.close().await?;
    Ok(())
  }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;

  use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
  };
  use concord_core::{
    audit::{NewSyncLogEntry, SyncStatus},
    store::SyncAuditLog,
  };
  use tower::ServiceExt as _;

  fn test_config() -> ServerConfig {
    let settings = config::Config::builder()
      .add_source(config::File::from_str(
        r#"
          port = 7411
          [node]
          node_id = "n1"
          region = "eu-west"
          [sync]
          orphan_timeout_secs = 0
          peer_timeout_ms = 200
        "#,
        config::FileFormat::Toml,
      ))
      .build()
      .unwrap();
    settings.try_deserialize().unwrap()
  }

  #[test]
  fn empty_config_uses_defaults() {
    let settings = config::Config::builder().build().unwrap();
    let cfg: ServerConfig = settings.try_deserialize().unwrap();
    assert_eq!(cfg.port, 7400);
    assert_eq!(cfg.node.node_id, "concord-1");
    assert!(cfg.node.is_voter);
    assert_eq!(cfg.liveness.policy().timeout(), Duration::from_secs(30));
    assert!(cfg.sync.hub_address.is_none());
  }

  #[test]
  fn registration_derives_from_config() {
    let cfg = test_config();
    let reg = cfg.registration();
    assert_eq!(reg.node_id, "n1");
    assert_eq!(reg.node_name, "n1");
    assert_eq!(reg.node_address, "http://127.0.0.1:7411");
    assert_eq!(reg.node_region.as_deref(), Some("eu-west"));
    assert_eq!(cfg.coordinator_config().peer_timeout, Duration::from_millis(200));
  }

  #[tokio::test]
  async fn start_registers_self_and_fails_orphans() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    store
      .begin(NewSyncLogEntry {
        node_id:     "n1".into(),
        sync_type:   "peer".into(),
        entity_type: "all".into(),
      })
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let node = Node::start(store, test_config()).await.unwrap();
    let me = node.sync.store().get_node("n1").await.unwrap().unwrap();
    assert!(me.is_active && me.is_voter);

    let log = node.sync.store().recent(10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, SyncStatus::Failed);
    assert!(log[0].details.as_deref().unwrap().contains("orphaned"));
  }

  #[tokio::test]
  async fn router_serves_health_and_nested_api() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let node = Node::start(store, test_config()).await.unwrap();

    let resp = node
      .router()
      .oneshot(Request::get("/health").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = node
      .router()
      .oneshot(Request::get("/api/cluster/nodes").body(Body::empty()).unwrap())
      .await
      .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let nodes: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(nodes[0]["node_id"], "n1");
  }
}
