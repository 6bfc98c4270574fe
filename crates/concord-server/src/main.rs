//! Concord node binary.
//!
//! Reads `concord.toml` (or the path given with `--config`), layers
//! `CONCORD_*` environment variables on top, opens the SQLite store and
//! serves the JSON API over HTTP until interrupted.
//!
//! Nested keys use a double underscore in the environment:
//!
//! ```text
//! CONCORD_NODE__NODE_ID=edge-2 CONCORD_SYNC__HUB_ADDRESS=http://hub:7400 concord
//! ```

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::Context as _;
use clap::Parser;
use concord_server::{
  Node, ServerConfig,
  liveness::{spawn_liveness, spawn_periodic_sync},
};
use concord_store_sqlite::SqliteStore;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Concord distributed fact store node")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "concord.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(
      config::Environment::with_prefix("CONCORD")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true),
    )
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  let store_path = expand_tilde(&server_cfg.store_path);
  if let Some(parent) = store_path.parent() {
    std::fs::create_dir_all(parent)
      .with_context(|| format!("failed to create {parent:?}"))?;
  }
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  let address = format!("{}:{}", server_cfg.host, server_cfg.port);
  let liveness = server_cfg.liveness.policy();
  let interval = server_cfg.sync.interval_secs.map(Duration::from_secs);

  let node = Node::start(store, server_cfg)
    .await
    .context("failed to start node")?;
  node.join().await;

  let mut tasks = vec![spawn_liveness(node.clone(), liveness)];
  if let Some(every) = interval {
    tasks.push(spawn_periodic_sync(node.clone(), every));
  }

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, node.router())
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  for task in tasks {
    task.abort();
  }
  node.shutdown().await.context("failed to close store")?;
  tracing::info!("stopped");

  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::warn!(error = %e, "could not listen for ctrl-c");
    std::future::pending::<()>().await;
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
