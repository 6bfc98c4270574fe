//! How a coordinator reaches its peers.

use std::{future::Future, sync::Arc, time::Duration};

use reqwest::Client;
use tracing::debug;

use concord_core::cluster::{ClusterNode, NodeRegistration};

use crate::{
  Error, Result,
  payload::{ExchangeRequest, SyncPayload},
};

/// An exchange target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
  pub node_id: String,
  /// Base URL, e.g. `http://10.0.0.2:7400`.
  pub address: String,
}

impl From<&ClusterNode> for Peer {
  fn from(node: &ClusterNode) -> Self {
    Self { node_id: node.node_id.clone(), address: node.node_address.clone() }
  }
}

/// Sends one exchange request to one peer and returns the peer's deltas.
///
/// The coordinator applies its own per-peer timeout around each call.
pub trait PeerTransport: Send + Sync + 'static {
  fn exchange(
    &self,
    peer: Peer,
    request: Arc<ExchangeRequest>,
  ) -> impl Future<Output = Result<SyncPayload>> + Send + '_;
}

/// JSON over HTTP against the `/api` routes of each peer.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
}

impl HttpTransport {
  /// `timeout` bounds every request at the HTTP layer as well.
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self { client })
  }

  fn url(address: &str, path: &str) -> String {
    format!("{}/api{}", address.trim_end_matches('/'), path)
  }

  async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if !status.is_success() {
      let body = resp.text().await.unwrap_or_default();
      return Err(Error::Status { status: status.as_u16(), body });
    }
    Ok(resp)
  }

  /// `POST {address}/api/cluster/nodes`: register or refresh `local` on a
  /// remote node. Used both to join and as a liveness heartbeat.
  pub async fn announce(&self, address: &str, local: &NodeRegistration) -> Result<ClusterNode> {
    let resp = self
      .client
      .post(Self::url(address, "/cluster/nodes"))
      .json(local)
      .send()
      .await?;
    Ok(Self::check(resp).await?.json().await?)
  }

  /// `GET {address}/api/cluster/nodes`
  pub async fn members(&self, address: &str) -> Result<Vec<ClusterNode>> {
    let resp = self
      .client
      .get(Self::url(address, "/cluster/nodes"))
      .send()
      .await?;
    Ok(Self::check(resp).await?.json().await?)
  }
}

impl PeerTransport for HttpTransport {
  async fn exchange(&self, peer: Peer, request: Arc<ExchangeRequest>) -> Result<SyncPayload> {
    let url = Self::url(&peer.address, "/sync/exchange");
    debug!(peer = %peer.node_id, %url, "sending exchange");

    let resp = self.client.post(&url).json(&*request).send().await?;
    Ok(Self::check(resp).await?.json().await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn urls_tolerate_trailing_slash() {
    assert_eq!(
      HttpTransport::url("http://10.0.0.2:7400/", "/sync/exchange"),
      "http://10.0.0.2:7400/api/sync/exchange"
    );
    assert_eq!(
      HttpTransport::url("http://hub", "/cluster/nodes"),
      "http://hub/api/cluster/nodes"
    );
  }
}
