//! The sync coordinator and its round state machine.
//!
//! A round moves `idle → collecting → exchanging → merging → recording →
//! idle`, or ends in `failed`. Every round owns exactly one audit entry,
//! opened when collecting starts and closed when recording ends. If the round
//! is cancelled, or its future is dropped, the entry is closed as `failed`
//! with details `"cancelled"`.

use std::{
  collections::{BTreeSet, HashMap},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};

use concord_core::{
  Error as CoreError,
  audit::{CANCELLED_DETAILS, NewSyncLogEntry, SyncCompletion, SyncLogEntry, SyncStatus},
  clock::{EntityKey, LastWriterWins, MergePolicy},
  cluster::NodeRegistration,
  fact::{Fact, NewFact},
  store::{ClockTracker, ClusterRegistry, ConsensusEngine, FactStore, SyncAuditLog},
};

use crate::{
  Error,
  cancel::CancellationToken,
  merge::apply_payload,
  payload::{ExchangeRequest, SyncPayload, collect_deltas},
  transport::{Peer, PeerTransport},
};

/// `entity_type` recorded on round audit entries; a round covers every type.
pub const ALL_ENTITIES: &str = "all";

/// Everything a coordinator needs from storage.
pub trait SyncBackend:
  FactStore + ConsensusEngine + ClockTracker + ClusterRegistry + SyncAuditLog + 'static
{
}

impl<T> SyncBackend for T where
  T: FactStore + ConsensusEngine + ClockTracker + ClusterRegistry + SyncAuditLog + 'static
{
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  strum::AsRefStr,
  strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncState {
  Idle,
  Collecting,
  Exchanging,
  Merging,
  Recording,
  /// The last round failed. Only a new round leaves this state.
  Failed,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
  /// This node, as announced to peers.
  pub local:        NodeRegistration,
  pub peer_timeout: Duration,
  /// When set, the hub at this address is the only exchange peer.
  pub hub_address:  Option<String>,
}

impl CoordinatorConfig {
  pub fn new(local: NodeRegistration) -> Self {
    Self { local, peer_timeout: Duration::from_secs(5), hub_address: None }
  }
}

/// Result of one round, as recorded in its audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
  pub log_id:       i64,
  pub status:       SyncStatus,
  pub entity_count: u64,
  pub details:      Option<String>,
}

/// Status, count and details before they are written to the audit log.
struct Tally {
  status:       SyncStatus,
  entity_count: u64,
  details:      Option<String>,
}

impl Tally {
  fn failed(details: impl Into<String>) -> Self {
    Self { status: SyncStatus::Failed, entity_count: 0, details: Some(details.into()) }
  }
}

// ─── Guards ──────────────────────────────────────────────────────────────────

/// Held for the lifetime of a round; releases the one-round-at-a-time flag.
struct RoundPermit(Arc<AtomicBool>);

impl Drop for RoundPermit {
  fn drop(&mut self) { self.0.store(false, Ordering::Release); }
}

/// Closes the round's audit entry as cancelled unless disarmed first.
struct OpenEntry<S: SyncAuditLog + 'static> {
  store: Arc<S>,
  state: Arc<watch::Sender<SyncState>>,
  id:    i64,
  armed: bool,
}

impl<S: SyncAuditLog + 'static> OpenEntry<S> {
  fn disarm(&mut self) { self.armed = false; }
}

impl<S: SyncAuditLog + 'static> Drop for OpenEntry<S> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    self.state.send_replace(SyncState::Failed);
    let id = self.id;
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      warn!(id, "round dropped outside a runtime; left for orphan recovery");
      return;
    };
    let store = Arc::clone(&self.store);
    handle.spawn(async move {
      let completion = SyncCompletion {
        status:       SyncStatus::Failed,
        entity_count: 0,
        details:      Some(CANCELLED_DETAILS.to_owned()),
      };
      match store.complete(id, completion).await {
        Ok(_) => warn!(id, "sync round dropped; closed as cancelled"),
        Err(e) => error!(id, error = %e, "failed to close dropped sync round"),
      }
    });
  }
}

// ─── Coordinator ─────────────────────────────────────────────────────────────

/// Runs sync rounds for one node. Cheap to clone; clones share state.
pub struct SyncCoordinator<S, T> {
  store:     Arc<S>,
  transport: Arc<T>,
  policy:    Arc<dyn MergePolicy>,
  config:    Arc<CoordinatorConfig>,
  state:     Arc<watch::Sender<SyncState>>,
  busy:      Arc<AtomicBool>,
}

impl<S, T> Clone for SyncCoordinator<S, T> {
  fn clone(&self) -> Self {
    Self {
      store:     Arc::clone(&self.store),
      transport: Arc::clone(&self.transport),
      policy:    Arc::clone(&self.policy),
      config:    Arc::clone(&self.config),
      state:     Arc::clone(&self.state),
      busy:      Arc::clone(&self.busy),
    }
  }
}

impl<S: SyncBackend, T: PeerTransport> SyncCoordinator<S, T> {
  /// A coordinator using [`LastWriterWins`] for concurrent revisions.
  pub fn new(store: Arc<S>, transport: Arc<T>, config: CoordinatorConfig) -> Self {
    let (state, _) = watch::channel(SyncState::Idle);
    Self {
      store,
      transport,
      policy: Arc::new(LastWriterWins),
      config: Arc::new(config),
      state: Arc::new(state),
      busy: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn with_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
    self.policy = policy;
    self
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  pub fn config(&self) -> &CoordinatorConfig { &self.config }

  pub fn local_node_id(&self) -> &str { &self.config.local.node_id }

  pub fn state(&self) -> SyncState { *self.state.borrow() }

  /// Observe state transitions.
  pub fn subscribe(&self) -> watch::Receiver<SyncState> { self.state.subscribe() }

  fn transition(&self, next: SyncState) {
    let prev = self.state.send_replace(next);
    if prev != next {
      debug!(from = %prev, to = %next, "sync state");
    }
  }

  fn acquire(&self) -> concord_core::Result<RoundPermit> {
    if self.busy.swap(true, Ordering::AcqRel) {
      return Err(CoreError::RoundInProgress);
    }
    Ok(RoundPermit(Arc::clone(&self.busy)))
  }

  // ── Rounds ─────────────────────────────────────────────────────────────────

  /// Run one round to completion.
  pub async fn run_round(&self, initiator: &str) -> concord_core::Result<SyncOutcome> {
    self
      .run_round_with_cancel(initiator, &CancellationToken::new())
      .await
  }

  /// Run one round, abandoning it as `failed`/`"cancelled"` if `cancel` fires
  /// before recording starts.
  pub async fn run_round_with_cancel(
    &self,
    initiator: &str,
    cancel: &CancellationToken,
  ) -> concord_core::Result<SyncOutcome> {
    let permit = self.acquire()?;
    self.drive(permit, initiator, cancel).await
  }

  /// Start a round in the background. Fails immediately with
  /// [`CoreError::RoundInProgress`] if one is already running.
  pub fn spawn_round(
    &self,
    initiator: String,
    cancel: CancellationToken,
  ) -> concord_core::Result<tokio::task::JoinHandle<concord_core::Result<SyncOutcome>>> {
    let permit = self.acquire()?;
    let this = self.clone();
    Ok(tokio::spawn(async move {
      this.drive(permit, &initiator, &cancel).await
    }))
  }

  async fn drive(
    &self,
    _permit: RoundPermit,
    initiator: &str,
    cancel: &CancellationToken,
  ) -> concord_core::Result<SyncOutcome> {
    self.transition(SyncState::Collecting);
    let sync_type = if self.config.hub_address.is_some() { "hub" } else { "peer" };
    let entry = self
      .store
      .begin(NewSyncLogEntry {
        node_id:     initiator.to_owned(),
        sync_type:   sync_type.to_owned(),
        entity_type: ALL_ENTITIES.to_owned(),
      })
      .await
      .inspect_err(|e| {
        error!(error = %e, "could not open audit entry");
        self.transition(SyncState::Failed);
      })?;

    let mut open = OpenEntry {
      store: Arc::clone(&self.store),
      state: Arc::clone(&self.state),
      id:    entry.id,
      armed: true,
    };

    let tally = tokio::select! {
      biased;
      () = cancel.cancelled() => {
        warn!(id = entry.id, "sync round cancelled");
        Tally::failed(CANCELLED_DETAILS)
      }
      res = self.execute(initiator) => match res {
        Ok(tally) => tally,
        Err(e) => {
          error!(id = entry.id, error = %e, "sync round aborted");
          Tally::failed(e.to_string())
        }
      },
    };

    self.transition(SyncState::Recording);
    let closed = self
      .store
      .complete(entry.id, SyncCompletion {
        status:       tally.status,
        entity_count: tally.entity_count,
        details:      tally.details,
      })
      .await;
    open.disarm();

    let closed = closed.inspect_err(|e| {
      error!(id = entry.id, error = %e, "could not close audit entry");
      self.transition(SyncState::Failed);
    })?;

    self.transition(if closed.status == SyncStatus::Failed {
      SyncState::Failed
    } else {
      SyncState::Idle
    });
    info!(
      id = closed.id,
      status = %closed.status,
      entity_count = closed.entity_count,
      details = closed.details.as_deref().unwrap_or(""),
      "sync round finished"
    );

    Ok(SyncOutcome {
      log_id:       closed.id,
      status:       closed.status,
      entity_count: closed.entity_count,
      details:      closed.details,
    })
  }

  /// Collect, exchange and merge. Errors are fatal local failures.
  async fn execute(&self, initiator: &str) -> concord_core::Result<Tally> {
    let since = self
      .store
      .last_success(initiator)
      .await?
      .map(|e| e.started_at);
    let outgoing = collect_deltas(&*self.store, self.local_node_id(), since).await?;
    debug!(
      since = ?since,
      entities = outgoing.entity_count(),
      "collected local deltas"
    );

    self.transition(SyncState::Exchanging);
    let peers = self.peers(initiator).await?;
    if peers.is_empty() {
      info!("no active peers to contact");
      return Ok(Tally {
        status:       SyncStatus::Success,
        entity_count: 0,
        details:      Some("no active peers".to_owned()),
      });
    }

    let contacted = peers.len();
    let request = Arc::new(ExchangeRequest {
      from: self.config.local.clone(),
      since,
      payload: outgoing,
    });
    let (responses, failures) = self.fan_out(peers, request).await;

    self.transition(SyncState::Merging);
    let mut received: BTreeSet<EntityKey> = BTreeSet::new();
    let mut collisions: Vec<(&Peer, BTreeSet<i64>)> = Vec::new();
    for (peer, payload) in &responses {
      // Sync contact counts as liveness.
      if self.config.hub_address.is_none() {
        if let Err(e) = self.store.heartbeat(&peer.node_id).await {
          debug!(peer = %peer.node_id, error = %e, "could not record peer contact");
        }
      }
      let report = apply_payload(&*self.store, &*self.policy, payload).await?;
      debug!(peer = %peer.node_id, ?report, "merged peer payload");
      received.extend(payload.entity_keys());
      if !report.fact_conflicts.is_empty() {
        collisions.push((peer, report.fact_conflicts));
      }
    }

    let entity_count = received.len() as u64;
    let reasons = || {
      failures
        .iter()
        .map(|(peer, e)| format!("{}: {e}", peer.node_id))
        .collect::<Vec<_>>()
        .join("; ")
    };
    if responses.is_empty() {
      return Ok(Tally::failed(format!("no peer responded: {}", reasons())));
    }

    let mut notes = Vec::new();
    if !failures.is_empty() {
      notes.push(format!(
        "{} of {contacted} peers unreachable: {}",
        failures.len(),
        reasons()
      ));
    }
    for (peer, ids) in &collisions {
      let ids = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
      warn!(peer = %peer.node_id, %ids, "fact id conflicts left unmerged");
      notes.push(format!("fact id conflict with {}: {ids}", peer.node_id));
    }

    let tally = if notes.is_empty() {
      Tally { status: SyncStatus::Success, entity_count, details: None }
    } else {
      Tally { status: SyncStatus::Partial, entity_count, details: Some(notes.join("; ")) }
    };
    Ok(tally)
  }

  async fn peers(&self, initiator: &str) -> concord_core::Result<Vec<Peer>> {
    if let Some(address) = &self.config.hub_address {
      return Ok(vec![Peer { node_id: address.clone(), address: address.clone() }]);
    }
    let local = self.local_node_id();
    Ok(
      self
        .store
        .list_voters()
        .await?
        .iter()
        .filter(|n| n.node_id != local && n.node_id != initiator)
        .map(Peer::from)
        .collect(),
    )
  }

  /// Exchange with every peer concurrently, each bounded by the peer timeout.
  async fn fan_out(
    &self,
    peers: Vec<Peer>,
    request: Arc<ExchangeRequest>,
  ) -> (Vec<(Peer, SyncPayload)>, Vec<(Peer, CoreError)>) {
    let limit = self.config.peer_timeout;
    let mut tasks = JoinSet::new();
    let mut by_task = HashMap::new();

    for peer in peers {
      let transport = Arc::clone(&self.transport);
      let request = Arc::clone(&request);
      let target = peer.clone();
      let handle = tasks.spawn(async move {
        match tokio::time::timeout(limit, transport.exchange(target, request)).await {
          Ok(res) => res,
          Err(_) => Err(Error::Timeout(limit)),
        }
      });
      by_task.insert(handle.id(), peer);
    }

    let mut responses = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next_with_id().await {
      let (id, res) = match joined {
        Ok((id, res)) => (id, res),
        Err(e) => (e.id(), Err(Error::Task(e))),
      };
      let Some(peer) = by_task.remove(&id) else { continue };
      match res {
        Ok(payload) => {
          debug!(peer = %peer.node_id, entities = payload.entity_count(), "peer responded");
          responses.push((peer, payload));
        }
        Err(e) => {
          let err = CoreError::PeerUnreachable {
            node_id: peer.node_id.clone(),
            reason:  e.to_string(),
          };
          warn!(error = %err, "peer skipped this round");
          failures.push((peer, err));
        }
      }
    }

    responses.sort_by(|a, b| a.0.node_id.cmp(&b.0.node_id));
    failures.sort_by(|a, b| a.0.node_id.cmp(&b.0.node_id));
    (responses, failures)
  }

  // ── Serving peers ──────────────────────────────────────────────────────────

  /// Handle an incoming exchange: refresh the caller in the registry, answer
  /// with local changes since the caller's watermark, then merge its payload.
  pub async fn accept_exchange(
    &self,
    request: ExchangeRequest,
  ) -> concord_core::Result<SyncPayload> {
    let ExchangeRequest { from, since, payload } = request;
    let caller = from.node_id.clone();
    self.store.register_node(from).await?;

    let reply = collect_deltas(&*self.store, self.local_node_id(), since).await?;
    let report = apply_payload(&*self.store, &*self.policy, &payload).await?;
    if !report.fact_conflicts.is_empty() {
      warn!(
        peer = %caller,
        fact_ids = ?report.fact_conflicts,
        "exchange carried facts that collide with local ones"
      );
    }
    info!(
      peer = %caller,
      received = payload.entity_count(),
      sent = reply.entity_count(),
      conflicts = report.conflicts,
      "served exchange"
    );
    Ok(reply)
  }

  // ── Local writes ───────────────────────────────────────────────────────────

  /// Record a fact on this node. The fact takes an id from this node's range
  /// and its clock is stamped in the same write.
  pub async fn record_local_fact(&self, input: NewFact) -> concord_core::Result<Fact> {
    self.store.record_fact(self.local_node_id(), input).await
  }

  /// Cast a vote on this node and stamp its clock in the same write. Returns
  /// the new score.
  pub async fn cast_local_vote(
    &self,
    fact_id: i64,
    agent: &str,
    value: i64,
  ) -> concord_core::Result<f64> {
    self
      .store
      .cast_stamped_vote(self.local_node_id(), fact_id, agent, value)
      .await
  }

  // ── Recovery ───────────────────────────────────────────────────────────────

  /// Fail every `running` audit entry older than `timeout`. Run at startup,
  /// before the first round.
  pub async fn recover_orphans(
    &self,
    timeout: Duration,
  ) -> concord_core::Result<Vec<SyncLogEntry>> {
    let now = Utc::now();
    let cutoff = TimeDelta::from_std(timeout)
      .ok()
      .and_then(|d| now.checked_sub_signed(d))
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    self.store.recover_orphans(cutoff).await
  }
}
