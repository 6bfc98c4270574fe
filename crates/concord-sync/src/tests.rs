//! Coordinator tests over an in-process network of SQLite-backed nodes.

use std::{
  collections::{HashMap, HashSet},
  sync::{Arc, Mutex},
  time::Duration,
};

use concord_core::{
  Error as CoreError,
  audit::{NewSyncLogEntry, SyncStatus},
  clock::{ClockSnapshot, EntityKey, MergePolicy, Resolution},
  cluster::NodeRegistration,
  consensus::VoteValue,
  fact::{Confidence, Fact, NewFact},
  store::{ClockTracker, ClusterRegistry, ConsensusEngine, FactStore, SyncAuditLog},
};
use concord_store_sqlite::SqliteStore;

use crate::{
  CancellationToken, CoordinatorConfig, Error, ExchangeRequest, Peer, PeerTransport, Result,
  SyncCoordinator, SyncPayload, SyncState,
};

type Node = SyncCoordinator<SqliteStore, FakeNet>;

/// Routes exchanges straight into the target node's coordinator.
#[derive(Default)]
struct FakeNet {
  nodes:   Mutex<HashMap<String, Node>>,
  down:    Mutex<HashSet<String>>,
  stalled: Mutex<HashSet<String>>,
}

impl FakeNet {
  fn take_down(&self, id: &str) { self.down.lock().unwrap().insert(addr(id)); }

  fn stall(&self, id: &str) { self.stalled.lock().unwrap().insert(addr(id)); }

  fn unstall(&self, id: &str) { self.stalled.lock().unwrap().remove(&addr(id)); }
}

impl PeerTransport for FakeNet {
  async fn exchange(&self, peer: Peer, request: Arc<ExchangeRequest>) -> Result<SyncPayload> {
    let is_down = self.down.lock().unwrap().contains(&peer.address);
    if is_down {
      return Err(Error::Status { status: 503, body: "connection refused".into() });
    }
    let is_stalled = self.stalled.lock().unwrap().contains(&peer.address);
    if is_stalled {
      std::future::pending::<()>().await;
    }
    let node = self.nodes.lock().unwrap().get(&peer.address).cloned();
    match node {
      Some(node) => Ok(node.accept_exchange((*request).clone()).await?),
      None => Err(Error::Status { status: 404, body: "no such node".into() }),
    }
  }
}

fn addr(id: &str) -> String { format!("mem://{id}") }

async fn node_with(net: &Arc<FakeNet>, id: &str, edit: impl FnOnce(&mut CoordinatorConfig)) -> Node {
  let store = SqliteStore::open_in_memory()
    .await
    .expect("in-memory store");
  let mut config = CoordinatorConfig::new(NodeRegistration::new(id, id, addr(id)));
  config.peer_timeout = Duration::from_millis(200);
  edit(&mut config);
  let node = SyncCoordinator::new(Arc::new(store), Arc::clone(net), config);
  net.nodes.lock().unwrap().insert(addr(id), node.clone());
  node
}

async fn node(net: &Arc<FakeNet>, id: &str) -> Node { node_with(net, id, |_| {}).await }

/// Register `peers` in `node`'s registry.
async fn knows(node: &Node, peers: &[&Node]) {
  for peer in peers {
    node
      .store()
      .register_node(peer.config().local.clone())
      .await
      .unwrap();
  }
}

/// A fact present on every node under the same id.
async fn shared_fact(nodes: &[&Node]) -> i64 {
  let fact = nodes[0]
    .store()
    .record_fact(nodes[0].local_node_id(), NewFact::new("the bridge reopened in May", "news"))
    .await
    .unwrap();
  for other in &nodes[1..] {
    other.store().import_fact(fact.clone()).await.unwrap();
  }
  fact.fact_id
}

async fn vote_of(node: &Node, fact_id: i64, agent: &str) -> Option<VoteValue> {
  node
    .store()
    .get_vote(fact_id, agent)
    .await
    .unwrap()
    .map(|v| v.value)
}

// ─── Round outcomes ──────────────────────────────────────────────────────────

#[tokio::test]
async fn one_unreachable_peer_of_three_is_partial() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  let c = node(&net, "c").await;
  let d = node(&net, "d").await;
  knows(&a, &[&b, &c, &d]).await;
  let f = shared_fact(&[&a, &b, &c, &d]).await;

  b.cast_local_vote(f, "b1", 1).await.unwrap();
  b.cast_local_vote(f, "b2", 1).await.unwrap();
  c.cast_local_vote(f, "c1", 1).await.unwrap();
  c.cast_local_vote(f, "c2", 1).await.unwrap();
  c.cast_local_vote(f, "c3", 1).await.unwrap();
  d.cast_local_vote(f, "d1", -1).await.unwrap();
  net.take_down("d");

  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Partial);
  assert_eq!(outcome.entity_count, 5);
  let details = outcome.details.clone().unwrap();
  assert!(details.contains("1 of 3"), "{details}");
  assert!(details.contains("d:"), "{details}");
  assert_eq!(a.state(), SyncState::Idle);

  let fact = a.store().get_fact(f).await.unwrap().unwrap();
  assert_eq!(fact.consensus_score, 1.5);
  assert_eq!(fact.confidence, Confidence::Verified);
  assert!(vote_of(&a, f, "d1").await.is_none());

  let entry = a.store().get_entry(outcome.log_id).await.unwrap().unwrap();
  assert_eq!(entry.status, SyncStatus::Partial);
  assert_eq!(entry.entity_count, 5);
  assert_eq!(entry.node_id, "a");
  assert!(entry.completed_at.is_some());
}

#[tokio::test]
async fn no_responding_peer_fails_until_a_fresh_round_succeeds() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  let c = node(&net, "c").await;
  knows(&a, &[&b, &c]).await;
  net.take_down("b");
  net.take_down("c");

  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Failed);
  assert_eq!(outcome.entity_count, 0);
  assert!(outcome.details.unwrap().contains("no peer responded"));
  assert_eq!(a.state(), SyncState::Failed);

  net.down.lock().unwrap().clear();
  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Success);
  assert_eq!(a.state(), SyncState::Idle);
}

#[tokio::test]
async fn stalled_peer_times_out() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  let c = node(&net, "c").await;
  knows(&a, &[&b, &c]).await;
  net.stall("c");

  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Partial);
  assert!(outcome.details.unwrap().contains("timed out"));
}

#[tokio::test]
async fn lone_node_round_succeeds_with_nothing_exchanged() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Success);
  assert_eq!(outcome.entity_count, 0);
}

#[tokio::test]
async fn inactive_peers_are_not_contacted() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  let c = node(&net, "c").await;
  knows(&a, &[&b, &c]).await;
  net.take_down("c");
  a.store().mark_inactive("c").await.unwrap();

  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Success);
}

#[tokio::test]
async fn hub_is_the_only_exchange_peer() {
  let net = Arc::new(FakeNet::default());
  let hub = node(&net, "hub").await;
  let a = node_with(&net, "a", |c| c.hub_address = Some(addr("hub"))).await;
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;
  net.take_down("b");

  let f = shared_fact(&[&a, &hub]).await;
  a.cast_local_vote(f, "x", 1).await.unwrap();

  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Success);
  let entry = a.store().get_entry(outcome.log_id).await.unwrap().unwrap();
  assert_eq!(entry.sync_type, "hub");

  assert_eq!(vote_of(&hub, f, "x").await, Some(VoteValue::Agree));
  assert!(hub.store().get_node("a").await.unwrap().is_some());
}

// ─── Concurrency and cancellation ────────────────────────────────────────────

#[tokio::test]
async fn cancelled_round_is_recorded_as_failed() {
  let net = Arc::new(FakeNet::default());
  let a = node_with(&net, "a", |c| c.peer_timeout = Duration::from_secs(30)).await;
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;
  net.stall("b");

  let cancel = CancellationToken::new();
  let handle = a.spawn_round("a".into(), cancel.clone()).unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(a.state(), SyncState::Exchanging);

  let err = a.run_round("a").await.unwrap_err();
  assert!(matches!(err, CoreError::RoundInProgress));
  assert!(matches!(
    a.spawn_round("a".into(), CancellationToken::new()),
    Err(CoreError::RoundInProgress)
  ));

  cancel.cancel();
  let outcome = handle.await.unwrap().unwrap();
  assert_eq!(outcome.status, SyncStatus::Failed);
  assert_eq!(outcome.details.as_deref(), Some("cancelled"));
  assert_eq!(a.state(), SyncState::Failed);

  let entry = a.store().get_entry(outcome.log_id).await.unwrap().unwrap();
  assert_eq!(entry.status, SyncStatus::Failed);
  assert_eq!(entry.details.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn dropped_round_closes_its_audit_entry() {
  let net = Arc::new(FakeNet::default());
  let a = node_with(&net, "a", |c| c.peer_timeout = Duration::from_secs(30)).await;
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;
  net.stall("b");

  let res = tokio::time::timeout(Duration::from_millis(50), a.run_round("a")).await;
  assert!(res.is_err(), "round should still be waiting on the peer");

  let mut closed = None;
  for _ in 0..100 {
    let entry = a.store().recent(1).await.unwrap().remove(0);
    if entry.status != SyncStatus::Running {
      closed = Some(entry);
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  let closed = closed.expect("entry closed after drop");
  assert_eq!(closed.status, SyncStatus::Failed);
  assert_eq!(closed.details.as_deref(), Some("cancelled"));

  // The permit went with the dropped future.
  net.unstall("b");
  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Success);
}

// ─── Vote replication ────────────────────────────────────────────────────────

#[tokio::test]
async fn votes_flow_in_both_directions() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;
  let f = shared_fact(&[&a, &b]).await;

  a.cast_local_vote(f, "x", 1).await.unwrap();
  b.cast_local_vote(f, "y", -1).await.unwrap();

  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Success);
  assert_eq!(outcome.entity_count, 1);

  for n in [&a, &b] {
    assert_eq!(vote_of(n, f, "x").await, Some(VoteValue::Agree));
    assert_eq!(vote_of(n, f, "y").await, Some(VoteValue::Disagree));
    assert_eq!(n.store().get_fact(f).await.unwrap().unwrap().consensus_score, 1.0);
  }
  assert!(b.store().get_node("a").await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn concurrent_votes_converge_on_the_last_writer() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;
  let f = shared_fact(&[&a, &b]).await;

  a.cast_local_vote(f, "x", 1).await.unwrap();
  tokio::time::sleep(Duration::from_millis(5)).await;
  b.cast_local_vote(f, "x", -1).await.unwrap();

  a.run_round("a").await.unwrap();

  assert_eq!(vote_of(&a, f, "x").await, Some(VoteValue::Disagree));
  assert_eq!(vote_of(&b, f, "x").await, Some(VoteValue::Disagree));

  let key = EntityKey::vote(f, "x");
  let snap = a.store().snapshot(&key).await.unwrap();
  assert_eq!((snap.get("a"), snap.get("b")), (1, 1));
  assert_eq!(snap, b.store().snapshot(&key).await.unwrap());
}

struct AlwaysKeepLocal;

impl MergePolicy for AlwaysKeepLocal {
  fn resolve(&self, _: &EntityKey, _: &ClockSnapshot, _: &ClockSnapshot) -> Resolution {
    Resolution::KeepLocal
  }
}

#[tokio::test]
async fn merge_policy_can_be_overridden() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a")
    .await
    .with_policy(Arc::new(AlwaysKeepLocal));
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;
  let f = shared_fact(&[&a, &b]).await;

  a.cast_local_vote(f, "x", 1).await.unwrap();
  tokio::time::sleep(Duration::from_millis(5)).await;
  b.cast_local_vote(f, "x", -1).await.unwrap();

  a.run_round("a").await.unwrap();
  assert_eq!(vote_of(&a, f, "x").await, Some(VoteValue::Agree));
}

#[tokio::test]
async fn retraction_replicates() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;
  let f = shared_fact(&[&a, &b]).await;

  a.cast_local_vote(f, "x", 1).await.unwrap();
  a.run_round("a").await.unwrap();
  assert_eq!(vote_of(&b, f, "x").await, Some(VoteValue::Agree));

  tokio::time::sleep(Duration::from_millis(5)).await;
  a.cast_local_vote(f, "x", 0).await.unwrap();
  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Success);

  assert!(vote_of(&b, f, "x").await.is_none());
  assert_eq!(b.store().get_fact(f).await.unwrap().unwrap().consensus_score, 1.0);
  assert!(vote_of(&a, f, "x").await.is_none());
}

#[tokio::test]
async fn new_facts_are_copied_with_their_votes() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;

  let fact = b
    .record_local_fact(NewFact::new("rain expected tomorrow", "forecast"))
    .await
    .unwrap();
  b.cast_local_vote(fact.fact_id, "z", 1).await.unwrap();

  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.entity_count, 2);

  let copied = a.store().get_fact(fact.fact_id).await.unwrap().unwrap();
  assert_eq!(copied.content, "rain expected tomorrow");
  assert_eq!(copied.consensus_score, 1.1);
}

// ─── Fact identity ───────────────────────────────────────────────────────────

#[tokio::test]
async fn independently_recorded_facts_stay_distinct() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;

  let blue = a.record_local_fact(NewFact::new("the sky is blue", "t")).await.unwrap();
  let green = b.record_local_fact(NewFact::new("the sky is green", "t")).await.unwrap();
  assert_ne!(blue.fact_id, green.fact_id);
  for agent in ["v1", "v2", "v3", "v4", "v5"] {
    b.cast_local_vote(green.fact_id, agent, 1).await.unwrap();
  }

  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Success);

  let mine = a.store().get_fact(blue.fact_id).await.unwrap().unwrap();
  assert_eq!(mine.content, "the sky is blue");
  assert_eq!(mine.consensus_score, 1.0);
  assert_eq!(mine.confidence, Confidence::Unverified);
  assert!(a.store().votes_for(blue.fact_id).await.unwrap().is_empty());

  let theirs = a.store().get_fact(green.fact_id).await.unwrap().unwrap();
  assert_eq!(theirs.content, "the sky is green");
  assert_eq!(theirs.origin_node, "b");
  assert_eq!(theirs.consensus_score, 1.5);
  assert_eq!(theirs.confidence, Confidence::Verified);

  let copied = b.store().get_fact(blue.fact_id).await.unwrap().unwrap();
  assert_eq!(copied.content, "the sky is blue");
}

#[tokio::test]
async fn colliding_fact_ids_are_reported_and_left_unmerged() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  let b = node(&net, "b").await;
  knows(&a, &[&b]).await;

  let blue = a.record_local_fact(NewFact::new("the sky is blue", "t")).await.unwrap();
  // A different assertion stored on b under the same id.
  let green = Fact { content: "the sky is green".into(), ..blue.clone() };
  assert!(b.store().import_fact(green).await.unwrap());
  for agent in ["v1", "v2", "v3", "v4", "v5"] {
    b.cast_local_vote(blue.fact_id, agent, 1).await.unwrap();
  }

  let outcome = a.run_round("a").await.unwrap();
  assert_eq!(outcome.status, SyncStatus::Partial);
  let details = outcome.details.unwrap();
  assert!(details.contains("fact id conflict with b"), "{details}");
  assert!(details.contains(&blue.fact_id.to_string()), "{details}");
  assert_eq!(a.state(), SyncState::Idle);

  let mine = a.store().get_fact(blue.fact_id).await.unwrap().unwrap();
  assert_eq!(mine.content, "the sky is blue");
  assert_eq!(mine.consensus_score, 1.0);
  assert!(a.store().votes_for(blue.fact_id).await.unwrap().is_empty());
  let key = EntityKey::vote(blue.fact_id, "v1");
  assert!(a.store().snapshot(&key).await.unwrap().is_empty());

  // b kept its own assertion as well.
  let theirs = b.store().get_fact(blue.fact_id).await.unwrap().unwrap();
  assert_eq!(theirs.content, "the sky is green");

  // A partial round does not move the watermark.
  assert!(a.store().last_success("a").await.unwrap().is_none());
}

// ─── Local writes and recovery ───────────────────────────────────────────────

#[tokio::test]
async fn local_writes_stamp_the_local_clock() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;

  let fact = a.record_local_fact(NewFact::new("x", "t")).await.unwrap();
  assert_eq!(fact.origin_node, "a");
  let snap = a.store().snapshot(&EntityKey::fact(fact.fact_id)).await.unwrap();
  assert_eq!(snap.get("a"), 1);

  a.cast_local_vote(fact.fact_id, "x", 1).await.unwrap();
  a.cast_local_vote(fact.fact_id, "x", -1).await.unwrap();
  let key = EntityKey::vote(fact.fact_id, "x");
  assert_eq!(a.store().snapshot(&key).await.unwrap().get("a"), 2);

  let err = a.cast_local_vote(fact.fact_id, "y", 5).await.unwrap_err();
  assert!(matches!(err, CoreError::InvalidVoteValue(5)));
  let key = EntityKey::vote(fact.fact_id, "y");
  assert!(a.store().snapshot(&key).await.unwrap().is_empty());

  let err = a.cast_local_vote(fact.fact_id + 1, "y", 1).await.unwrap_err();
  assert!(matches!(err, CoreError::FactNotFound(_)));
  let key = EntityKey::vote(fact.fact_id + 1, "y");
  assert!(a.store().snapshot(&key).await.unwrap().is_empty());
}

#[tokio::test]
async fn orphaned_rounds_are_recovered_once() {
  let net = Arc::new(FakeNet::default());
  let a = node(&net, "a").await;
  a.store()
    .begin(NewSyncLogEntry {
      node_id:     "a".into(),
      sync_type:   "peer".into(),
      entity_type: "all".into(),
    })
    .await
    .unwrap();

  assert!(a.recover_orphans(Duration::from_secs(3600)).await.unwrap().is_empty());

  tokio::time::sleep(Duration::from_millis(5)).await;
  let recovered = a.recover_orphans(Duration::ZERO).await.unwrap();
  assert_eq!(recovered.len(), 1);
  assert_eq!(recovered[0].status, SyncStatus::Failed);
  assert!(recovered[0].details.as_deref().unwrap().contains("orphaned"));
  assert!(a.recover_orphans(Duration::ZERO).await.unwrap().is_empty());
}
