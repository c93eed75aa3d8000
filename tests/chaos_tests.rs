// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles session loss, remote restarts,
//! failover and crashes without panics, deadlocks or duplicated leaders.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::{eventually, seed_channel, test_engine, RecordingClient, ScriptedRemote};
use hub_replication::config::{CoordinationConfig, DeliveryConfig};
use hub_replication::group::DeliveryContext;
use hub_replication::model::{Content, Group, ReplicationDomain};
use hub_replication::{
    BoxFuture, ConnectionState, ContentKey, ContentStore, CoordinationService, CursorBackend,
    CursorStore, GroupDeliveryEngine, HubConfig, InMemoryCoordination, Leader,
    LeadershipCoordinator, LeadershipToken, MemoryContentStore, MemoryCursors,
    MemoryRegistrations, RegistrationStore, Registry,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Leadership Under Contention and Session Loss
// =============================================================================

/// Leader shared by every contender so overlapping terms are observable.
struct ExclusiveLeader {
    active: AtomicUsize,
    max_active: AtomicUsize,
    terms: AtomicUsize,
}

impl ExclusiveLeader {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            terms: AtomicUsize::new(0),
        })
    }
}

impl Leader for ExclusiveLeader {
    fn take_leadership(self: Arc<Self>, token: LeadershipToken) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.terms.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = token.revoked() => {}
                _ = sleep(Duration::from_millis(30)) => {}
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Test: Contenders on one path never lead at the same time
#[tokio::test]
async fn leadership_is_exclusive_under_contention() {
    let coordination: Arc<dyn CoordinationService> = Arc::new(InMemoryCoordination::new());
    let config = CoordinationConfig::for_testing();
    let leader = ExclusiveLeader::new();

    let coordinators: Vec<LeadershipCoordinator> = (0..4)
        .map(|i| {
            LeadershipCoordinator::new(
                "/ChannelReplicator/orders",
                &format!("node-{}", i),
                Arc::clone(&coordination),
                &config,
            )
        })
        .collect();
    for coordinator in &coordinators {
        assert!(coordinator.start(Arc::clone(&leader) as Arc<dyn Leader>));
    }

    sleep(Duration::from_millis(600)).await;
    for coordinator in &coordinators {
        coordinator.close().await;
    }

    assert_eq!(leader.max_active.load(Ordering::SeqCst), 1);
    assert!(leader.terms.load(Ordering::SeqCst) >= 3);
    assert_eq!(leader.active.load(Ordering::SeqCst), 0);
}

/// Leader that polls its flag once per iteration.
struct LoopingLeader {
    iterations: AtomicUsize,
    exited: AtomicBool,
    terms: AtomicUsize,
}

impl Leader for LoopingLeader {
    fn take_leadership(self: Arc<Self>, token: LeadershipToken) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.terms.fetch_add(1, Ordering::SeqCst);
            self.exited.store(false, Ordering::SeqCst);
            while token.has_leadership() {
                self.iterations.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(20)).await;
            }
            self.exited.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Test: Session loss flips the flag and the leader loop exits within one
/// iteration; leadership returns with the session
#[tokio::test]
async fn session_loss_stops_leader_within_one_iteration() {
    let coordination = Arc::new(InMemoryCoordination::new());
    let leader = Arc::new(LoopingLeader {
        iterations: AtomicUsize::new(0),
        exited: AtomicBool::new(false),
        terms: AtomicUsize::new(0),
    });
    let coordinator = LeadershipCoordinator::new(
        "/GroupLeader/billing",
        "node-a",
        Arc::clone(&coordination) as Arc<dyn CoordinationService>,
        &CoordinationConfig::for_testing(),
    );
    coordinator.start(Arc::clone(&leader) as Arc<dyn Leader>);

    eventually(WAIT, "leader looping", || {
        let leader = Arc::clone(&leader);
        async move { leader.iterations.load(Ordering::SeqCst) >= 3 }
    })
    .await;
    assert!(coordinator.has_leadership());

    coordination.set_connection_state(ConnectionState::Lost);
    let at_loss = leader.iterations.load(Ordering::SeqCst);
    eventually(WAIT, "leader loop exit", || {
        let leader = Arc::clone(&leader);
        async move { leader.exited.load(Ordering::SeqCst) }
    })
    .await;
    assert!(leader.iterations.load(Ordering::SeqCst) - at_loss <= 1);
    assert!(!coordinator.has_leadership());
    assert!(coordination.holder("/GroupLeader/billing").is_none());

    // No new term while the session is down
    sleep(Duration::from_millis(100)).await;
    assert_eq!(leader.terms.load(Ordering::SeqCst), 1);

    coordination.set_connection_state(ConnectionState::Connected);
    eventually(WAIT, "leadership regained", || {
        let leader = Arc::clone(&leader);
        async move { leader.terms.load(Ordering::SeqCst) == 2 }
    })
    .await;

    coordinator.close().await;
    assert!(leader.exited.load(Ordering::SeqCst));
}

/// Test: A lease taken away behind the leader's back ends the term
#[tokio::test]
async fn expired_lease_revokes_leadership() {
    let coordination = Arc::new(InMemoryCoordination::new());
    let leader = Arc::new(LoopingLeader {
        iterations: AtomicUsize::new(0),
        exited: AtomicBool::new(false),
        terms: AtomicUsize::new(0),
    });
    let coordinator = LeadershipCoordinator::new(
        "/GroupLeader/billing",
        "node-a",
        Arc::clone(&coordination) as Arc<dyn CoordinationService>,
        &CoordinationConfig::for_testing(),
    );
    coordinator.start(Arc::clone(&leader) as Arc<dyn Leader>);
    eventually(WAIT, "leader looping", || {
        let leader = Arc::clone(&leader);
        async move { leader.iterations.load(Ordering::SeqCst) >= 1 }
    })
    .await;

    coordination.expire("/GroupLeader/billing");
    eventually(WAIT, "term ended and re-queued", || {
        let leader = Arc::clone(&leader);
        async move { leader.terms.load(Ordering::SeqCst) >= 2 }
    })
    .await;

    coordinator.close().await;
}

// =============================================================================
// Replication Under Remote Failures
// =============================================================================

/// Test: A remote restart ends the term; the next term resubscribes and
/// picks up what was published meanwhile
#[tokio::test]
async fn replication_recovers_after_remote_disconnect() {
    let store = Arc::new(MemoryContentStore::new());
    let coordination = Arc::new(InMemoryCoordination::new());
    let remote = Arc::new(ScriptedRemote::new("http://hub.west/channel/orders", "orders"));
    let http = Arc::new(RecordingClient::new(Duration::ZERO));
    remote.insert_fresh(1000..=1002);

    let mut engine = test_engine(HubConfig::for_testing("node-a"), &store, &coordination, &remote, &http);
    engine.start().await.unwrap();
    engine
        .replication()
        .unwrap()
        .put_domain(ReplicationDomain::new("hub.west", ["orders"]))
        .await
        .unwrap();

    let s = Arc::clone(&store);
    eventually(WAIT, "initial replication", || {
        let s = Arc::clone(&s);
        async move { s.len("orders") == 3 }
    })
    .await;

    remote.disconnect().await;
    remote.insert_fresh(1003..=1003);

    eventually(WAIT, "replication after reconnect", || {
        let s = Arc::clone(&s);
        async move { s.len("orders") == 4 }
    })
    .await;
    let r = Arc::clone(&remote);
    eventually(WAIT, "resubscribed", || {
        let r = Arc::clone(&r);
        async move { r.subscriber_count() == 1 }
    })
    .await;

    remote.publish(1004).await;
    eventually(WAIT, "live after reconnect", || {
        let s = Arc::clone(&s);
        async move { s.len("orders") == 5 }
    })
    .await;
    assert_eq!(store.sequences("orders"), (1000..=1004).collect::<Vec<_>>());

    engine.shutdown().await;
}

/// Test: Garbage notifications are ignored without ending the stream
#[tokio::test]
async fn replication_ignores_unparseable_notifications() {
    let store = Arc::new(MemoryContentStore::new());
    let coordination = Arc::new(InMemoryCoordination::new());
    let remote = Arc::new(ScriptedRemote::new("http://hub.west/channel/orders", "orders"));
    let http = Arc::new(RecordingClient::new(Duration::ZERO));
    remote.insert_fresh(1000..=1000);

    let mut engine = test_engine(HubConfig::for_testing("node-a"), &store, &coordination, &remote, &http);
    engine.start().await.unwrap();
    engine
        .replication()
        .unwrap()
        .put_domain(ReplicationDomain::new("hub.west", ["orders"]))
        .await
        .unwrap();
    let s = Arc::clone(&store);
    eventually(WAIT, "initial replication", || {
        let s = Arc::clone(&s);
        async move { s.len("orders") == 1 }
    })
    .await;

    for garbage in ["", "/", "http://hub.west/channel/orders/latest", "\u{0}\u{ff}", "-1"] {
        remote.notify_text(garbage).await;
    }
    remote.publish(1001).await;

    eventually(WAIT, "item after garbage", || {
        let s = Arc::clone(&s);
        async move { s.len("orders") == 2 }
    })
    .await;
    assert_eq!(remote.subscriber_count(), 1);
    engine.shutdown().await;
}

/// Test: An unreachable remote leaves an invalid replicator that a later
/// refresh brings up
#[tokio::test]
async fn replication_unreachable_remote_recovers_on_refresh() {
    let store = Arc::new(MemoryContentStore::new());
    let coordination = Arc::new(InMemoryCoordination::new());
    let remote = Arc::new(ScriptedRemote::new("http://hub.west/channel/orders", "orders"));
    let http = Arc::new(RecordingClient::new(Duration::ZERO));
    remote.insert_fresh(1000..=1001);
    remote.set_unreachable(true);

    let mut engine = test_engine(HubConfig::for_testing("node-a"), &store, &coordination, &remote, &http);
    engine.start().await.unwrap();
    let replication = Arc::clone(engine.replication().unwrap());
    replication
        .put_domain(ReplicationDomain::new("hub.west", ["orders"]))
        .await
        .unwrap();

    let status = replication.status();
    assert!(!status[0].valid);
    assert!(status[0].message.starts_with("unable to reach http://hub.west/channel/orders"));

    remote.set_unreachable(false);
    replication.refresh().await.unwrap();
    assert!(replication.status()[0].valid);

    let s = Arc::clone(&store);
    eventually(WAIT, "replication after recovery", || {
        let s = Arc::clone(&s);
        async move { s.len("orders") == 2 }
    })
    .await;
    engine.shutdown().await;
}

// =============================================================================
// Group Delivery Failover
// =============================================================================

async fn delivery_context(
    node_id: &str,
    store: &Arc<MemoryContentStore>,
    coordination: &Arc<InMemoryCoordination>,
    cursors: &Arc<CursorStore>,
    registry: &Registry,
    http: &Arc<RecordingClient>,
) -> DeliveryContext {
    DeliveryContext {
        node_id: node_id.to_string(),
        coordination: Arc::clone(coordination) as Arc<dyn CoordinationService>,
        coordination_config: CoordinationConfig::for_testing(),
        delivery: DeliveryConfig::for_testing(),
        groups: Arc::new(registry.clone()),
        content: Arc::clone(store) as Arc<dyn ContentStore>,
        http: Arc::clone(http) as Arc<dyn hub_replication::HttpDeliveryClient>,
        cursors: Arc::clone(cursors),
    }
}

/// Test: When the delivering node exits, the standby continues from the
/// cursor the leader flushed to the shared backend, without redelivering
/// completed keys. Each node has its own cursor cache and registry handle.
#[tokio::test]
async fn group_delivery_fails_over_to_standby() {
    let store = Arc::new(MemoryContentStore::new());
    let coordination = Arc::new(InMemoryCoordination::new());
    let shared_cursors: Arc<dyn CursorBackend> = Arc::new(MemoryCursors::new());
    let shared_registrations: Arc<dyn RegistrationStore> = Arc::new(MemoryRegistrations::new());
    let http = Arc::new(RecordingClient::new(Duration::from_millis(5)));

    let cursors_a = Arc::new(
        CursorStore::with_backend(Arc::clone(&shared_cursors))
            .await
            .unwrap(),
    );
    let cursors_b = Arc::new(
        CursorStore::with_backend(Arc::clone(&shared_cursors))
            .await
            .unwrap(),
    );
    let registry_a = Registry::with_store(Arc::clone(&shared_registrations));
    let registry_b = Registry::with_store(shared_registrations);

    let keys = seed_channel(&store, "orders", 3).await;
    let group = Group::new("billing", "http://client.example/cb", "http://hub/channel/orders")
        .with_parallel_calls(1);
    // Registered through node A only
    registry_a.insert_group(&group).await.unwrap();
    assert!(registry_b.find_group("billing").await.unwrap().is_some());

    let a = GroupDeliveryEngine::new(
        &group,
        delivery_context("node-a", &store, &coordination, &cursors_a, &registry_a, &http).await,
    );
    let b = GroupDeliveryEngine::new(
        &group,
        delivery_context("node-b", &store, &coordination, &cursors_b, &registry_b, &http).await,
    );
    a.try_leadership();
    b.try_leadership();

    let client = Arc::clone(&http);
    eventually(WAIT, "first batch delivered", || {
        let client = Arc::clone(&client);
        async move { client.delivered().len() == 3 }
    })
    .await;

    let (leader, leader_cursors, standby, standby_cursors) = if a.has_leadership() {
        (&a, &cursors_a, &b, &cursors_b)
    } else {
        (&b, &cursors_b, &a, &cursors_a)
    };
    let last = keys[2].clone();
    eventually(WAIT, "progress committed", || {
        let last = last.clone();
        async move { leader.last_completed().await == last }
    })
    .await;
    leader_cursors.flush_dirty().await.unwrap();
    assert_eq!(standby_cursors.get_key("billing").await, None, "standby cache is stale");

    leader.exit(false).await;

    let mut later = Vec::new();
    for i in 4..=5 {
        let mut content = Content::new(format!("item-{}", i));
        content.key = ContentKey::new(1_700_000_000_000 + i * 1000, "k");
        later.push(store.write("orders", content).await.unwrap());
    }

    eventually(WAIT, "standby delivered the rest", || {
        let client = Arc::clone(&client);
        async move { client.delivered().len() >= 5 }
    })
    .await;
    assert!(standby.has_leadership());
    sleep(Duration::from_millis(50)).await;

    let delivered = http.delivered();
    let expected: Vec<String> = keys
        .iter()
        .chain(later.iter())
        .map(|k| format!("http://hub/channel/orders/{}", k.to_url()))
        .collect();
    assert_eq!(delivered, expected);

    standby.exit(false).await;
}

/// Test: Deleting a group mid-delivery stops within the grace period
#[tokio::test]
async fn group_delete_during_slow_delivery() {
    let store = Arc::new(MemoryContentStore::new());
    let coordination = Arc::new(InMemoryCoordination::new());
    let remote = Arc::new(ScriptedRemote::new("http://hub.west/channel/orders", "orders"));
    let http = Arc::new(RecordingClient::new(Duration::from_millis(150)));
    seed_channel(&store, "orders", 20).await;

    let mut engine = test_engine(HubConfig::for_testing("node-a"), &store, &coordination, &remote, &http);
    engine.start().await.unwrap();
    let groups = Arc::clone(engine.groups().unwrap());
    groups
        .upsert_group(
            Group::new("billing", "http://client.example/cb", "http://hub/channel/orders")
                .with_parallel_calls(4),
        )
        .await
        .unwrap();

    let client = Arc::clone(&http);
    eventually(WAIT, "deliveries in flight", || {
        let client = Arc::clone(&client);
        async move { !client.calls().is_empty() }
    })
    .await;

    let started = tokio::time::Instant::now();
    assert!(groups.delete_group("billing").await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(groups.status().await.unwrap().is_empty());
    assert_eq!(engine.group_supervisor().unwrap().running(), 0);
    let cursors = engine.cursors().unwrap();
    assert_eq!(cursors.get_key("billing").await, None);
    assert!(coordination.holder("/GroupLeader/billing").is_none());

    let calls = http.calls().len();
    sleep(Duration::from_millis(400)).await;
    assert!(http.calls().len() <= calls + 4, "deliveries continued after delete");

    engine.shutdown().await;
}

// =============================================================================
// Cursor Crash Recovery
// =============================================================================

/// Test: Crash recovery from an unflushed cursor
///
/// Simulates a crash by not flushing cursors, then verifies the store
/// resumes from the last flushed position.
#[tokio::test]
async fn cursor_crash_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cursors.db");

    {
        let store = CursorStore::new(&db_path).await.unwrap();
        store.update_sequence_if_greater("replication/orders", 1001).await;
        store.update_sequence_if_greater("replication/orders", 1002).await;
        store.flush_dirty().await.unwrap();

        // Not flushed: lost in the crash
        store.update_sequence_if_greater("replication/orders", 1003).await;
    }

    let store = CursorStore::new(&db_path).await.unwrap();
    assert_eq!(store.get_sequence("replication/orders").await, Some(1002));
    store.close().await;
}

/// Test: Concurrent updates never move a cursor backwards
#[tokio::test]
async fn cursor_concurrent_updates_stay_monotonic() {
    let dir = tempdir().unwrap();
    let store = Arc::new(CursorStore::new(dir.path().join("cursors.db")).await.unwrap());

    let mut handles = Vec::new();
    for task in 0..8u64 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            for i in 0..100u64 {
                let value = 1000 + ((i * 37 + task * 11) % 500);
                store.update_sequence_if_greater("replication/orders", value).await;
                if i % 25 == 0 {
                    let _ = store.flush_dirty().await;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    store.flush_dirty().await.unwrap();

    let max = (0..8u64)
        .flat_map(|task| (0..100u64).map(move |i| 1000 + ((i * 37 + task * 11) % 500)))
        .max()
        .unwrap();
    assert_eq!(store.get_sequence("replication/orders").await, Some(max));

    // A stale write after the fact is ignored
    assert!(!store.update_sequence_if_greater("replication/orders", 1000).await);
    store.close().await;

    let reopened = CursorStore::new(dir.path().join("cursors.db")).await.unwrap();
    assert_eq!(reopened.get_sequence("replication/orders").await, Some(max));
}
