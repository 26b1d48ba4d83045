//! End-to-end scheduler tests: dispatcher + in-process queue + sync worker
//! against a live registry.

use std::collections::HashSet;
use std::time::Duration;

use backsync_registry::{current_time_us, ResourceKey, ResourceKind, SelectiveSync, SyncState};
use backsync_scheduler::{CapacityPool, CycleOutcome, NodeConfig};

use crate::harness::{Behavior, TestStack};

fn small_node(capacity: usize, batch: usize) -> NodeConfig {
    NodeConfig {
        max_file_capacity: capacity,
        max_repository_capacity: capacity,
        db_retrieve_batch_size: batch,
        // effectively disable empty-scan suppression so test cycles can
        // run back to back
        backoff_ttl_us: 1,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backlog_drains_with_bounded_capacity() {
    // 10 candidates, batch size 5, capacity 2: all 10 sync eventually,
    // each enqueued exactly once, never more than 2 outstanding
    let node = small_node(2, 5);
    let stack = TestStack::start(&node, 4);
    let now = current_time_us();
    stack.probe_healthy("default", now);

    for id in 1..=10 {
        let key = ResourceKey::new(ResourceKind::LfsObject, id);
        stack.add_pending(ResourceKind::LfsObject, id, "default", now + id);
        stack.transfer.set(
            key,
            Behavior::Slow {
                bytes: 32,
                delay: Duration::from_millis(10),
            },
        );
    }

    let dispatcher = stack.dispatcher(node, CapacityPool::Blob);
    let mut max_outstanding = 0;
    for _ in 0..300 {
        dispatcher.run_cycle(current_time_us());
        max_outstanding = max_outstanding.max(stack.queue.outstanding());
        if stack.registry.counts().synced == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    stack.wait_for_drain().await;

    assert_eq!(stack.registry.counts().synced, 10);
    assert!(max_outstanding <= 2, "outstanding peaked at {}", max_outstanding);
    assert_eq!(stack.queue.stats().enqueued, 10);

    let attempted: HashSet<ResourceKey> = stack.transfer.attempts().into_iter().collect();
    assert_eq!(attempted.len(), 10);
}

#[tokio::test]
async fn failed_transfer_becomes_retry_eligible_later() {
    let node = small_node(5, 10);
    let stack = TestStack::start(&node, 2);
    let t0 = current_time_us();
    stack.probe_healthy("default", t0);

    let key = ResourceKey::new(ResourceKind::JobArtifact, 1);
    stack.add_pending(ResourceKind::JobArtifact, 1, "default", t0);
    stack.transfer.set(
        key,
        Behavior::Fail {
            msg: "connection reset".to_string(),
        },
    );

    let dispatcher = stack.dispatcher(node, CapacityPool::Blob);
    assert_eq!(dispatcher.run_cycle(t0).jobs_enqueued(), 1);
    stack.wait_for_drain().await;

    let entry = stack.registry.get(key).unwrap();
    let retry_at = match entry.state {
        SyncState::Failed {
            retry_at_us: Some(at),
            retry_count: 1,
            ..
        } => at,
        other => panic!("expected Failed with retry_at, got {:?}", other),
    };
    assert!(retry_at > t0);

    // inside the retry window: not rescheduled
    assert_eq!(dispatcher.run_cycle(current_time_us()).jobs_enqueued(), 0);

    // past the retry window, the primary has recovered
    stack.transfer.set(key, Behavior::Succeed { bytes: 256 });
    let later = retry_at + 1;
    stack.probe_healthy("default", later);
    assert_eq!(dispatcher.run_cycle(later).jobs_enqueued(), 1);
    stack.wait_for_drain().await;

    assert_eq!(
        stack.registry.get(key).unwrap().state,
        SyncState::Synced {
            bytes_transferred: 256,
            missing_on_primary: false
        }
    );
}

#[tokio::test]
async fn missing_resource_is_logged_not_failed() {
    let node = small_node(5, 10);
    let stack = TestStack::start(&node, 2);
    let now = current_time_us();
    stack.probe_healthy("default", now);

    let key = ResourceKey::new(ResourceKind::Avatar, 1);
    stack.add_pending(ResourceKind::Avatar, 1, "default", now);
    stack.transfer.set(key, Behavior::Missing);

    let dispatcher = stack.dispatcher(node, CapacityPool::Blob);
    dispatcher.run_cycle(now);
    stack.wait_for_drain().await;

    let entry = stack.registry.get(key).unwrap();
    assert_eq!(entry.state, SyncState::Pending);
    assert_eq!(entry.last_attempt_us, None);
    assert_eq!(stack.transfer.attempts(), vec![key]);
}

#[tokio::test]
async fn disabled_node_enqueues_nothing() {
    let node = NodeConfig {
        enabled: false,
        ..small_node(5, 10)
    };
    let stack = TestStack::start(&node, 2);
    let now = current_time_us();
    stack.probe_healthy("default", now);
    stack.add_pending(ResourceKind::Avatar, 1, "default", now);

    let dispatcher = stack.dispatcher(node, CapacityPool::Blob);
    for tick in 0..3 {
        assert_eq!(dispatcher.run_cycle(now + tick), CycleOutcome::Disabled);
    }

    assert_eq!(stack.queue.stats().enqueued, 0);
    assert!(stack.transfer.attempts().is_empty());
}

#[tokio::test]
async fn pools_share_a_queue_but_not_candidates() {
    let node = small_node(5, 10);
    let stack = TestStack::start(&node, 2);
    let now = current_time_us();
    stack.probe_healthy("default", now);

    stack.add_pending(ResourceKind::LfsObject, 1, "default", now);
    stack.add_pending(ResourceKind::Repository, 2, "default", now);

    let blob = stack.dispatcher(node.clone(), CapacityPool::Blob);
    let repo = stack.dispatcher(node, CapacityPool::Repository);

    assert_eq!(blob.run_cycle(now).jobs_enqueued(), 1);
    assert_eq!(repo.run_cycle(now).jobs_enqueued(), 1);
    stack.wait_for_drain().await;

    assert_eq!(stack.registry.counts().synced, 2);
}

#[tokio::test]
async fn contended_lease_makes_cycle_a_noop() {
    let node = small_node(5, 10);
    let stack = TestStack::start(&node, 2);
    let now = current_time_us();
    stack.probe_healthy("default", now);
    stack.add_pending(ResourceKind::Avatar, 1, "default", now);

    let dispatcher = stack.dispatcher(node, CapacityPool::Blob);
    let foreign = stack
        .leases
        .try_acquire(&dispatcher.lease_key(), "other-process", 60_000_000, now)
        .unwrap();

    assert_eq!(dispatcher.run_cycle(now), CycleOutcome::LeaseHeld);
    assert_eq!(stack.queue.stats().enqueued, 0);

    stack.leases.release(foreign);
    assert_eq!(dispatcher.run_cycle(now + 1).jobs_enqueued(), 1);
    stack.wait_for_drain().await;
}

#[tokio::test]
async fn empty_backlog_backs_off_until_expiry() {
    let node = NodeConfig {
        backoff_ttl_us: 1_000_000,
        ..small_node(5, 10)
    };
    let stack = TestStack::start(&node, 2);
    let t0 = current_time_us();
    stack.probe_healthy("default", t0);

    let dispatcher = stack.dispatcher(node, CapacityPool::Blob);
    assert_eq!(
        dispatcher.run_cycle(t0),
        CycleOutcome::Completed { jobs_enqueued: 0 }
    );
    assert_eq!(dispatcher.run_cycle(t0 + 500_000), CycleOutcome::Backoff);

    // after expiry, new work is picked up
    stack.add_pending(ResourceKind::Avatar, 1, "default", t0);
    let later = t0 + 1_500_000;
    stack.probe_healthy("default", later);
    assert_eq!(dispatcher.run_cycle(later).jobs_enqueued(), 1);
    stack.wait_for_drain().await;
}

#[tokio::test]
async fn namespace_move_stops_future_scheduling() {
    let node = NodeConfig {
        selective_sync: SelectiveSync::Namespaces([5].into_iter().collect()),
        ..small_node(5, 10)
    };
    let stack = TestStack::start(&node, 2);
    let now = current_time_us();
    stack.probe_healthy("default", now);

    let key = ResourceKey::new(ResourceKind::Repository, 1);
    stack.registry.upsert_pending(key, "default", Some(9), now);

    let dispatcher = stack.dispatcher(node, CapacityPool::Repository);
    assert_eq!(dispatcher.run_cycle(now).jobs_enqueued(), 0);

    // moved into a replicated namespace: now eligible
    stack.registry.upsert_pending(key, "default", Some(5), now);
    assert_eq!(dispatcher.run_cycle(now + 1).jobs_enqueued(), 1);
    stack.wait_for_drain().await;
}

#[test]
fn node_config_round_trips_through_json() {
    let node = NodeConfig {
        node_name: "secondary-3".to_string(),
        max_file_capacity: 4,
        selective_sync: SelectiveSync::Shards(["nfs1".to_string()].into_iter().collect()),
        ..Default::default()
    };

    let json = serde_json::to_string(&node).unwrap();
    let back: NodeConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.node_name, "secondary-3");
    assert_eq!(back.max_file_capacity, 4);
    assert_eq!(back.selective_sync, node.selective_sync);
}
