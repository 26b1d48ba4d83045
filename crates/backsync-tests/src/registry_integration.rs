//! Registry crate integration tests.
//!
//! Exercises the registry, shard gate, and selective sync through their
//! public API the way the scheduler uses them.

use std::collections::HashSet;

use backsync_registry::{
    KindFilter, RegistryStore, ResourceKey, ResourceKind, SelectiveSync, ShardGate,
    ShardHealthTracker, SyncState,
};

fn open_gate(shard: &str) -> ShardGate {
    ShardGate::new(
        [shard.to_string()].into_iter().collect(),
        SelectiveSync::Everything,
    )
}

#[test]
fn one_entry_per_key_across_kinds() {
    let store = RegistryStore::new();
    // same numeric ID under different kinds is two distinct resources
    store.upsert_pending(ResourceKey::new(ResourceKind::Avatar, 1), "a", None, 100);
    store.upsert_pending(ResourceKey::new(ResourceKind::LfsObject, 1), "a", None, 100);
    store.upsert_pending(ResourceKey::new(ResourceKind::Avatar, 1), "a", None, 200);

    assert_eq!(store.len(), 2);
}

#[test]
fn lifecycle_counts_progression() -> anyhow::Result<()> {
    let store = RegistryStore::new();
    let key = ResourceKey::new(ResourceKind::Repository, 1);
    store.upsert_pending(key, "a", None, 100);
    assert_eq!(store.counts().pending, 1);

    store.mark_failed(key, "clone failed", Some(5_000), 200)?;
    assert_eq!(store.counts().failed, 1);

    store.mark_synced(key, 1_024, false, 6_000)?;
    assert_eq!(store.counts().synced, 1);
    assert_eq!(store.counts().total(), 1);
    Ok(())
}

#[test]
fn selection_is_deterministic_across_calls() {
    let store = RegistryStore::new();
    let gate = open_gate("a");
    for id in 1..=10 {
        store.upsert_pending(ResourceKey::new(ResourceKind::Avatar, id), "a", None, 100 + id);
    }

    let first = store.pending_or_failed(&gate, KindFilter::All, 5, &HashSet::new(), 1_000);
    let second = store.pending_or_failed(&gate, KindFilter::All, 5, &HashSet::new(), 1_000);
    assert_eq!(first, second);
}

#[test]
fn stale_probe_gates_out_a_whole_shard() {
    let mut tracker = ShardHealthTracker::new(1_000);
    tracker.record_probe("a", true, 0);

    let store = RegistryStore::new();
    store.upsert_pending(ResourceKey::new(ResourceKind::Avatar, 1), "a", None, 100);

    let fresh = ShardGate::from_tracker(&tracker, SelectiveSync::Everything, 500);
    assert_eq!(
        store
            .pending_or_failed(&fresh, KindFilter::All, 10, &HashSet::new(), 500)
            .len(),
        1
    );

    let stale = ShardGate::from_tracker(&tracker, SelectiveSync::Everything, 2_000);
    assert!(store
        .pending_or_failed(&stale, KindFilter::All, 10, &HashSet::new(), 2_000)
        .is_empty());
}

#[test]
fn namespace_move_excludes_previously_eligible_entry() {
    let store = RegistryStore::new();
    let gate = ShardGate::new(
        ["a".to_string()].into_iter().collect(),
        SelectiveSync::Namespaces([5].into_iter().collect()),
    );

    let key = ResourceKey::new(ResourceKind::Repository, 1);
    store.upsert_pending(key, "a", Some(5), 100);
    assert_eq!(
        store
            .pending_or_failed(&gate, KindFilter::All, 10, &HashSet::new(), 1_000)
            .len(),
        1
    );

    // project moved into a namespace this node does not replicate
    store.upsert_pending(key, "a", Some(9), 200);
    assert!(store
        .pending_or_failed(&gate, KindFilter::All, 10, &HashSet::new(), 1_000)
        .is_empty());
}

#[test]
fn retry_state_survives_selection_roundtrip() -> anyhow::Result<()> {
    let store = RegistryStore::new();
    let gate = open_gate("a");
    let key = ResourceKey::new(ResourceKind::PackageFile, 1);
    store.upsert_pending(key, "a", None, 100);
    store.mark_failed(key, "timeout", Some(2_000), 500)?;

    let batch = store.pending_or_failed(&gate, KindFilter::All, 10, &HashSet::new(), 3_000);
    assert_eq!(batch.len(), 1);
    match &batch[0].state {
        SyncState::Failed {
            retry_count,
            last_error,
            ..
        } => {
            assert_eq!(*retry_count, 1);
            assert_eq!(last_error, "timeout");
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    Ok(())
}

#[test]
fn removed_entry_is_gone_from_selection() {
    let store = RegistryStore::new();
    let gate = open_gate("a");
    let key = ResourceKey::new(ResourceKind::Avatar, 1);
    store.upsert_pending(key, "a", None, 100);
    store.remove(key);

    assert!(store
        .pending_or_failed(&gate, KindFilter::All, 10, &HashSet::new(), 1_000)
        .is_empty());
    assert!(store.is_empty());
}
