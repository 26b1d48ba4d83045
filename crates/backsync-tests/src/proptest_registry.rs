//! Property-based tests for candidate selection, retry backoff, and the
//! backoff cache.

use std::collections::HashSet;

use proptest::prelude::*;

use backsync_registry::{
    KindFilter, RegistryStore, ResourceKey, ResourceKind, SelectiveSync, ShardGate, SyncState,
};
use backsync_scheduler::{BackoffCache, RetryPolicy};

/// Generates any resource kind.
pub fn arb_kind() -> impl Strategy<Value = ResourceKind> {
    prop_oneof![
        Just(ResourceKind::Avatar),
        Just(ResourceKind::LfsObject),
        Just(ResourceKind::JobArtifact),
        Just(ResourceKind::PackageFile),
        Just(ResourceKind::Repository),
        Just(ResourceKind::DesignRepository),
    ]
}

fn open_gate() -> ShardGate {
    ShardGate::new(
        ["default".to_string()].into_iter().collect(),
        SelectiveSync::Everything,
    )
}

/// Builds a store with `pending` pending entries (IDs from 0) and `failed`
/// retry-eligible failed entries (IDs from 1000).
fn seeded_store(pending: u64, failed: u64) -> RegistryStore {
    let store = RegistryStore::new();
    for id in 0..pending {
        store.upsert_pending(
            ResourceKey::new(ResourceKind::Avatar, id),
            "default",
            None,
            100 + id,
        );
    }
    for id in 1_000..1_000 + failed {
        let key = ResourceKey::new(ResourceKind::Avatar, id);
        store.upsert_pending(key, "default", None, 100 + id);
        store.mark_failed(key, "x", None, 500).unwrap();
    }
    store
}

proptest! {
    #[test]
    fn selection_never_exceeds_limit(
        pending in 0u64..30,
        failed in 0u64..30,
        limit in 0usize..20,
    ) {
        let store = seeded_store(pending, failed);
        let batch = store.pending_or_failed(&open_gate(), KindFilter::All, limit, &HashSet::new(), 10_000);
        prop_assert!(batch.len() <= limit);
        let expected = limit.min((pending + failed) as usize);
        prop_assert_eq!(batch.len(), expected);
    }

    #[test]
    fn selected_keys_are_unique_and_schedulable(
        pending in 0u64..30,
        failed in 0u64..30,
        limit in 1usize..40,
        now in 1_000u64..100_000,
    ) {
        let store = seeded_store(pending, failed);
        let batch = store.pending_or_failed(&open_gate(), KindFilter::All, limit, &HashSet::new(), now);

        let keys: HashSet<ResourceKey> = batch.iter().map(|e| e.key).collect();
        prop_assert_eq!(keys.len(), batch.len());
        for entry in &batch {
            prop_assert!(entry.state.schedulable_at(now));
        }
    }

    #[test]
    fn future_retries_are_never_selected(
        retry_at in 1_000u64..1_000_000,
        now in 0u64..1_000_000,
    ) {
        let store = RegistryStore::new();
        let key = ResourceKey::new(ResourceKind::Avatar, 1);
        store.upsert_pending(key, "default", None, 100);
        store.mark_failed(key, "x", Some(retry_at), 200).unwrap();

        let batch = store.pending_or_failed(&open_gate(), KindFilter::All, 10, &HashSet::new(), now);
        if now < retry_at {
            prop_assert!(batch.is_empty());
        } else {
            prop_assert_eq!(batch.len(), 1);
        }
    }

    #[test]
    fn both_classes_are_represented(
        pending in 1u64..20,
        failed in 1u64..20,
        limit in 2usize..40,
    ) {
        let store = seeded_store(pending, failed);
        let batch = store.pending_or_failed(&open_gate(), KindFilter::All, limit, &HashSet::new(), 10_000);

        let has_pending = batch.iter().any(|e| matches!(e.state, SyncState::Pending));
        let has_failed = batch.iter().any(|e| matches!(e.state, SyncState::Failed { .. }));
        prop_assert!(has_pending, "pending entries starved");
        prop_assert!(has_failed, "retryable entries starved");
    }

    #[test]
    fn excluded_keys_never_come_back(
        pending in 1u64..30,
        exclude_id in 0u64..30,
    ) {
        let store = seeded_store(pending, 0);
        let excluded = ResourceKey::new(ResourceKind::Avatar, exclude_id);
        let exclude: HashSet<ResourceKey> = [excluded].into_iter().collect();

        let batch = store.pending_or_failed(&open_gate(), KindFilter::All, 100, &exclude, 10_000);
        prop_assert!(batch.iter().all(|e| e.key != excluded));
    }

    #[test]
    fn retry_delay_is_monotone_and_capped(
        base in 1u64..10_000,
        cap_factor in 1u64..100,
        count in 0u32..64,
    ) {
        let policy = RetryPolicy {
            base_delay_us: base,
            max_delay_us: base * cap_factor,
            jitter_us: 0,
        };
        let delay = policy.delay_us(count);
        let next = policy.delay_us(count + 1);
        prop_assert!(delay <= policy.max_delay_us);
        prop_assert!(next >= delay);
    }

    #[test]
    fn backoff_skip_matches_window(
        ttl in 1u64..10_000,
        elapsed in 0u64..20_000,
    ) {
        let cache = BackoffCache::new();
        cache.hold("key", ttl, 1_000_000);
        let now = 1_000_000 + elapsed;
        prop_assert_eq!(cache.skip("key", now), elapsed < ttl);
    }

    #[test]
    fn kind_filter_partitions_kinds(kind in arb_kind()) {
        let blob = KindFilter::Blobs.matches(kind);
        let repo = KindFilter::Repositories.matches(kind);
        prop_assert!(blob != repo);
        prop_assert!(KindFilter::All.matches(kind));
    }
}
