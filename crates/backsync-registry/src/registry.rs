//! Per-resource replication registry.
//!
//! The registry is the single source of truth for the sync state of every
//! replicable resource on a secondary node. It supports concurrent reads
//! (candidate selection) and writes (state transitions) without lost updates,
//! and selects schedulable candidates by interleaving never-attempted entries
//! with retry-eligible failed entries so that neither class starves the other.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::shard::ShardGate;
use crate::types::{ResourceKey, ResourceKind};

/// Sync state of one registry entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncState {
    /// Never successfully synced; awaiting first (or reset) sync attempt.
    Pending,
    /// Last sync attempt failed.
    Failed {
        /// Earliest time the entry becomes retry-eligible. `None` means
        /// immediately eligible.
        retry_at_us: Option<u64>,
        /// Number of failed attempts so far.
        retry_count: u32,
        /// Message from the last failure.
        last_error: String,
    },
    /// Successfully synced.
    Synced {
        /// Bytes transferred by the successful sync.
        bytes_transferred: u64,
        /// True if the resource was confirmed absent on the primary
        /// (nothing to transfer; the entry is considered in sync).
        missing_on_primary: bool,
    },
}

impl SyncState {
    /// Returns true if the entry is retry-eligible at `now_us`:
    /// pending, or failed with `retry_at_us` unset or in the past.
    pub fn schedulable_at(&self, now_us: u64) -> bool {
        match self {
            Self::Pending => true,
            Self::Failed { retry_at_us, .. } => match retry_at_us {
                None => true,
                Some(at) => *at <= now_us,
            },
            Self::Synced { .. } => false,
        }
    }
}

/// One resource's tracked sync state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Resource identity.
    pub key: ResourceKey,
    /// Current sync state.
    pub state: SyncState,
    /// Storage shard the resource lives on.
    pub shard: String,
    /// Owning namespace, if any (used by selective sync).
    pub namespace_id: Option<u64>,
    /// When the entry was first created (microseconds).
    pub created_at_us: u64,
    /// When the last sync attempt finished (microseconds), if any.
    pub last_attempt_us: Option<u64>,
}

/// Snapshot of entry counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    /// Entries in `Pending`.
    pub pending: u64,
    /// Entries in `Failed`.
    pub failed: u64,
    /// Entries in `Synced`.
    pub synced: u64,
}

impl RegistryCounts {
    /// Total number of entries.
    pub fn total(&self) -> u64 {
        self.pending + self.failed + self.synced
    }
}

/// Restricts candidate selection to one capacity pool's resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindFilter {
    /// All kinds.
    All,
    /// Blob-like kinds only (files, artifacts, packages).
    Blobs,
    /// Repository-like kinds only.
    Repositories,
}

impl KindFilter {
    /// Returns true if `kind` passes this filter.
    pub fn matches(&self, kind: ResourceKind) -> bool {
        match self {
            Self::All => true,
            Self::Blobs => !kind.is_repository(),
            Self::Repositories => kind.is_repository(),
        }
    }
}

/// Concurrent per-resource sync-state store.
///
/// Exactly one entry per `ResourceKey`. Entries are created on first sight,
/// mutated by the sync worker on each attempt, and removed only when the
/// owning resource is destroyed.
pub struct RegistryStore {
    entries: DashMap<ResourceKey, RegistryEntry>,
}

impl RegistryStore {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Create an entry in `Pending`, or reset an existing entry to `Pending`.
    /// Idempotent: calling twice for the same key leaves one pending entry.
    pub fn upsert_pending(
        &self,
        key: ResourceKey,
        shard: &str,
        namespace_id: Option<u64>,
        now_us: u64,
    ) {
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.state = SyncState::Pending;
                entry.shard = shard.to_string();
                entry.namespace_id = namespace_id;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(RegistryEntry {
                    key,
                    state: SyncState::Pending,
                    shard: shard.to_string(),
                    namespace_id,
                    created_at_us: now_us,
                    last_attempt_us: None,
                });
            }
        }
    }

    /// Get a snapshot of one entry.
    pub fn get(&self, key: ResourceKey) -> Option<RegistryEntry> {
        self.entries.get(&key).map(|e| e.value().clone())
    }

    /// Record a successful sync. Idempotent.
    pub fn mark_synced(
        &self,
        key: ResourceKey,
        bytes_transferred: u64,
        missing_on_primary: bool,
        now_us: u64,
    ) -> RegistryResult<()> {
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or(RegistryError::EntryNotFound { key })?;
        entry.state = SyncState::Synced {
            bytes_transferred,
            missing_on_primary,
        };
        entry.last_attempt_us = Some(now_us);
        debug!(key = %key, bytes = bytes_transferred, "registry entry synced");
        Ok(())
    }

    /// Record a failed sync attempt. The retry count carries over from a
    /// previous failure; a failure after `Pending` or `Synced` starts at 1.
    pub fn mark_failed(
        &self,
        key: ResourceKey,
        error: &str,
        retry_at_us: Option<u64>,
        now_us: u64,
    ) -> RegistryResult<()> {
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or(RegistryError::EntryNotFound { key })?;
        let retry_count = match &entry.state {
            SyncState::Failed { retry_count, .. } => retry_count + 1,
            _ => 1,
        };
        entry.state = SyncState::Failed {
            retry_at_us,
            retry_count,
            last_error: error.to_string(),
        };
        entry.last_attempt_us = Some(now_us);
        debug!(key = %key, retry_count, "registry entry failed");
        Ok(())
    }

    /// Number of failed attempts recorded for a key (0 if not failed).
    pub fn retry_count(&self, key: ResourceKey) -> u32 {
        match self.entries.get(&key).map(|e| e.state.clone()) {
            Some(SyncState::Failed { retry_count, .. }) => retry_count,
            _ => 0,
        }
    }

    /// Remove an entry (owning resource destroyed). Returns true if present.
    pub fn remove(&self, key: ResourceKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of counts by state.
    pub fn counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for entry in self.entries.iter() {
            match entry.state {
                SyncState::Pending => counts.pending += 1,
                SyncState::Failed { .. } => counts.failed += 1,
                SyncState::Synced { .. } => counts.synced += 1,
            }
        }
        counts
    }

    /// Select up to `limit` schedulable candidates at `now_us`.
    ///
    /// Pending entries and retry-eligible failed entries are interleaved
    /// one-for-one so a backlog of poison retries cannot stall the backfill
    /// of never-attempted resources (and vice versa). Within each class,
    /// selection is ordered by creation time then key, so repeated scans are
    /// deterministic. Entries whose shard or namespace the gate rejects, and
    /// keys in `exclude` (already-outstanding jobs), are skipped. Failed
    /// entries with `retry_at_us` in the future are never returned.
    pub fn pending_or_failed(
        &self,
        gate: &ShardGate,
        filter: KindFilter,
        limit: usize,
        exclude: &HashSet<ResourceKey>,
        now_us: u64,
    ) -> Vec<RegistryEntry> {
        if limit == 0 {
            return Vec::new();
        }

        let mut pending: Vec<RegistryEntry> = Vec::new();
        let mut retryable: Vec<RegistryEntry> = Vec::new();

        for entry in self.entries.iter() {
            if !filter.matches(entry.key.kind) || exclude.contains(&entry.key) {
                continue;
            }
            if !entry.state.schedulable_at(now_us) {
                continue;
            }
            if !gate.allows(&entry.shard, entry.namespace_id) {
                continue;
            }
            match entry.state {
                SyncState::Pending => pending.push(entry.value().clone()),
                SyncState::Failed { .. } => retryable.push(entry.value().clone()),
                SyncState::Synced { .. } => {}
            }
        }

        let order = |e: &RegistryEntry| (e.created_at_us, e.key.kind.as_str(), e.key.id);
        pending.sort_by_key(order);
        retryable.sort_by_key(order);

        let mut batch = Vec::with_capacity(limit.min(pending.len() + retryable.len()));
        let mut pending_iter = pending.into_iter();
        let mut retry_iter = retryable.into_iter();
        loop {
            let mut exhausted = true;
            if let Some(entry) = pending_iter.next() {
                batch.push(entry);
                exhausted = false;
                if batch.len() == limit {
                    break;
                }
            }
            if let Some(entry) = retry_iter.next() {
                batch.push(entry);
                exhausted = false;
                if batch.len() == limit {
                    break;
                }
            }
            if exhausted {
                break;
            }
        }
        batch
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}
