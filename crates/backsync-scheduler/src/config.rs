//! Node and dispatcher configuration.

use serde::{Deserialize, Serialize};

use backsync_registry::{KindFilter, SelectiveSync};

use crate::error::ConfigError;

/// Which capacity pool a dispatcher instance draws from.
///
/// Blob-like resources (files, artifacts, packages) and repository-like
/// resources are bounded independently; each pool gets its own dispatcher,
/// lease key, and backoff flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityPool {
    /// File downloads: avatars, LFS objects, artifacts, package files.
    Blob,
    /// Git transfers: repositories and design repositories.
    Repository,
}

impl CapacityPool {
    /// Short lowercase name used in lease keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Repository => "repository",
        }
    }

    /// The registry kind filter matching this pool.
    pub fn kind_filter(&self) -> KindFilter {
        match self {
            Self::Blob => KindFilter::Blobs,
            Self::Repository => KindFilter::Repositories,
        }
    }
}

impl std::fmt::Display for CapacityPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node scheduler configuration.
///
/// All tuning values are configuration, not invariants; the defaults below
/// are starting points for a small secondary node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity, used as the lease holder name.
    pub node_name: String,
    /// Whether replication is enabled on this node. When false, every
    /// dispatch cycle is a no-op.
    pub enabled: bool,
    /// Whether the tracking registry is configured. When false, every
    /// dispatch cycle is a no-op.
    pub registry_configured: bool,
    /// Maximum concurrent blob sync jobs. Default is 10.
    pub max_file_capacity: usize,
    /// Maximum concurrent repository sync jobs. Default is 25.
    pub max_repository_capacity: usize,
    /// Maximum candidates fetched from the registry per load. Default is 1000.
    pub db_retrieve_batch_size: usize,
    /// How long an empty scan suppresses re-scanning (microseconds).
    /// Default is 300 seconds.
    pub backoff_ttl_us: u64,
    /// Exclusive lease duration per dispatch cycle (microseconds).
    /// Default is 60 seconds.
    pub lease_duration_us: u64,
    /// Wall-clock budget for one dispatch cycle (microseconds); the cycle
    /// yields back to the scheduler once exceeded. Default is 60 seconds.
    pub cycle_time_budget_us: u64,
    /// How long a shard liveness probe stays fresh (microseconds).
    /// Default is 60 seconds.
    pub shard_probe_ttl_us: u64,
    /// Selective-sync policy restricting what this node replicates.
    pub selective_sync: SelectiveSync,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "secondary".to_string(),
            enabled: true,
            registry_configured: true,
            max_file_capacity: 10,
            max_repository_capacity: 25,
            db_retrieve_batch_size: 1000,
            backoff_ttl_us: 300 * 1_000_000,
            lease_duration_us: 60 * 1_000_000,
            cycle_time_budget_us: 60 * 1_000_000,
            shard_probe_ttl_us: 60 * 1_000_000,
            selective_sync: SelectiveSync::Everything,
        }
    }
}

impl NodeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_file_capacity == 0 {
            return Err(ConfigError::ZeroCapacity { pool: "blob" });
        }
        if self.max_repository_capacity == 0 {
            return Err(ConfigError::ZeroCapacity { pool: "repository" });
        }
        if self.db_retrieve_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }

    /// The capacity ceiling for a pool.
    pub fn max_capacity(&self, pool: CapacityPool) -> usize {
        match pool {
            CapacityPool::Blob => self.max_file_capacity,
            CapacityPool::Repository => self.max_repository_capacity,
        }
    }

    /// Project the dispatcher-facing configuration for one pool.
    pub fn dispatcher_config(&self, pool: CapacityPool) -> DispatcherConfig {
        DispatcherConfig {
            pool,
            max_capacity: self.max_capacity(pool),
            db_retrieve_batch_size: self.db_retrieve_batch_size,
            backoff_ttl_us: self.backoff_ttl_us,
            lease_duration_us: self.lease_duration_us,
            cycle_time_budget_us: self.cycle_time_budget_us,
        }
    }
}

/// Configuration for one dispatcher instance (one capacity pool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// The pool this dispatcher serves.
    pub pool: CapacityPool,
    /// Maximum concurrent sync jobs for this pool.
    pub max_capacity: usize,
    /// Maximum candidates fetched per registry load.
    pub db_retrieve_batch_size: usize,
    /// Backoff-flag TTL after an empty scan (microseconds).
    pub backoff_ttl_us: u64,
    /// Exclusive lease duration (microseconds).
    pub lease_duration_us: u64,
    /// Wall-clock budget per cycle (microseconds).
    pub cycle_time_budget_us: u64,
}
