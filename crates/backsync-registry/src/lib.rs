#![warn(missing_docs)]

//! Backsync registry subsystem: per-resource replication state tracking,
//! shard health gating, and selective-sync policy for a secondary node.

pub mod error;
pub mod registry;
pub mod shard;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use registry::{KindFilter, RegistryCounts, RegistryEntry, RegistryStore, SyncState};
pub use shard::{SelectiveSync, ShardGate, ShardHealthTracker};
pub use types::{current_time_us, ResourceKey, ResourceKind};
