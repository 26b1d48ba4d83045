#![warn(missing_docs)]

//! Backsync scheduler subsystem: capacity-bounded dispatch of replication
//! backfill jobs on a secondary node.
//!
//! The dispatcher periodically scans the registry for pending or
//! retry-eligible resources, filters them through the shard health gate, and
//! enqueues a bounded number of sync jobs, holding an exclusive lease for the
//! duration of each cycle and backing off when no work exists.

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lease;
pub mod queue;
pub mod worker;

pub use backoff::{BackoffCache, RetryPolicy};
pub use config::{CapacityPool, DispatcherConfig, NodeConfig};
pub use dispatcher::{BackfillDispatcher, CycleOutcome, DispatchState, DispatcherStats};
pub use error::{ConfigError, LeaseError, QueueError, TransferError};
pub use lease::LeaseManager;
pub use queue::{InProcessQueue, JobId, JobQueue, JobStatus, QueueStats, SyncJob};
pub use worker::{SyncAttempt, SyncWorker, Transfer, TransferOutcome};
