//! Sync worker: executes one resource's transfer and records the result.
//!
//! All transfer failures are contained here and converted into registry
//! state transitions. The dispatcher never sees an exception from an
//! individual resource sync; it observes outcomes through the registry and
//! job-status lookups only.

use std::sync::Arc;

use tracing::{info, warn};

use backsync_registry::{RegistryStore, ResourceKey};

use crate::backoff::RetryPolicy;
use crate::error::TransferError;

/// Result of a successful transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes moved to this node.
    pub bytes_transferred: u64,
    /// True if the primary confirmed the resource has no data to transfer;
    /// the entry is recorded as synced with zero bytes.
    pub missing_on_primary: bool,
}

/// Moves one resource's data from the primary to this node and verifies it.
pub trait Transfer: Send + Sync {
    /// Perform the transfer. `TransferError::NotFound` means the resource is
    /// absent and must not be treated as a sync failure.
    fn transfer(&self, key: ResourceKey) -> Result<TransferOutcome, TransferError>;
}

/// Summary of one sync attempt, for observability. Not an error type: every
/// attempt returns normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAttempt {
    /// Transfer succeeded and the registry entry is now `Synced`.
    Synced {
        /// Bytes transferred.
        bytes_transferred: u64,
    },
    /// The resource no longer exists; logged, registry untouched.
    MissingResource,
    /// Transfer failed; the registry entry is now `Failed` with a computed
    /// retry time.
    Failed {
        /// When the entry becomes retry-eligible.
        retry_at_us: u64,
    },
    /// The registry entry disappeared mid-flight (owning resource
    /// destroyed); nothing to record.
    Untracked,
}

/// Executes sync jobs against the registry.
pub struct SyncWorker {
    registry: Arc<RegistryStore>,
    transfer: Arc<dyn Transfer>,
    retry: RetryPolicy,
}

impl SyncWorker {
    /// Create a worker over the given registry and transfer backend.
    pub fn new(registry: Arc<RegistryStore>, transfer: Arc<dyn Transfer>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            transfer,
            retry,
        }
    }

    /// Sync one resource. Performs exactly one registry mutation, except for
    /// the missing-resource and untracked cases which perform none.
    pub fn execute(&self, key: ResourceKey, now_us: u64) -> SyncAttempt {
        match self.transfer.transfer(key) {
            Ok(outcome) => {
                match self.registry.mark_synced(
                    key,
                    outcome.bytes_transferred,
                    outcome.missing_on_primary,
                    now_us,
                ) {
                    Ok(()) => {
                        info!(
                            key = %key,
                            bytes = outcome.bytes_transferred,
                            missing_on_primary = outcome.missing_on_primary,
                            "resource synced"
                        );
                        SyncAttempt::Synced {
                            bytes_transferred: outcome.bytes_transferred,
                        }
                    }
                    Err(_) => {
                        warn!(key = %key, "synced resource is no longer tracked");
                        SyncAttempt::Untracked
                    }
                }
            }
            Err(TransferError::NotFound) => {
                info!(key = %key, "resource not found, skipping");
                SyncAttempt::MissingResource
            }
            Err(err) => {
                let attempts = self.registry.retry_count(key) + 1;
                let retry_at_us = self.retry.retry_at_us(attempts, now_us);
                match self
                    .registry
                    .mark_failed(key, &err.to_string(), Some(retry_at_us), now_us)
                {
                    Ok(()) => {
                        warn!(key = %key, error = %err, retry_at_us, "sync failed");
                        SyncAttempt::Failed { retry_at_us }
                    }
                    Err(_) => {
                        warn!(key = %key, "failed resource is no longer tracked");
                        SyncAttempt::Untracked
                    }
                }
            }
        }
    }
}
