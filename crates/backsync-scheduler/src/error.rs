//! Error types for the scheduler subsystem.

use thiserror::Error;

/// Errors from a single resource transfer attempt.
///
/// These never cross the sync-worker boundary: the worker converts them into
/// registry state transitions.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The resource no longer exists on the primary or locally. Non-fatal;
    /// the registry entry is left untouched.
    #[error("resource not found")]
    NotFound,

    /// Local I/O error while writing the transferred data.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The transferred data failed post-transfer verification.
    #[error("verification failed: {reason}")]
    Verification {
        /// Why verification failed (e.g. checksum mismatch, size mismatch).
        reason: String,
    },

    /// The primary rejected or aborted the transfer.
    #[error("remote error: {msg}")]
    Remote {
        /// Message from the remote side.
        msg: String,
    },
}

/// Errors from the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue has been shut down; no further jobs are accepted.
    #[error("queue is shut down")]
    Shutdown,
}

/// Errors from the exclusive lease manager.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Another holder currently owns the lease for this key.
    #[error("lease for {key} held by {holder}")]
    Held {
        /// The contended lease key.
        key: String,
        /// The current holder's identity.
        holder: String,
    },

    /// The lease ID is unknown, expired, or already released.
    #[error("lease {lease_id} not held")]
    NotHeld {
        /// The lease ID that was not found.
        lease_id: u64,
    },
}

/// Errors from node configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A capacity setting is zero.
    #[error("capacity for {pool} pool must be greater than zero")]
    ZeroCapacity {
        /// The pool with the invalid capacity.
        pool: &'static str,
    },

    /// The database retrieve batch size is zero.
    #[error("db_retrieve_batch_size must be greater than zero")]
    ZeroBatchSize,
}
