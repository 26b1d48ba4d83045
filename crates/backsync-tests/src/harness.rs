//! Shared fixtures for integration tests.
//!
//! `TestStack` wires a full scheduler stack (registry, health tracker,
//! backoff cache, lease manager, in-process queue) around a
//! [`ScriptedTransfer`] whose per-resource behavior tests control.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use backsync_registry::{
    RegistryStore, ResourceKey, ResourceKind, ShardHealthTracker,
};
use backsync_scheduler::{
    BackfillDispatcher, BackoffCache, CapacityPool, InProcessQueue, JobQueue, LeaseManager,
    NodeConfig, RetryPolicy, SyncWorker, Transfer, TransferError, TransferOutcome,
};

/// Install a fmt subscriber once per test binary. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted behavior for one resource's transfer.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Succeed, reporting this many bytes.
    Succeed {
        /// Bytes reported as transferred.
        bytes: u64,
    },
    /// Succeed after sleeping, to keep the job in flight for a while.
    Slow {
        /// Bytes reported as transferred.
        bytes: u64,
        /// How long the transfer takes.
        delay: Duration,
    },
    /// Report the resource as absent.
    Missing,
    /// Fail with a remote error.
    Fail {
        /// The error message.
        msg: String,
    },
}

/// In-memory [`Transfer`] whose outcome is scripted per resource key.
/// Unscripted keys succeed with 64 bytes. Records every attempt.
pub struct ScriptedTransfer {
    scripts: Mutex<HashMap<ResourceKey, Behavior>>,
    attempts: Mutex<Vec<ResourceKey>>,
}

impl ScriptedTransfer {
    /// Create a transfer with no scripts.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    /// Script the behavior for one key. Replaces any previous script.
    pub fn set(&self, key: ResourceKey, behavior: Behavior) {
        self.scripts.lock().unwrap().insert(key, behavior);
    }

    /// Every key attempted so far, in order.
    pub fn attempts(&self) -> Vec<ResourceKey> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Transfer for ScriptedTransfer {
    fn transfer(&self, key: ResourceKey) -> Result<TransferOutcome, TransferError> {
        self.attempts.lock().unwrap().push(key);
        let behavior = self
            .scripts
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or(Behavior::Succeed { bytes: 64 });
        match behavior {
            Behavior::Succeed { bytes } => Ok(TransferOutcome {
                bytes_transferred: bytes,
                missing_on_primary: false,
            }),
            Behavior::Slow { bytes, delay } => {
                // runs on the blocking pool, so sleeping is fine
                std::thread::sleep(delay);
                Ok(TransferOutcome {
                    bytes_transferred: bytes,
                    missing_on_primary: false,
                })
            }
            Behavior::Missing => Err(TransferError::NotFound),
            Behavior::Fail { msg } => Err(TransferError::Remote { msg }),
        }
    }
}

/// A full scheduler stack over a scripted transfer.
pub struct TestStack {
    /// The shared registry.
    pub registry: Arc<RegistryStore>,
    /// Shard health tracker.
    pub health: Arc<RwLock<ShardHealthTracker>>,
    /// Backoff flag cache.
    pub backoff: Arc<BackoffCache>,
    /// Lease manager shared by all dispatchers of this stack.
    pub leases: Arc<LeaseManager>,
    /// The scripted transfer backend.
    pub transfer: Arc<ScriptedTransfer>,
    /// In-process queue with its worker pool.
    pub queue: Arc<InProcessQueue>,
}

impl TestStack {
    /// Build and start a stack. Must be called inside a tokio runtime.
    /// The retry policy uses a 1-second base delay with no jitter, so
    /// retry times are exact in tests.
    pub fn start(node: &NodeConfig, worker_count: usize) -> Self {
        init_tracing();
        let registry = Arc::new(RegistryStore::new());
        let transfer = ScriptedTransfer::new();
        let worker = Arc::new(SyncWorker::new(
            Arc::clone(&registry),
            transfer.clone() as Arc<dyn Transfer>,
            RetryPolicy {
                base_delay_us: 1_000_000,
                max_delay_us: 3600 * 1_000_000,
                jitter_us: 0,
            },
        ));
        let queue = InProcessQueue::start(worker_count, worker);
        tracing::debug!(workers = worker_count, "test stack started");
        Self {
            registry,
            health: Arc::new(RwLock::new(ShardHealthTracker::new(node.shard_probe_ttl_us))),
            backoff: Arc::new(BackoffCache::new()),
            leases: Arc::new(LeaseManager::new()),
            transfer,
            queue,
        }
    }

    /// Build a dispatcher for one pool over this stack.
    pub fn dispatcher(&self, node: NodeConfig, pool: CapacityPool) -> BackfillDispatcher {
        BackfillDispatcher::new(
            node,
            pool,
            Arc::clone(&self.registry),
            Arc::clone(&self.queue) as Arc<dyn JobQueue>,
            Arc::clone(&self.backoff),
            Arc::clone(&self.leases),
            Arc::clone(&self.health),
        )
    }

    /// Record a healthy probe for a shard.
    pub fn probe_healthy(&self, shard: &str, now_us: u64) {
        self.health.write().unwrap().record_probe(shard, true, now_us);
    }

    /// Create a pending registry entry on a shard with no namespace.
    pub fn add_pending(&self, kind: ResourceKind, id: u64, shard: &str, now_us: u64) {
        self.registry
            .upsert_pending(ResourceKey::new(kind, id), shard, None, now_us);
    }

    /// Wait until the queue has no outstanding jobs.
    pub async fn wait_for_drain(&self) {
        for _ in 0..1_000 {
            if self.queue.outstanding() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not drain");
    }
}
