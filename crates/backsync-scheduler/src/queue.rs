//! Job queue abstraction and in-process worker pool.
//!
//! The dispatcher only needs two operations from a queue: `enqueue` and
//! `status_of`. Production deployments can implement [`JobQueue`] atop any
//! message queue; [`InProcessQueue`] is the channel-based worker-pool
//! implementation used for single-process deployments and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use backsync_registry::{current_time_us, ResourceKey};

use crate::error::QueueError;
use crate::worker::SyncWorker;

/// Opaque identifier for an enqueued sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One unit of work: sync a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncJob {
    /// The job's queue identifier.
    pub job_id: JobId,
    /// The resource to sync.
    pub key: ResourceKey,
}

/// Status of an outstanding job. Finished jobs are dropped from the status
/// map, so a missing status means finished (or never known).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Accepted but not yet picked up by a worker.
    Queued,
    /// Currently executing.
    Running,
}

/// The two operations the dispatcher requires from a queue system.
pub trait JobQueue: Send + Sync {
    /// Enqueue a sync job for the resource. Returns the opaque job ID used
    /// for later status lookups.
    fn enqueue(&self, key: ResourceKey) -> Result<JobId, QueueError>;

    /// For each ID, whether the job is still outstanding (queued or
    /// running). Unknown IDs report `false`: a queue restart must not
    /// permanently pin capacity on jobs it no longer knows.
    fn status_of(&self, ids: &[JobId]) -> Vec<bool>;
}

#[derive(Debug)]
struct QueueStatsInner {
    enqueued: AtomicU64,
    started: AtomicU64,
    finished: AtomicU64,
}

impl QueueStatsInner {
    fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            started: AtomicU64::new(0),
            finished: AtomicU64::new(0),
        }
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs accepted by `enqueue`.
    pub enqueued: u64,
    /// Jobs picked up by a worker.
    pub started: u64,
    /// Jobs that finished executing.
    pub finished: u64,
}

/// Channel-based worker pool implementing [`JobQueue`] in-process.
pub struct InProcessQueue {
    feed: RwLock<Option<mpsc::UnboundedSender<SyncJob>>>,
    statuses: Arc<DashMap<JobId, JobStatus>>,
    stats: Arc<QueueStatsInner>,
}

impl InProcessQueue {
    /// Start a pool of `worker_count` tasks executing jobs with `worker`.
    ///
    /// Each job runs `SyncWorker::execute` on the blocking pool; the sync
    /// worker contains all transfer failures, so worker tasks never die on a
    /// bad resource.
    pub fn start(worker_count: usize, worker: Arc<SyncWorker>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<SyncJob>();
        let queue = Arc::new(Self {
            feed: RwLock::new(Some(tx)),
            statuses: Arc::new(DashMap::new()),
            stats: Arc::new(QueueStatsInner::new()),
        });

        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let worker = Arc::clone(&worker);
            let statuses = Arc::clone(&queue.statuses);
            let stats = Arc::clone(&queue.stats);
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };

                    statuses.insert(job.job_id, JobStatus::Running);
                    stats.started.fetch_add(1, Ordering::Relaxed);

                    let w = Arc::clone(&worker);
                    let key = job.key;
                    let _ = tokio::task::spawn_blocking(move || w.execute(key, current_time_us()))
                        .await;

                    statuses.remove(&job.job_id);
                    stats.finished.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        queue
    }

    /// Close the feed; workers drain remaining jobs and exit. Enqueue after
    /// shutdown returns `QueueError::Shutdown`.
    pub fn shutdown(&self) {
        let mut feed = self.feed.write().unwrap();
        *feed = None;
    }

    /// Status of one job (`None` = finished or unknown).
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.statuses.get(&id).map(|s| *s)
    }

    /// Number of jobs currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.statuses.len()
    }

    /// Snapshot of queue counters.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            started: self.stats.started.load(Ordering::Relaxed),
            finished: self.stats.finished.load(Ordering::Relaxed),
        }
    }
}

impl JobQueue for InProcessQueue {
    fn enqueue(&self, key: ResourceKey) -> Result<JobId, QueueError> {
        let feed = self.feed.read().unwrap();
        let sender = feed.as_ref().ok_or(QueueError::Shutdown)?;

        let job = SyncJob {
            job_id: JobId::new(),
            key,
        };
        // status must exist before the job is visible to a worker, so a
        // fast completion cannot leave a ghost Queued entry behind
        self.statuses.insert(job.job_id, JobStatus::Queued);
        if sender.send(job).is_err() {
            self.statuses.remove(&job.job_id);
            return Err(QueueError::Shutdown);
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = %job.job_id, key = %key, "sync job enqueued");
        Ok(job.job_id)
    }

    fn status_of(&self, ids: &[JobId]) -> Vec<bool> {
        ids.iter().map(|id| self.statuses.contains_key(id)).collect()
    }
}
