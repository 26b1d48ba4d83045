//! Shard health tracking and selective-sync policy.
//!
//! Candidate resources are only schedulable when their storage shard passed a
//! recent liveness probe and the node's selective-sync configuration includes
//! their shard or namespace.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Selective-sync configuration: which subset of resources this node
/// replicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectiveSync {
    /// Replicate everything.
    Everything,
    /// Replicate only resources on the named shards.
    Shards(HashSet<String>),
    /// Replicate only resources owned by the listed namespaces. Resources
    /// with no owning namespace are excluded under this mode.
    Namespaces(HashSet<u64>),
}

impl SelectiveSync {
    /// Returns true if the policy includes the given shard.
    pub fn includes_shard(&self, shard: &str) -> bool {
        match self {
            Self::Everything | Self::Namespaces(_) => true,
            Self::Shards(shards) => shards.contains(shard),
        }
    }

    /// Returns true if the policy includes the given namespace.
    pub fn includes_namespace(&self, namespace_id: Option<u64>) -> bool {
        match self {
            Self::Everything | Self::Shards(_) => true,
            Self::Namespaces(namespaces) => match namespace_id {
                Some(id) => namespaces.contains(&id),
                None => false,
            },
        }
    }
}

impl Default for SelectiveSync {
    fn default() -> Self {
        Self::Everything
    }
}

/// Result of the most recent liveness probe for one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProbeRecord {
    healthy: bool,
    recorded_at_us: u64,
}

/// Tracks liveness probes per storage shard.
///
/// A shard is healthy iff its most recent probe succeeded and is younger
/// than `probe_ttl_us`. A shard with no probe, a failed probe, or a stale
/// probe yields zero schedulable work.
pub struct ShardHealthTracker {
    probe_ttl_us: u64,
    probes: HashMap<String, ProbeRecord>,
}

impl ShardHealthTracker {
    /// Create a tracker; probes older than `probe_ttl_us` count as unhealthy.
    pub fn new(probe_ttl_us: u64) -> Self {
        Self {
            probe_ttl_us,
            probes: HashMap::new(),
        }
    }

    /// Record the outcome of a liveness probe for a shard.
    pub fn record_probe(&mut self, shard: &str, healthy: bool, now_us: u64) {
        if !healthy {
            warn!(shard = shard, "shard liveness probe failed");
        }
        self.probes.insert(
            shard.to_string(),
            ProbeRecord {
                healthy,
                recorded_at_us: now_us,
            },
        );
    }

    /// Returns true if the shard's last probe succeeded and is fresh.
    pub fn is_healthy(&self, shard: &str, now_us: u64) -> bool {
        match self.probes.get(shard) {
            Some(record) => {
                record.healthy && now_us.saturating_sub(record.recorded_at_us) < self.probe_ttl_us
            }
            None => false,
        }
    }

    /// Set of shard names currently passing the liveness probe.
    pub fn healthy_shards(&self, now_us: u64) -> HashSet<String> {
        self.probes
            .iter()
            .filter(|(name, _)| self.is_healthy(name, now_us))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Per-cycle snapshot combining shard health and selective sync.
///
/// Built once at the start of a dispatch cycle; a resource whose project
/// moved into an excluded namespace is rejected here even if it was
/// scheduled in an earlier cycle.
#[derive(Debug, Clone)]
pub struct ShardGate {
    healthy: HashSet<String>,
    selective: SelectiveSync,
}

impl ShardGate {
    /// Create a gate from a healthy-shard snapshot and the sync policy.
    pub fn new(healthy: HashSet<String>, selective: SelectiveSync) -> Self {
        Self { healthy, selective }
    }

    /// Snapshot the tracker at `now_us` and combine with the policy.
    pub fn from_tracker(
        tracker: &ShardHealthTracker,
        selective: SelectiveSync,
        now_us: u64,
    ) -> Self {
        Self::new(tracker.healthy_shards(now_us), selective)
    }

    /// Returns true if a resource on `shard` owned by `namespace_id` may be
    /// scheduled.
    pub fn allows(&self, shard: &str, namespace_id: Option<u64>) -> bool {
        self.healthy.contains(shard)
            && self.selective.includes_shard(shard)
            && self.selective.includes_namespace(namespace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn everything_includes_all() {
        let policy = SelectiveSync::Everything;
        assert!(policy.includes_shard("any"));
        assert!(policy.includes_namespace(Some(1)));
        assert!(policy.includes_namespace(None));
    }

    #[test]
    fn shard_policy_filters_shards_only() {
        let policy = SelectiveSync::Shards(shards(&["nfs1"]));
        assert!(policy.includes_shard("nfs1"));
        assert!(!policy.includes_shard("nfs2"));
        assert!(policy.includes_namespace(None));
        assert!(policy.includes_namespace(Some(99)));
    }

    #[test]
    fn namespace_policy_filters_namespaces_only() {
        let policy = SelectiveSync::Namespaces([5, 6].into_iter().collect());
        assert!(policy.includes_shard("anything"));
        assert!(policy.includes_namespace(Some(5)));
        assert!(!policy.includes_namespace(Some(7)));
    }

    #[test]
    fn namespace_policy_excludes_resources_without_namespace() {
        let policy = SelectiveSync::Namespaces([5].into_iter().collect());
        assert!(!policy.includes_namespace(None));
    }

    #[test]
    fn tracker_unknown_shard_is_unhealthy() {
        let tracker = ShardHealthTracker::new(10_000);
        assert!(!tracker.is_healthy("default", 1_000));
    }

    #[test]
    fn tracker_healthy_probe_within_ttl() {
        let mut tracker = ShardHealthTracker::new(10_000);
        tracker.record_probe("default", true, 1_000);
        assert!(tracker.is_healthy("default", 5_000));
    }

    #[test]
    fn tracker_stale_probe_is_unhealthy() {
        let mut tracker = ShardHealthTracker::new(10_000);
        tracker.record_probe("default", true, 1_000);
        assert!(!tracker.is_healthy("default", 11_000));
    }

    #[test]
    fn tracker_failed_probe_is_unhealthy() {
        let mut tracker = ShardHealthTracker::new(10_000);
        tracker.record_probe("default", false, 1_000);
        assert!(!tracker.is_healthy("default", 1_500));
    }

    #[test]
    fn tracker_recovery_after_failed_probe() {
        let mut tracker = ShardHealthTracker::new(10_000);
        tracker.record_probe("default", false, 1_000);
        tracker.record_probe("default", true, 2_000);
        assert!(tracker.is_healthy("default", 2_500));
    }

    #[test]
    fn healthy_shards_snapshot() {
        let mut tracker = ShardHealthTracker::new(10_000);
        tracker.record_probe("a", true, 1_000);
        tracker.record_probe("b", false, 1_000);
        tracker.record_probe("c", true, 1_000);

        let healthy = tracker.healthy_shards(2_000);
        assert_eq!(healthy, shards(&["a", "c"]));
    }

    #[test]
    fn gate_requires_health_and_inclusion() {
        let gate = ShardGate::new(shards(&["a"]), SelectiveSync::Shards(shards(&["a", "b"])));
        assert!(gate.allows("a", None));
        // included but unhealthy
        assert!(!gate.allows("b", None));
        // healthy set can't rescue an excluded shard
        assert!(!gate.allows("c", None));
    }

    #[test]
    fn gate_rejects_excluded_namespace() {
        let gate = ShardGate::new(
            shards(&["a"]),
            SelectiveSync::Namespaces([1].into_iter().collect()),
        );
        assert!(gate.allows("a", Some(1)));
        assert!(!gate.allows("a", Some(2)));
        assert!(!gate.allows("a", None));
    }

    #[test]
    fn gate_from_tracker_snapshot() {
        let mut tracker = ShardHealthTracker::new(10_000);
        tracker.record_probe("a", true, 1_000);
        tracker.record_probe("b", true, 1_000);

        let gate = ShardGate::from_tracker(&tracker, SelectiveSync::Everything, 2_000);
        assert!(gate.allows("a", None));
        assert!(gate.allows("b", None));

        // snapshot does not see later probe results
        let stale_gate = ShardGate::from_tracker(&tracker, SelectiveSync::Everything, 20_000);
        assert!(!stale_gate.allows("a", None));
    }
}
