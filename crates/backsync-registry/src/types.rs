//! Core identifiers for replicable resources.

use serde::{Deserialize, Serialize};

/// The kind of a replicable resource tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// User or group avatar image.
    Avatar,
    /// Large-file-storage object.
    LfsObject,
    /// Build job artifact.
    JobArtifact,
    /// Package registry file.
    PackageFile,
    /// Git repository.
    Repository,
    /// Design-management repository.
    DesignRepository,
}

impl ResourceKind {
    /// Returns true for repository-like kinds (synced via git transfer),
    /// false for blob-like kinds (synced via file download).
    /// Repository-like jobs draw from the repository capacity pool.
    pub fn is_repository(&self) -> bool {
        matches!(self, Self::Repository | Self::DesignRepository)
    }

    /// Short lowercase name used in log fields and lease keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Avatar => "avatar",
            Self::LfsObject => "lfs_object",
            Self::JobArtifact => "job_artifact",
            Self::PackageFile => "package_file",
            Self::Repository => "repository",
            Self::DesignRepository => "design_repository",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identity of one replicable resource: (kind, id).
/// The registry holds exactly one entry per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// The resource kind.
    pub kind: ResourceKind,
    /// The resource's numeric ID within its kind.
    pub id: u64,
}

impl ResourceKey {
    /// Create a new resource key.
    pub fn new(kind: ResourceKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Get current time in microseconds since Unix epoch.
pub fn current_time_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}
