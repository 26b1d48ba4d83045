//! Error types for the registry subsystem.

use thiserror::Error;

use crate::types::ResourceKey;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur in registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No entry exists for the given resource key.
    #[error("no registry entry for {key}")]
    EntryNotFound {
        /// The key that was not found.
        key: ResourceKey,
    },
}
