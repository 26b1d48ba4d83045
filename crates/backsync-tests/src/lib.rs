//! Backsync test & validation infrastructure.
//!
//! Cross-crate integration suites for the registry and scheduler crates,
//! plus property-based tests for the registry's candidate selection and the
//! retry backoff policy. Shared fixtures live in [`harness`].

pub mod harness;
pub mod proptest_registry;
pub mod registry_integration;
pub mod scheduler_integration;

pub use harness::{init_tracing, Behavior, ScriptedTransfer, TestStack};
