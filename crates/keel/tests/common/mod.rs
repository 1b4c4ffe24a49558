//! Shared test utilities for keel integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring an in-memory cluster and repository to a controller
//! - Builder patterns for Applications, Projects and manifests

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
