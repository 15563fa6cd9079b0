//! Testing utilities for the caption stack.
//!
//! This module provides:
//! - A deployed control plane fixture
//! - Mock function handlers
//! - Stack assertions

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_depends_on, assert_invocation_failed, assert_invocation_succeeded, assert_resource_count};
pub use fixtures::TestCloud;
pub use mocks::{FailingHandler, RecordingHandler};
