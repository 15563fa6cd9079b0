//! Utility functions for graph validation, wildcard matching and timestamps.

pub mod glob;
pub mod timestamps;
pub mod validation;

pub use glob::glob_match;
pub use timestamps::{event_time, iso_timestamp, now_utc, Timestamp};
pub use validation::{topological_order, validate_all, DependencyEdges};
