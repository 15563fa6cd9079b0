//! Stack building and the validated resource graph.
//!
//! This module provides:
//! - A builder that validates each resource as it is declared
//! - The resulting graph with creation/deletion order and dependency queries

mod builder;
mod graph;

pub use builder::StackBuilder;
pub use graph::Stack;
