//! Core building blocks: property expressions and logical IDs.

mod expr;
pub mod ids;

pub use expr::{pseudo, Expr, ResolveError, Resolver};
pub use ids::validate_logical_id;
