//! CloudFormation template model.

mod document;
mod resource;

pub use document::{Output, Parameter, Template, FORMAT_VERSION};
pub use resource::{types, DeletionPolicy, Resource};
