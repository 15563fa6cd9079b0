//! Resource lifecycle: endpoint progression and change planning.

mod plan;

pub use crate::resources::EndpointLifecycle;
pub use plan::{plan, summarize, ChangeAction, ChangeSet, ResourceChange};
