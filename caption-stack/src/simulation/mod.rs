//! In-memory deployment target.
//!
//! [`ControlPlane`] deploys a synthesized [`crate::stack::Stack`] the way the
//! provisioning service would: in creation order, resolving intrinsics
//! against resources that already exist. Object uploads and bus events then
//! reach the deployed functions through the same notification
//! configurations, permissions and rules the template declares, and each
//! function's calls are checked against its role's grants.
//!
//! ```rust,ignore
//! let cloud = ControlPlane::new(CloudEnvironment::default());
//! cloud.register_pipeline("CaptionModelPipeline");
//! cloud.register_handler(ids::TRIGGER_FUNCTION, Arc::new(TriggerPipeline));
//! cloud.deploy(&stack)?;
//! let invocations = cloud.put_object(&ingest, "train-images/cat.jpg", 1024).await?;
//! ```

mod client;
mod control_plane;
pub mod handlers;
mod records;


pub use client::{CreateEndpointConfigRequest, CreateModelRequest, ServiceClient};
pub use control_plane::{ControlPlane, TeardownReport};
pub use handlers::{
    object_keys, DeployLatestModel, FunctionHandler, Invocation, InvocationContext, InvocationOutcome,
    InvocationSource, TriggerPipeline, MODEL_ARTIFACT,
};
pub use records::{
    CloudEnvironment, DeployedResource, EndpointConfigRecord, EndpointRecord, FunctionRecord, ModelRecord,
    ObjectSummary, PermissionRecord, PipelineExecution, RoleRecord, RuleRecord, StackDeployment, VariantRecord,
};
