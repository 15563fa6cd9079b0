//! Typed resource descriptors that lower into template resources.

mod functions;
pub mod iam;
mod inference;
mod rules;
mod security;
mod storage;

pub use functions::{
    CodeLocation, DeployEnvironment, FunctionRef, FunctionSpec, Runtime, VpcConfigValue, PIPELINE_NAME,
};
pub use iam::{
    grants_from_document, is_allowed, Effect, Grant, ManagedPolicy, PolicyStatement, Role, RoleRef, ServicePrincipal,
};
pub use inference::{
    CaptureMode, DataCaptureConfig, EndpointConfigSpec, EndpointLifecycle, EndpointSpec, InferenceChain,
    InferenceRefs, ModelSpec, ProductionVariant,
};
pub use rules::EventRuleSpec;
pub use security::{IngressRule, SecurityGroup, VpcPlacement, HTTPS_PORT};
pub use storage::{ArtifactLocation, AutoDeleteProvider, BucketRef, BucketSpec, AUTO_DELETE_TAG};
