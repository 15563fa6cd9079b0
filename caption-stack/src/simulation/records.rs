//! Records held by the simulated control plane.

use crate::core::{pseudo, Resolver};
use crate::events::{EventPattern, NotificationFilter, PipelineExecutionStatus};
use crate::resources::{EndpointLifecycle, Grant, VpcConfigValue};
use crate::template::DeletionPolicy;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Account, region and partition the control plane runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEnvironment {
    /// Account ID.
    pub account_id: String,
    /// Region.
    pub region: String,
    /// Partition.
    pub partition: String,
}

impl Default for CloudEnvironment {
    fn default() -> Self {
        Self::new("111122223333", "eu-north-1")
    }
}

impl CloudEnvironment {
    /// Creates an environment in the standard partition.
    #[must_use]
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            partition: "aws".to_string(),
        }
    }

    /// A regional ARN of this account.
    #[must_use]
    pub fn arn(&self, service: &str, resource: &str) -> String {
        format!(
            "arn:{}:{service}:{}:{}:{resource}",
            self.partition, self.region, self.account_id
        )
    }

    /// A bucket ARN.
    #[must_use]
    pub fn bucket_arn(&self, bucket: &str) -> String {
        format!("arn:{}:s3:::{bucket}", self.partition)
    }

    /// A role ARN.
    #[must_use]
    pub fn role_arn(&self, name: &str) -> String {
        format!("arn:{}:iam::{}:role/{name}", self.partition, self.account_id)
    }

    /// A model, endpoint-config or endpoint ARN. The service lowercases names
    /// inside ARNs.
    #[must_use]
    pub fn sagemaker_arn(&self, kind: &str, name: &str) -> String {
        self.arn("sagemaker", &format!("{kind}/{}", name.to_ascii_lowercase()))
    }

    /// Availability zones of the region.
    #[must_use]
    pub fn availability_zones(&self) -> Vec<String> {
        ["a", "b", "c"].iter().map(|z| format!("{}{z}", self.region)).collect()
    }
}

/// Random suffix of a generated physical name.
pub(crate) fn physical_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_ascii_uppercase()
}

/// Generates `<parts joined by '-'>-<suffix>`, cutting the prefix so the
/// whole name fits in `max_len`.
pub(crate) fn generated_name(parts: &[&str], max_len: usize) -> String {
    let suffix = physical_suffix();
    let mut base = parts.join("-");
    base.truncate(max_len.saturating_sub(suffix.len() + 1));
    format!("{base}-{suffix}")
}

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: usize,
    /// Last write time.
    pub last_modified: Timestamp,
    /// Control-plane write sequence; orders writes within the same instant.
    pub sequence: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct BucketState {
    pub objects: BTreeMap<String, ObjectSummary>,
    pub notifications: Vec<(NotificationFilter, String)>,
    /// Bucket policy statements keyed by the principal they name.
    pub policy: Vec<(String, Grant)>,
}

/// A deployed role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleRecord {
    /// Role name.
    pub name: String,
    /// Role ARN.
    pub arn: String,
    /// Service allowed to assume the role.
    pub principal: String,
    /// Managed and inline grants.
    pub grants: Vec<Grant>,
}

/// A deployed function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionRecord {
    /// Logical ID in the owning stack.
    pub logical_id: String,
    /// Function name.
    pub name: String,
    /// Function ARN.
    pub arn: String,
    /// Execution role ARN.
    pub role_arn: String,
    /// Handler entry point.
    pub handler: String,
    /// Resolved environment variables.
    pub environment: BTreeMap<String, String>,
}

/// A resource-based invoke permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRecord {
    /// Logical ID in the owning stack.
    pub logical_id: String,
    /// Function ARN.
    pub function_arn: String,
    /// Invoking service.
    pub principal: String,
    /// ARN the invocation must come from.
    pub source_arn: Option<String>,
    /// Account the source must belong to.
    pub source_account: Option<String>,
}

impl PermissionRecord {
    pub(crate) fn admits(&self, function_arn: &str, principal: &str, source_arn: &str, account: &str) -> bool {
        self.function_arn == function_arn
            && self.principal == principal
            && self.source_arn.as_deref().map_or(true, |arn| arn == source_arn)
            && self.source_account.as_deref().map_or(true, |a| a == account)
    }
}

/// A deployed event rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleRecord {
    /// Rule name.
    pub name: String,
    /// Rule ARN.
    pub arn: String,
    /// Pattern.
    pub pattern: EventPattern,
    /// Target function ARNs.
    pub targets: Vec<String>,
    /// Whether the rule is enabled.
    pub enabled: bool,
}

/// A registered model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRecord {
    /// Model name.
    pub name: String,
    /// Model ARN.
    pub arn: String,
    /// Inference image.
    pub image: String,
    /// Artifact URI.
    pub model_data_url: String,
    /// Execution role ARN.
    pub execution_role_arn: String,
    /// Network placement.
    pub vpc_config: Option<VpcConfigValue>,
}

/// A production variant of a registered configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRecord {
    /// Variant name.
    pub variant_name: String,
    /// Served model.
    pub model_name: String,
    /// Instance type.
    pub instance_type: String,
    /// Instance count.
    pub initial_instance_count: u32,
}

/// A registered endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointConfigRecord {
    /// Configuration name.
    pub name: String,
    /// Configuration ARN.
    pub arn: String,
    /// Variants.
    pub variants: Vec<VariantRecord>,
    /// Data capture block, as submitted.
    pub data_capture: Option<Value>,
}

impl EndpointConfigRecord {
    /// Returns true if capture samples every request and response.
    #[must_use]
    pub fn captures_everything(&self) -> bool {
        let Some(capture) = &self.data_capture else {
            return false;
        };
        let modes: Vec<&str> = capture
            .get("CaptureOptions")
            .and_then(Value::as_array)
            .map(|options| {
                options
                    .iter()
                    .filter_map(|o| o.get("CaptureMode").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        capture.get("EnableCapture") == Some(&Value::Bool(true))
            && capture.get("InitialSamplingPercentage").and_then(Value::as_u64) == Some(100)
            && modes.contains(&"Input")
            && modes.contains(&"Output")
    }
}

/// A live endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointRecord {
    /// Endpoint name.
    pub name: String,
    /// Endpoint ARN.
    pub arn: String,
    /// Configuration currently served.
    pub config_name: String,
    /// Configurations served before, oldest first.
    pub history: Vec<String>,
    /// Lifecycle state.
    pub lifecycle: EndpointLifecycle,
}

/// One pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineExecution {
    /// Execution ARN.
    pub arn: String,
    /// Pipeline name.
    pub pipeline_name: String,
    /// Pipeline ARN.
    pub pipeline_arn: String,
    /// Current status.
    pub status: PipelineExecutionStatus,
    /// Start time.
    pub started_at: Timestamp,
}

/// A physical resource created for a logical one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployedResource {
    /// Logical ID.
    pub logical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Physical ID.
    pub physical_id: String,
    /// Value of `Ref`.
    pub reference: String,
    /// Values of `Fn::GetAtt`.
    pub attributes: BTreeMap<String, String>,
    /// Resolved properties.
    pub properties: Value,
    /// What teardown does with it.
    pub deletion_policy: DeletionPolicy,
}

/// A deployed stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackDeployment {
    /// Stack name.
    pub name: String,
    /// Template fingerprint.
    pub fingerprint: String,
    /// Parameter values.
    pub parameters: BTreeMap<String, String>,
    /// Physical resources by logical ID.
    pub resources: BTreeMap<String, DeployedResource>,
    /// Logical IDs in the order they were created.
    pub created: Vec<String>,
    /// Progress of the stack's endpoint.
    pub lifecycle: EndpointLifecycle,
}

/// Resolves intrinsics against a stack being deployed.
pub(crate) struct DeploymentResolver<'a> {
    pub env: &'a CloudEnvironment,
    pub deployment: &'a StackDeployment,
}

impl Resolver for DeploymentResolver<'_> {
    fn pseudo_parameter(&self, name: &str) -> Option<String> {
        match name {
            pseudo::ACCOUNT_ID => Some(self.env.account_id.clone()),
            pseudo::REGION => Some(self.env.region.clone()),
            pseudo::PARTITION => Some(self.env.partition.clone()),
            pseudo::STACK_NAME => Some(self.deployment.name.clone()),
            pseudo::URL_SUFFIX => Some("amazonaws.com".to_string()),
            _ => None,
        }
    }

    fn reference(&self, logical_id: &str) -> Option<Value> {
        self.deployment
            .parameters
            .get(logical_id)
            .or_else(|| self.deployment.resources.get(logical_id).map(|r| &r.reference))
            .cloned()
            .map(Value::String)
    }

    fn attribute(&self, logical_id: &str, attribute: &str) -> Option<Value> {
        self.deployment
            .resources
            .get(logical_id)?
            .attributes
            .get(attribute)
            .cloned()
            .map(Value::String)
    }

    fn availability_zones(&self) -> Vec<String> {
        self.env.availability_zones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Expr;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_environment_arns() {
        let env = CloudEnvironment::default();
        assert_eq!(
            env.arn("sagemaker", "endpoint/caption"),
            "arn:aws:sagemaker:eu-north-1:111122223333:endpoint/caption"
        );
        assert_eq!(env.bucket_arn("models"), "arn:aws:s3:::models");
        assert_eq!(env.role_arn("exec"), "arn:aws:iam::111122223333:role/exec");
        assert_eq!(env.availability_zones()[1], "eu-north-1b");
    }

    #[test]
    fn test_physical_suffix_shape() {
        let suffix = physical_suffix();
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(suffix, physical_suffix());
    }

    #[test]
    fn test_generated_name_fits() {
        let name = generated_name(&["CaptionStackStack", "TriggerPipelineFn"], 64);
        assert!(name.starts_with("CaptionStackStack-TriggerPipelineFn-"));
        let long = generated_name(&[&"x".repeat(80)], 64);
        assert_eq!(long.len(), 64);
        assert_eq!(
            CloudEnvironment::default().sagemaker_arn("model", "CaptionModel-AB12"),
            "arn:aws:sagemaker:eu-north-1:111122223333:model/captionmodel-ab12"
        );
    }

    #[test]
    fn test_resolver_reads_parameters_and_resources() {
        let env = CloudEnvironment::default();
        let mut deployment = StackDeployment {
            name: "CaptionStackStack".into(),
            ..StackDeployment::default()
        };
        deployment.parameters.insert("CodeBucket".into(), "code".into());
        deployment.resources.insert(
            "CaptionEndpoint".into(),
            DeployedResource {
                logical_id: "CaptionEndpoint".into(),
                resource_type: "AWS::SageMaker::Endpoint".into(),
                physical_id: "CaptionEndpoint-1".into(),
                reference: "arn:aws:sagemaker:eu-north-1:111122223333:endpoint/captionendpoint-1".into(),
                attributes: BTreeMap::from([("EndpointName".to_string(), "CaptionEndpoint-1".to_string())]),
                properties: json!({}),
                deletion_policy: DeletionPolicy::Delete,
            },
        );
        let resolver = DeploymentResolver {
            env: &env,
            deployment: &deployment,
        };
        assert_eq!(Expr::reference("CodeBucket").resolve(&resolver).unwrap(), json!("code"));
        assert_eq!(
            Expr::get_att("CaptionEndpoint", "EndpointName").resolve(&resolver).unwrap(),
            json!("CaptionEndpoint-1")
        );
        assert_eq!(
            Expr::sub("${AWS::StackName}-${AWS::Region}").resolve(&resolver).unwrap(),
            json!("CaptionStackStack-eu-north-1")
        );
        assert!(Expr::reference("Missing").resolve(&resolver).is_err());
    }

    #[test]
    fn test_config_capture_check() {
        let mut config = EndpointConfigRecord {
            name: "cfg".into(),
            arn: "arn".into(),
            variants: Vec::new(),
            data_capture: Some(json!({
                "EnableCapture": true,
                "InitialSamplingPercentage": 100,
                "CaptureOptions": [{"CaptureMode": "Input"}, {"CaptureMode": "Output"}]
            })),
        };
        assert!(config.captures_everything());
        config.data_capture = None;
        assert!(!config.captures_everything());
    }
}
