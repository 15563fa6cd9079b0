//! Event-triggered functions, their invoke permissions and the deploy
//! function's environment contract.

use super::{ServicePrincipal, VpcPlacement};
use crate::core::Expr;
use crate::errors::{codes, CloudError, SynthResult, SynthesisError};
use crate::stack::StackBuilder;
use crate::template::{types, Parameter, Resource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Environment key of the pipeline the trigger function starts.
pub const PIPELINE_NAME: &str = "PIPELINE_NAME";

/// Function runtimes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Runtime {
    /// Python 3.11.
    #[serde(rename = "python3.11")]
    Python311,
    /// Python 3.12.
    #[default]
    #[serde(rename = "python3.12")]
    Python312,
    /// Python 3.13.
    #[serde(rename = "python3.13")]
    Python313,
}

impl Runtime {
    /// Runtime identifier.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python311 => "python3.11",
            Self::Python312 => "python3.12",
            Self::Python313 => "python3.13",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a function's code package lives, supplied as template parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLocation {
    /// Default bucket.
    pub bucket: String,
    /// Default object key.
    pub key: String,
}

/// A function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    /// Logical ID.
    pub logical_id: String,
    /// Entry point, `module.function`.
    pub handler: String,
    /// Runtime.
    pub runtime: Runtime,
    /// Execution role ARN.
    pub role_arn: Expr,
    /// Environment.
    pub environment: BTreeMap<String, Expr>,
    /// Timeout in seconds.
    pub timeout_secs: u32,
    /// Memory in MiB.
    pub memory_mb: u32,
    /// Network placement.
    pub placement: Option<VpcPlacement>,
    /// Code package.
    pub code: CodeLocation,
}

impl FunctionSpec {
    /// Name of the parameter holding the code bucket.
    #[must_use]
    pub fn code_bucket_parameter(&self) -> String {
        format!("{}CodeBucket", self.logical_id)
    }

    /// Name of the parameter holding the code key.
    #[must_use]
    pub fn code_key_parameter(&self) -> String {
        format!("{}CodeKey", self.logical_id)
    }

    fn validate(&self) -> SynthResult<()> {
        let invalid = |reason: &str| {
            Err(SynthesisError::coded(
                codes::CONFIG,
                format!("Function '{}': {reason}", self.logical_id),
            )
            .with_resources(vec![self.logical_id.clone()]))
        };
        if !(1..=900).contains(&self.timeout_secs) {
            return invalid("timeout must be between 1 and 900 seconds");
        }
        if !(128..=10_240).contains(&self.memory_mb) {
            return invalid("memory must be between 128 and 10240 MiB");
        }
        if !self.handler.contains('.') {
            return invalid("handler must look like 'module.function'");
        }
        Ok(())
    }

    /// Declares the code parameters and the function.
    ///
    /// # Errors
    ///
    /// Returns an error if a setting is out of range or builder validation
    /// fails.
    pub fn add_to(&self, builder: &mut StackBuilder) -> SynthResult<FunctionRef> {
        self.validate()?;
        let bucket_param = self.code_bucket_parameter();
        let key_param = self.code_key_parameter();
        builder.add_parameter(
            &bucket_param,
            Parameter::string(&self.code.bucket, format!("Bucket holding the {} code package", self.logical_id)),
        )?;
        builder.add_parameter(
            &key_param,
            Parameter::string(&self.code.key, format!("Object key of the {} code package", self.logical_id)),
        )?;

        let mut resource = Resource::new(types::LAMBDA_FUNCTION)
            .with_property(
                "Code",
                Expr::map([("S3Bucket", Expr::reference(&bucket_param)), ("S3Key", Expr::reference(&key_param))]),
            )
            .with_property("Handler", self.handler.as_str())
            .with_property("Runtime", self.runtime.as_str())
            .with_property("Role", self.role_arn.clone())
            .with_property("Timeout", self.timeout_secs)
            .with_property("MemorySize", self.memory_mb);
        if !self.environment.is_empty() {
            resource = resource.with_property(
                "Environment",
                Expr::map([("Variables", Expr::Map(self.environment.clone()))]),
            );
        }
        if let Some(placement) = &self.placement {
            resource = resource.with_property("VpcConfig", placement.function_config());
        }
        builder.add_resource(&self.logical_id, resource)?;
        Ok(FunctionRef {
            logical_id: self.logical_id.clone(),
        })
    }
}

/// Handle to a lowered function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    /// Logical ID.
    pub logical_id: String,
}

impl FunctionRef {
    /// Function ARN.
    #[must_use]
    pub fn arn(&self) -> Expr {
        Expr::get_att(&self.logical_id, "Arn")
    }

    /// Grants `principal` permission to invoke the function.
    ///
    /// # Errors
    ///
    /// Returns an error if builder validation fails.
    pub fn grant_invoke(
        &self,
        builder: &mut StackBuilder,
        logical_id: &str,
        principal: ServicePrincipal,
        source_arn: Expr,
        source_account: Option<Expr>,
    ) -> SynthResult<()> {
        let mut resource = Resource::new(types::LAMBDA_PERMISSION)
            .with_property("Action", "lambda:InvokeFunction")
            .with_property("FunctionName", self.arn())
            .with_property("Principal", principal.as_str())
            .with_property("SourceArn", source_arn);
        if let Some(account) = source_account {
            resource = resource.with_property("SourceAccount", account);
        }
        builder.add_resource(logical_id, resource)
    }
}

/// The deploy function's network placement as passed through its
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcConfigValue {
    /// Subnet IDs.
    #[serde(rename = "Subnets")]
    pub subnets: Vec<String>,
    /// Security group IDs.
    #[serde(rename = "SecurityGroupIds")]
    pub security_group_ids: Vec<String>,
}

/// Environment contract of the deploy function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployEnvironment {
    /// Role the new model executes as.
    pub sm_role_arn: String,
    /// Endpoint to update.
    pub endpoint_name: String,
    /// Inference image.
    pub inference_image: String,
    /// Bucket holding training output.
    pub asset_bucket: String,
    /// Prefix of training output.
    pub output_prefix: String,
    /// Network placement of the new model.
    pub vpc_config: VpcConfigValue,
}

impl DeployEnvironment {
    /// Role ARN key.
    pub const SM_ROLE_ARN: &'static str = "SM_ROLE_ARN";
    /// Endpoint name key.
    pub const ENDPOINT_NAME: &'static str = "ENDPOINT_NAME";
    /// Image key.
    pub const INFERENCE_IMAGE: &'static str = "INFERENCE_IMAGE";
    /// Bucket key.
    pub const ASSET_BUCKET: &'static str = "ASSET_BUCKET";
    /// Prefix key.
    pub const OUTPUT_PREFIX: &'static str = "OUTPUT_PREFIX";
    /// Placement key.
    pub const VPC_CONFIG: &'static str = "VPC_CONFIG";

    /// Builds the environment block, resolved at deploy time.
    #[must_use]
    pub fn template(
        role_arn: Expr,
        endpoint_name: Expr,
        image: &str,
        bucket: Expr,
        output_prefix: &str,
        placement: &VpcPlacement,
    ) -> BTreeMap<String, Expr> {
        BTreeMap::from([
            (Self::SM_ROLE_ARN.to_string(), role_arn),
            (Self::ENDPOINT_NAME.to_string(), endpoint_name),
            (Self::INFERENCE_IMAGE.to_string(), Expr::text(image)),
            (Self::ASSET_BUCKET.to_string(), bucket),
            (Self::OUTPUT_PREFIX.to_string(), Expr::from(output_prefix)),
            (Self::VPC_CONFIG.to_string(), placement.json_string()),
        ])
    }

    /// Parses the environment a function was started with.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first missing or malformed key.
    pub fn from_env(env: &BTreeMap<String, String>) -> Result<Self, CloudError> {
        let get = |key: &str| {
            env.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| CloudError::Validation(format!("environment variable {key} is not set")))
        };
        let vpc_config = serde_json::from_str(&get(Self::VPC_CONFIG)?)
            .map_err(|e| CloudError::Validation(format!("{} is not valid JSON: {e}", Self::VPC_CONFIG)))?;
        Ok(Self {
            sm_role_arn: get(Self::SM_ROLE_ARN)?,
            endpoint_name: get(Self::ENDPOINT_NAME)?,
            inference_image: get(Self::INFERENCE_IMAGE)?,
            asset_bucket: get(Self::ASSET_BUCKET)?,
            output_prefix: get(Self::OUTPUT_PREFIX)?,
            vpc_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn spec() -> FunctionSpec {
        FunctionSpec {
            logical_id: "TriggerPipelineFn".into(),
            handler: "trigger_pipeline.handler".into(),
            runtime: Runtime::Python312,
            role_arn: Expr::string("arn:aws:iam::1:role/r"),
            environment: BTreeMap::from([(PIPELINE_NAME.to_string(), Expr::from("CaptionModelPipeline"))]),
            timeout_secs: 30,
            memory_mb: 256,
            placement: None,
            code: CodeLocation {
                bucket: "code".into(),
                key: "lambda/trigger.zip".into(),
            },
        }
    }

    #[test]
    fn test_function_lowering_uses_code_parameters() {
        let mut builder = StackBuilder::new("Test");
        let function = spec().add_to(&mut builder).unwrap();
        assert_eq!(function.arn(), Expr::get_att("TriggerPipelineFn", "Arn"));

        let json = serde_json::to_value(builder.get("TriggerPipelineFn").unwrap()).unwrap();
        assert_eq!(
            json["Properties"]["Code"],
            json!({"S3Bucket": {"Ref": "TriggerPipelineFnCodeBucket"}, "S3Key": {"Ref": "TriggerPipelineFnCodeKey"}})
        );
        assert_eq!(json["Properties"]["Environment"]["Variables"][PIPELINE_NAME], "CaptionModelPipeline");
        assert_eq!(json["Properties"]["Runtime"], "python3.12");
        assert!(builder.contains("TriggerPipelineFnCodeKey"));
    }

    #[test]
    fn test_function_settings_validated() {
        let mut bad = spec();
        bad.timeout_secs = 0;
        assert_eq!(bad.add_to(&mut StackBuilder::new("T")).unwrap_err().code(), Some(codes::CONFIG));
        let mut bad = spec();
        bad.handler = "handler".into();
        assert!(bad.add_to(&mut StackBuilder::new("T")).is_err());
    }

    #[test]
    fn test_grant_invoke() {
        let mut builder = StackBuilder::new("Test");
        let function = spec().add_to(&mut builder).unwrap();
        function
            .grant_invoke(
                &mut builder,
                "TriggerPermission",
                ServicePrincipal::S3,
                Expr::sub("arn:${AWS::Partition}:s3:::ingest"),
                Some(Expr::reference("AWS::AccountId")),
            )
            .unwrap();
        let json = serde_json::to_value(builder.get("TriggerPermission").unwrap()).unwrap();
        assert_eq!(json["Properties"]["Principal"], "s3.amazonaws.com");
        assert_eq!(json["Properties"]["SourceAccount"], json!({"Ref": "AWS::AccountId"}));
    }

    fn env() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("SM_ROLE_ARN".to_string(), "arn:aws:iam::1:role/exec".to_string()),
            ("ENDPOINT_NAME".to_string(), "CaptionEndpoint-abc".to_string()),
            ("INFERENCE_IMAGE".to_string(), "img".to_string()),
            ("ASSET_BUCKET".to_string(), "models".to_string()),
            ("OUTPUT_PREFIX".to_string(), "output/".to_string()),
            (
                "VPC_CONFIG".to_string(),
                r#"{"Subnets":["subnet-1","subnet-2"],"SecurityGroupIds":["sg-1"]}"#.to_string(),
            ),
        ])
    }

    #[test]
    fn test_deploy_environment_from_env() {
        let parsed = DeployEnvironment::from_env(&env()).unwrap();
        assert_eq!(parsed.endpoint_name, "CaptionEndpoint-abc");
        assert_eq!(parsed.vpc_config.subnets, vec!["subnet-1", "subnet-2"]);
        assert_eq!(parsed.vpc_config.security_group_ids, vec!["sg-1"]);
    }

    #[test]
    fn test_deploy_environment_missing_or_malformed() {
        let mut missing = env();
        missing.remove("ENDPOINT_NAME");
        assert!(matches!(DeployEnvironment::from_env(&missing), Err(CloudError::Validation(m)) if m.contains("ENDPOINT_NAME")));

        let mut malformed = env();
        malformed.insert("VPC_CONFIG".into(), "not json".into());
        assert!(DeployEnvironment::from_env(&malformed).is_err());
    }

    #[test]
    fn test_deploy_environment_template_keys() {
        let placement = VpcPlacement {
            subnets: vec![Expr::reference("A")],
            security_group_ids: vec![Expr::reference("Sg")],
        };
        let env = DeployEnvironment::template(
            Expr::get_att("Exec", "Arn"),
            Expr::get_att("Endpoint", "EndpointName"),
            "img:${AWS::Region}",
            Expr::sub("models-${AWS::AccountId}"),
            "output/",
            &placement,
        );
        let keys: Vec<&str> = env.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["ASSET_BUCKET", "ENDPOINT_NAME", "INFERENCE_IMAGE", "OUTPUT_PREFIX", "SM_ROLE_ARN", "VPC_CONFIG"]
        );
        assert_eq!(env["INFERENCE_IMAGE"], Expr::sub("img:${AWS::Region}"));
    }
}
