//! Function handlers and invocation records.
//!
//! A handler receives the event payload and an [`InvocationContext`] holding
//! the function's resolved environment and a [`ServiceClient`] bound to its
//! execution role. The two reference handlers follow the contract of the
//! stack's functions.

use super::client::{CreateEndpointConfigRequest, CreateModelRequest, ServiceClient};
use super::records::VariantRecord;
use crate::config::StackConfig;
use crate::core::Expr;
use crate::errors::CloudError;
use crate::resources::{DataCaptureConfig, DeployEnvironment, ProductionVariant, PIPELINE_NAME};
use crate::utils::Timestamp;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Name of the artifact a training run leaves behind.
pub const MODEL_ARTIFACT: &str = "model.tar.gz";

/// Everything a handler sees besides the event.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Request ID (a UUID).
    pub request_id: String,
    /// Function name.
    pub function_name: String,
    /// Resolved environment variables.
    pub environment: BTreeMap<String, String>,
    /// Client acting with the function's role.
    pub client: ServiceClient,
}

impl InvocationContext {
    /// Returns an environment variable.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the variable is unset or empty.
    pub fn env(&self, key: &str) -> Result<&str, CloudError> {
        self.environment
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CloudError::Validation(format!("environment variable {key} is not set")))
    }
}

/// Code run when a function is invoked.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// Handles one event. The returned value is the function's response.
    async fn handle(&self, event: Value, context: &InvocationContext) -> Result<Value, CloudError>;
}

/// What caused an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationSource {
    /// A bucket notification.
    Storage {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },
    /// An event rule.
    EventRule {
        /// Rule ARN.
        rule_arn: String,
    },
    /// A direct call.
    Direct,
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationOutcome {
    /// The handler returned a response.
    Succeeded {
        /// Response payload.
        response: Value,
    },
    /// The invocation was refused or the handler failed.
    Failed {
        /// The error.
        error: CloudError,
    },
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invocation {
    /// Request ID.
    pub request_id: String,
    /// Logical ID of the function in its stack.
    pub function_logical_id: String,
    /// Function name.
    pub function_name: String,
    /// What caused it.
    pub source: InvocationSource,
    /// Event payload.
    pub event: Value,
    /// Outcome.
    pub outcome: InvocationOutcome,
    /// Start time.
    pub started_at: Timestamp,
}

impl Invocation {
    /// Returns true if the handler succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, InvocationOutcome::Succeeded { .. })
    }

    /// The response, if the handler succeeded.
    #[must_use]
    pub fn response(&self) -> Option<&Value> {
        match &self.outcome {
            InvocationOutcome::Succeeded { response } => Some(response),
            InvocationOutcome::Failed { .. } => None,
        }
    }

    /// The error, if the invocation failed.
    #[must_use]
    pub fn error(&self) -> Option<&CloudError> {
        match &self.outcome {
            InvocationOutcome::Succeeded { .. } => None,
            InvocationOutcome::Failed { error } => Some(error),
        }
    }
}

/// Keys of the objects in a storage notification.
#[must_use]
pub fn object_keys(event: &Value) -> Vec<String> {
    event
        .get("Records")
        .and_then(Value::as_array)
        .map(|records| {
            records
                .iter()
                .filter_map(|r| r.pointer("/s3/object/key").and_then(Value::as_str))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Starts one execution of the pipeline named by `PIPELINE_NAME` per
/// invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerPipeline;

#[async_trait]
impl FunctionHandler for TriggerPipeline {
    async fn handle(&self, event: Value, context: &InvocationContext) -> Result<Value, CloudError> {
        let pipeline = context.env(PIPELINE_NAME)?;
        debug!(keys = ?object_keys(&event), "upload received");
        let execution_arn = context.client.start_pipeline_execution(pipeline).await?;
        info!(execution = %execution_arn, "started pipeline");
        Ok(json!({ "ExecutionArn": execution_arn }))
    }
}

/// Deploys the newest training artifact under `OUTPUT_PREFIX`.
///
/// Creates `CaptionModel-<id>` and `CaptionModel-<id>-cfg`, then points the
/// endpoint at the new configuration. Any failure before the update leaves
/// the endpoint on its previous configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployLatestModel {
    /// Variant of every configuration it creates.
    pub variant: ProductionVariant,
    /// Capture prefix in the artifact bucket.
    pub capture_prefix: String,
}

impl Default for DeployLatestModel {
    fn default() -> Self {
        Self {
            variant: ProductionVariant {
                variant_name: "AllTraffic".to_string(),
                instance_type: "ml.m5.xlarge".to_string(),
                initial_instance_count: 1,
            },
            capture_prefix: "datacapture/".to_string(),
        }
    }
}

impl DeployLatestModel {
    /// Uses the variant and capture prefix of the stack's own endpoint.
    #[must_use]
    pub fn from_config(config: &StackConfig) -> Self {
        Self {
            variant: ProductionVariant {
                variant_name: config.model.variant_name.clone(),
                instance_type: config.model.instance_type.clone(),
                initial_instance_count: config.model.instance_count,
            },
            capture_prefix: config.model.capture_prefix.clone(),
        }
    }
}

#[async_trait]
impl FunctionHandler for DeployLatestModel {
    async fn handle(&self, _event: Value, context: &InvocationContext) -> Result<Value, CloudError> {
        let env = DeployEnvironment::from_env(&context.environment)?;
        let client = &context.client;

        let newest = client
            .list_objects(&env.asset_bucket, &env.output_prefix)
            .await?
            .into_iter()
            .filter(|o| o.key.ends_with(MODEL_ARTIFACT))
            .max_by_key(|o| (o.last_modified, o.sequence))
            .ok_or_else(|| {
                CloudError::Validation(format!("No {MODEL_ARTIFACT} found under {}", env.output_prefix))
            })?;
        let model_data_url = format!("s3://{}/{}", env.asset_bucket, newest.key);
        info!(artifact = %model_data_url, "deploying model");

        let id = context.request_id.split('-').next().unwrap_or(context.request_id.as_str());
        let model_name = format!("CaptionModel-{id}");
        let config_name = format!("{model_name}-cfg");

        client
            .create_model(CreateModelRequest {
                name: model_name.clone(),
                image: env.inference_image.clone(),
                model_data_url,
                execution_role_arn: env.sm_role_arn.clone(),
                vpc_config: Some(env.vpc_config.clone()),
            })
            .await?;

        let capture = DataCaptureConfig::always_on(Expr::from(format!(
            "s3://{}/{}",
            env.asset_bucket, self.capture_prefix
        )));
        client
            .create_endpoint_config(CreateEndpointConfigRequest {
                name: config_name.clone(),
                variants: vec![VariantRecord {
                    variant_name: self.variant.variant_name.clone(),
                    model_name: model_name.clone(),
                    instance_type: self.variant.instance_type.clone(),
                    initial_instance_count: self.variant.initial_instance_count,
                }],
                data_capture: Some(capture.to_expr().to_json()),
            })
            .await?;

        client.update_endpoint(&env.endpoint_name, &config_name).await?;
        info!(endpoint = %env.endpoint_name, config = %config_name, "endpoint updated");
        Ok(json!({
            "status": "deployed",
            "model": model_name,
            "endpoint": env.endpoint_name,
        }))
    }
}
