//! The service API a function reaches with its execution role.

use super::control_plane::ControlPlane;
use super::records::{EndpointConfigRecord, EndpointRecord, ModelRecord, ObjectSummary, VariantRecord};
use crate::errors::CloudError;
use crate::resources::iam::PASSED_TO_SERVICE;
use crate::resources::{is_allowed, Grant, ServicePrincipal, VpcConfigValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Parameters of `CreateModel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateModelRequest {
    /// Model name.
    pub name: String,
    /// Inference image.
    pub image: String,
    /// `s3://` artifact URI.
    pub model_data_url: String,
    /// Role the model executes as.
    pub execution_role_arn: String,
    /// Network placement.
    pub vpc_config: Option<VpcConfigValue>,
}

/// Parameters of `CreateEndpointConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateEndpointConfigRequest {
    /// Configuration name.
    pub name: String,
    /// Variants.
    pub variants: Vec<VariantRecord>,
    /// Data capture block.
    pub data_capture: Option<Value>,
}

/// Calls made with one role's permissions. Every call is authorized against
/// the role's grants before it reaches the control plane.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    cloud: ControlPlane,
    role_arn: String,
    grants: Arc<Vec<Grant>>,
}

impl ServiceClient {
    pub(crate) fn new(cloud: ControlPlane, role_arn: String, grants: Vec<Grant>) -> Self {
        Self {
            cloud,
            role_arn,
            grants: Arc::new(grants),
        }
    }

    /// The calling role.
    #[must_use]
    pub fn role_arn(&self) -> &str {
        &self.role_arn
    }

    fn authorize(&self, action: &str, resource: &str, context: &[(&str, &str)]) -> Result<(), CloudError> {
        let context: BTreeMap<String, String> = context
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        if is_allowed(&self.grants, action, resource, &context) {
            return Ok(());
        }
        warn!(role = %self.role_arn, action, resource, "access denied");
        Err(CloudError::AccessDenied {
            principal: self.role_arn.clone(),
            action: action.to_string(),
            resource: resource.to_string(),
        })
    }

    /// Starts a pipeline execution and returns its ARN.
    ///
    /// # Errors
    ///
    /// Returns an error if access is denied or the pipeline does not exist.
    pub async fn start_pipeline_execution(&self, pipeline_name: &str) -> Result<String, CloudError> {
        self.authorize(
            "sagemaker:StartPipelineExecution",
            &self.cloud.pipeline_arn(pipeline_name),
            &[],
        )?;
        self.cloud.start_execution(pipeline_name)
    }

    /// Lists objects under a prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if access is denied or the bucket does not exist.
    pub async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>, CloudError> {
        let arn = self.cloud.environment().bucket_arn(bucket);
        self.authorize("s3:ListBucket", &arn, &[("s3:prefix", prefix)])?;
        self.cloud.list_objects(bucket, prefix)
    }

    /// Registers a model. Passing the execution role to the service needs
    /// `iam:PassRole` on it.
    ///
    /// # Errors
    ///
    /// Returns an error if access is denied, the name is taken, or the
    /// request is invalid.
    pub async fn create_model(&self, request: CreateModelRequest) -> Result<String, CloudError> {
        let env = self.cloud.environment();
        let arn = env.sagemaker_arn("model", &request.name);
        self.authorize("sagemaker:CreateModel", &arn, &[])?;
        self.authorize(
            "iam:PassRole",
            &request.execution_role_arn,
            &[(PASSED_TO_SERVICE, ServicePrincipal::SageMaker.as_str())],
        )?;
        if !request.model_data_url.starts_with("s3://") {
            return Err(CloudError::Validation(format!(
                "ModelDataUrl '{}' is not an s3:// URI",
                request.model_data_url
            )));
        }
        self.cloud.create_model(ModelRecord {
            name: request.name,
            arn: arn.clone(),
            image: request.image,
            model_data_url: request.model_data_url,
            execution_role_arn: request.execution_role_arn,
            vpc_config: request.vpc_config,
        })?;
        Ok(arn)
    }

    /// Registers an endpoint configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if access is denied, the name is taken, or a
    /// variant names an unknown model.
    pub async fn create_endpoint_config(&self, request: CreateEndpointConfigRequest) -> Result<String, CloudError> {
        let arn = self.cloud.environment().sagemaker_arn("endpoint-config", &request.name);
        self.authorize("sagemaker:CreateEndpointConfig", &arn, &[])?;
        if request.variants.is_empty() {
            return Err(CloudError::Validation("ProductionVariants must not be empty".to_string()));
        }
        self.cloud.create_endpoint_config(EndpointConfigRecord {
            name: request.name,
            arn: arn.clone(),
            variants: request.variants,
            data_capture: request.data_capture,
        })?;
        Ok(arn)
    }

    /// Points an endpoint at a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if access is denied or the endpoint, configuration
    /// or model artifact does not exist.
    pub async fn update_endpoint(&self, endpoint_name: &str, config_name: &str) -> Result<String, CloudError> {
        let arn = self.cloud.environment().sagemaker_arn("endpoint", endpoint_name);
        self.authorize("sagemaker:UpdateEndpoint", &arn, &[])?;
        self.cloud.update_endpoint(endpoint_name, config_name)?;
        Ok(arn)
    }

    /// Describes an endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if access is denied or the endpoint does not exist.
    pub async fn describe_endpoint(&self, endpoint_name: &str) -> Result<EndpointRecord, CloudError> {
        let arn = self.cloud.environment().sagemaker_arn("endpoint", endpoint_name);
        self.authorize("sagemaker:DescribeEndpoint", &arn, &[])?;
        self.cloud
            .endpoint(endpoint_name)
            .ok_or_else(|| CloudError::not_found("Endpoint", endpoint_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Effect;
    use crate::simulation::CloudEnvironment;

    fn client(cloud: &ControlPlane, grants: Vec<Grant>) -> ServiceClient {
        ServiceClient::new(cloud.clone(), "arn:aws:iam::111122223333:role/caller".into(), grants)
    }

    fn allow(action: &str, resource: &str) -> Grant {
        Grant {
            effect: Effect::Allow,
            actions: vec![action.to_string()],
            resources: vec![resource.to_string()],
            conditions: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_calls_without_grants_are_denied() {
        let cloud = ControlPlane::new(CloudEnvironment::default());
        cloud.register_pipeline("CaptionModelPipeline");
        let client = client(&cloud, Vec::new());

        let err = client.start_pipeline_execution("CaptionModelPipeline").await.unwrap_err();
        assert!(matches!(err, CloudError::AccessDenied { ref action, .. } if action == "sagemaker:StartPipelineExecution"));
        assert!(cloud.executions().is_empty());
    }

    #[tokio::test]
    async fn test_list_objects_honors_prefix_condition() {
        let cloud = ControlPlane::new(CloudEnvironment::default());
        cloud.create_bucket("models").unwrap();
        let mut grant = allow("s3:ListBucket", "arn:aws:s3:::models");
        grant
            .conditions
            .insert("StringLike".into(), BTreeMap::from([("s3:prefix".to_string(), "output/*".to_string())]));
        let client = client(&cloud, vec![grant]);

        assert!(client.list_objects("models", "output/").await.unwrap().is_empty());
        assert!(matches!(
            client.list_objects("models", "").await,
            Err(CloudError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_model_needs_pass_role() {
        let cloud = ControlPlane::new(CloudEnvironment::default());
        let client = client(
            &cloud,
            vec![allow("sagemaker:CreateModel", "arn:aws:sagemaker:eu-north-1:111122223333:model/*")],
        );
        let err = client
            .create_model(CreateModelRequest {
                name: "CaptionModel-1".into(),
                image: "image".into(),
                model_data_url: "s3://models/output/model.tar.gz".into(),
                execution_role_arn: "arn:aws:iam::111122223333:role/exec".into(),
                vpc_config: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::AccessDenied { ref action, .. } if action == "iam:PassRole"));
        assert!(cloud.model("CaptionModel-1").is_none());
    }
}
