//! A control plane with the topology deployed.

use std::sync::Arc;

use crate::config::StackConfig;
use crate::errors::{CloudError, StackError};
use crate::events::{CollectingEventSink, PipelineExecutionStatus};
use crate::simulation::{
    CloudEnvironment, ControlPlane, DeployLatestModel, EndpointConfigRecord, EndpointRecord, Invocation,
    StackDeployment, TriggerPipeline, MODEL_ARTIFACT,
};
use crate::stack::Stack;
use crate::topology::{ids, CaptionTopology};

/// Size of objects the fixture uploads.
const OBJECT_SIZE: usize = 1024;

/// The synthesized stack deployed into a fresh control plane.
///
/// The model bucket exists before the stack and holds the initial artifact.
/// The pipeline is registered and both functions run the reference
/// handlers.
pub struct TestCloud {
    /// The control plane.
    pub cloud: ControlPlane,
    /// Activity records.
    pub sink: Arc<CollectingEventSink>,
    /// Configuration the stack was synthesized from.
    pub config: StackConfig,
    /// The synthesized stack.
    pub stack: Stack,
    /// The deployment.
    pub deployment: StackDeployment,
    model_bucket: String,
}

impl TestCloud {
    /// Deploys the default configuration.
    pub async fn new() -> Result<Self, StackError> {
        Self::with_config(StackConfig::default()).await
    }

    /// Deploys `config`.
    pub async fn with_config(config: StackConfig) -> Result<Self, StackError> {
        Self::with_environment(config, CloudEnvironment::default()).await
    }

    /// Deploys `config` into a control plane running in `env`.
    pub async fn with_environment(config: StackConfig, env: CloudEnvironment) -> Result<Self, StackError> {
        let sink = Arc::new(CollectingEventSink::new());
        let cloud = ControlPlane::with_sink(env, sink.clone());

        let model_bucket = cloud.resolve_text(&config.model.bucket)?;
        cloud.create_bucket(&model_bucket)?;
        cloud
            .put_object(&model_bucket, &config.model.artifact_key, OBJECT_SIZE)
            .await?;

        cloud.register_pipeline(config.pipeline.name.as_str());
        cloud.register_handler(ids::TRIGGER_FUNCTION, Arc::new(TriggerPipeline));
        cloud.register_handler(ids::DEPLOY_FUNCTION, Arc::new(DeployLatestModel::from_config(&config)));

        let stack = CaptionTopology::new(config.clone()).synthesize()?;
        let deployment = cloud.deploy(&stack)?;
        sink.clear();

        Ok(Self {
            cloud,
            sink,
            config,
            stack,
            deployment,
            model_bucket,
        })
    }

    /// Physical name of a deployed resource.
    #[must_use]
    pub fn physical_id(&self, logical_id: &str) -> Option<&str> {
        self.deployment
            .resources
            .get(logical_id)
            .map(|r| r.physical_id.as_str())
    }

    /// Name of the imported model bucket.
    #[must_use]
    pub fn model_bucket(&self) -> &str {
        &self.model_bucket
    }

    /// Name of the ingest bucket.
    #[must_use]
    pub fn ingest_bucket(&self) -> &str {
        self.physical_id(ids::INGEST_BUCKET).unwrap_or_default()
    }

    /// Uploads one object to the ingest bucket.
    pub async fn upload(&self, key: &str) -> Result<Vec<Invocation>, CloudError> {
        self.cloud.put_object(self.ingest_bucket(), key, OBJECT_SIZE).await
    }

    /// Writes a training artifact to the model bucket's output prefix.
    pub async fn write_artifact(&self, run: &str) -> Result<String, CloudError> {
        let key = format!("{}{run}/{MODEL_ARTIFACT}", self.config.pipeline.output_prefix);
        self.cloud.put_object(&self.model_bucket, &key, OBJECT_SIZE).await?;
        Ok(key)
    }

    /// Finishes every running pipeline execution with `status`. Successful
    /// executions leave an artifact under `<output prefix><execution id>/`
    /// first.
    pub async fn finish_executions(&self, status: PipelineExecutionStatus) -> Result<Vec<Invocation>, CloudError> {
        let mut invocations = Vec::new();
        for execution in self.cloud.executions() {
            if execution.status.is_terminal() {
                continue;
            }
            if status == PipelineExecutionStatus::Succeeded {
                let run = execution.arn.rsplit('/').next().unwrap_or_default();
                self.write_artifact(run).await?;
            }
            invocations.extend(self.cloud.complete_execution(&execution.arn, status).await?);
        }
        Ok(invocations)
    }

    /// The stack's endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Option<EndpointRecord> {
        self.cloud.endpoint(self.physical_id(ids::ENDPOINT)?)
    }

    /// The configuration the endpoint serves.
    #[must_use]
    pub fn serving_config(&self) -> Option<EndpointConfigRecord> {
        self.cloud.endpoint_config(&self.endpoint()?.config_name)
    }
}
