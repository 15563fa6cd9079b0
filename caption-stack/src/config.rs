//! Stack configuration.
//!
//! Every field has a default matching the deployed stack, so an empty TOML
//! file is a complete configuration.

use crate::errors::ConfigError;
use crate::network::NetworkSpec;
use crate::resources::Runtime;
use crate::topology::TopologyVariant;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    /// Stack name.
    #[serde(default = "default_stack_name")]
    pub stack_name: String,
    /// Template description.
    #[serde(default)]
    pub description: Option<String>,
    /// Network layout.
    #[serde(default)]
    pub network: NetworkSpec,
    /// Model, endpoint and capture settings.
    #[serde(default)]
    pub model: ModelConfig,
    /// Ingest bucket settings.
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Training pipeline settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Function settings.
    #[serde(default)]
    pub functions: FunctionsConfig,
    /// Topology variant flags.
    #[serde(default)]
    pub variant: TopologyVariant,
}

fn default_stack_name() -> String {
    "CaptionStackStack".to_string()
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            stack_name: default_stack_name(),
            description: None,
            network: NetworkSpec::default(),
            model: ModelConfig::default(),
            ingest: IngestConfig::default(),
            pipeline: PipelineConfig::default(),
            functions: FunctionsConfig::default(),
            variant: TopologyVariant::default(),
        }
    }
}

/// Model and endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Existing bucket holding model artifacts, training output and
    /// captured payloads. May embed `${AWS::AccountId}`/`${AWS::Region}`.
    #[serde(default = "default_model_bucket")]
    pub bucket: String,
    /// Inference container image.
    #[serde(default = "default_image")]
    pub image: String,
    /// Key of the initial model artifact.
    #[serde(default = "default_artifact_key")]
    pub artifact_key: String,
    /// Instance type.
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Instance count.
    #[serde(default = "default_instance_count")]
    pub instance_count: u32,
    /// Production variant name.
    #[serde(default = "default_variant_name")]
    pub variant_name: String,
    /// Prefix captured payloads are written under.
    #[serde(default = "default_capture_prefix")]
    pub capture_prefix: String,
}

fn default_model_bucket() -> String {
    "cdk-hnb659fds-assets-${AWS::AccountId}-${AWS::Region}".to_string()
}

fn default_image() -> String {
    "763104351884.dkr.ecr.${AWS::Region}.amazonaws.com/pytorch-inference:2.0.0-cpu-py310-ubuntu20.04-sagemaker".to_string()
}

fn default_artifact_key() -> String {
    "model.tar.gz".to_string()
}

fn default_instance_type() -> String {
    "ml.m5.xlarge".to_string()
}

fn default_instance_count() -> u32 {
    1
}

fn default_variant_name() -> String {
    "AllTraffic".to_string()
}

fn default_capture_prefix() -> String {
    "datacapture/".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            bucket: default_model_bucket(),
            image: default_image(),
            artifact_key: default_artifact_key(),
            instance_type: default_instance_type(),
            instance_count: default_instance_count(),
            variant_name: default_variant_name(),
            capture_prefix: default_capture_prefix(),
        }
    }
}

/// Ingest bucket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Bucket name template.
    #[serde(default = "default_ingest_bucket")]
    pub bucket: String,
    /// Prefix whose uploads start training.
    #[serde(default = "default_ingest_prefix")]
    pub prefix: String,
}

fn default_ingest_bucket() -> String {
    "caption-ingest-${AWS::AccountId}-${AWS::Region}".to_string()
}

fn default_ingest_prefix() -> String {
    "train-images/".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bucket: default_ingest_bucket(),
            prefix: default_ingest_prefix(),
        }
    }
}

/// Training pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name.
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    /// Prefix of training output in the model bucket.
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
}

fn default_pipeline_name() -> String {
    "CaptionModelPipeline".to_string()
}

fn default_output_prefix() -> String {
    "output/".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            output_prefix: default_output_prefix(),
        }
    }
}

/// Settings of one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Entry point.
    pub handler: String,
    /// Timeout in seconds.
    pub timeout_secs: u32,
    /// Memory in MiB.
    pub memory_mb: u32,
    /// Default key of the code package.
    pub code_key: String,
}

/// Settings of both functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionsConfig {
    /// Runtime.
    #[serde(default)]
    pub runtime: Runtime,
    /// Default bucket of the code packages.
    #[serde(default = "default_code_bucket")]
    pub code_bucket: String,
    /// Trigger function.
    #[serde(default = "default_trigger")]
    pub trigger: FunctionConfig,
    /// Deploy function.
    #[serde(default = "default_deploy")]
    pub deploy: FunctionConfig,
    /// Provider that empties the ingest bucket before it is deleted.
    #[serde(default = "default_auto_delete")]
    pub auto_delete: FunctionConfig,
}

fn default_code_bucket() -> String {
    "caption-stack-code".to_string()
}

fn default_trigger() -> FunctionConfig {
    FunctionConfig {
        handler: "trigger_pipeline.handler".to_string(),
        timeout_secs: 30,
        memory_mb: 256,
        code_key: "lambda/trigger.zip".to_string(),
    }
}

fn default_deploy() -> FunctionConfig {
    FunctionConfig {
        handler: "deploy_if_good_fn.handler".to_string(),
        timeout_secs: 300,
        memory_mb: 512,
        code_key: "lambda/deploy.zip".to_string(),
    }
}

fn default_auto_delete() -> FunctionConfig {
    FunctionConfig {
        handler: "auto_delete_objects.handler".to_string(),
        timeout_secs: 900,
        memory_mb: 128,
        code_key: "lambda/auto-delete-objects.zip".to_string(),
    }
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            runtime: Runtime::default(),
            code_bucket: default_code_bucket(),
            trigger: default_trigger(),
            deploy: default_deploy(),
            auto_delete: default_auto_delete(),
        }
    }
}

impl StackConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stack name.
    #[must_use]
    pub fn with_stack_name(mut self, name: impl Into<String>) -> Self {
        self.stack_name = name.into();
        self
    }

    /// Sets the model artifact key.
    #[must_use]
    pub fn with_artifact_key(mut self, key: impl Into<String>) -> Self {
        self.model.artifact_key = key.into();
        self
    }

    /// Sets the variant flags.
    #[must_use]
    pub fn with_variant(mut self, variant: TopologyVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Parses and validates TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or a value is invalid.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Checks value ranges and naming rules. Network sizing is checked
    /// when the network is planned.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_stack_name(&self.stack_name) {
            return Err(ConfigError::invalid(
                "stack_name",
                "must start with a letter and contain only letters, digits and hyphens (max 128)",
            ));
        }
        if self.model.bucket.trim().is_empty() {
            return Err(ConfigError::invalid("model.bucket", "must not be empty"));
        }
        if self.model.image.trim().is_empty() {
            return Err(ConfigError::invalid("model.image", "must not be empty"));
        }
        if !self.model.instance_type.starts_with("ml.") {
            return Err(ConfigError::invalid("model.instance_type", "must be an ml.* instance type"));
        }
        if self.model.instance_count == 0 {
            return Err(ConfigError::invalid("model.instance_count", "must be at least 1"));
        }
        if self.model.variant_name.trim().is_empty() {
            return Err(ConfigError::invalid("model.variant_name", "must not be empty"));
        }
        if self.ingest.bucket.trim().is_empty() {
            return Err(ConfigError::invalid("ingest.bucket", "must not be empty"));
        }
        if self.ingest.bucket == self.model.bucket {
            return Err(ConfigError::invalid("ingest.bucket", "must differ from model.bucket"));
        }
        for (field, prefix) in [
            ("model.capture_prefix", &self.model.capture_prefix),
            ("ingest.prefix", &self.ingest.prefix),
            ("pipeline.output_prefix", &self.pipeline.output_prefix),
        ] {
            if prefix.is_empty() || prefix.starts_with('/') || !prefix.ends_with('/') {
                return Err(ConfigError::invalid(field, "must be a relative prefix ending in '/'"));
            }
        }
        if !is_pipeline_name(&self.pipeline.name) {
            return Err(ConfigError::invalid(
                "pipeline.name",
                "must contain only letters, digits and hyphens (max 256)",
            ));
        }
        Ok(())
    }
}

fn is_stack_name(name: &str) -> bool {
    name.len() <= 128
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_pipeline_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 256
        && !name.starts_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PipelineEventSchema;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_empty_toml_is_default() {
        let config = StackConfig::from_toml_str("").unwrap();
        assert_eq!(config, StackConfig::default());
        assert_eq!(config.stack_name, "CaptionStackStack");
        assert_eq!(config.model.instance_type, "ml.m5.xlarge");
        assert_eq!(config.ingest.prefix, "train-images/");
        assert_eq!(config.pipeline.name, "CaptionModelPipeline");
        assert_eq!(config.functions.runtime, Runtime::Python312);
        assert!(config.variant.automation);
    }

    #[test]
    fn test_partial_override() {
        let config = StackConfig::from_toml_str(
            r#"
            stack_name = "CaptionStaging"

            [model]
            instance_count = 2
            artifact_key = "models/v2/model.tar.gz"

            [network]
            max_azs = 3
            nat_gateways = 1

            [variant]
            event_schema = "pipeline_name_field"
            "#,
        )
        .unwrap();
        assert_eq!(config.stack_name, "CaptionStaging");
        assert_eq!(config.model.instance_count, 2);
        assert_eq!(config.model.instance_type, "ml.m5.xlarge");
        assert_eq!(config.network.max_azs, 3);
        assert_eq!(config.variant.event_schema, PipelineEventSchema::PipelineNameField);
        assert!(config.variant.endpoint_https_ingress);
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            ("stack_name = \"1bad\"", "stack_name"),
            ("[model]\ninstance_count = 0", "model.instance_count"),
            ("[model]\ninstance_type = \"m5.xlarge\"", "model.instance_type"),
            ("[ingest]\nprefix = \"train-images\"", "ingest.prefix"),
            ("[pipeline]\nname = \"bad name\"", "pipeline.name"),
        ];
        for (text, field) in cases {
            match StackConfig::from_toml_str(text) {
                Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected invalid {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(StackConfig::from_toml_str("stack_name = ["), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file_and_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nname = \"OtherPipeline\"").unwrap();
        let config = StackConfig::load(file.path()).unwrap();
        assert_eq!(config.pipeline.name, "OtherPipeline");

        let text = config.to_toml_string().unwrap();
        assert_eq!(StackConfig::from_toml_str(&text).unwrap(), config);

        assert!(matches!(
            StackConfig::load("/nonexistent/caption.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
