//! Model, endpoint configuration and endpoint.
//!
//! The three resources form a chain: the configuration names the model, the
//! endpoint names the configuration. Each link is expressed twice, once as
//! the `GetAtt` the property reads and once as an explicit `DependsOn`.

use super::{ArtifactLocation, VpcPlacement};
use crate::core::Expr;
use crate::errors::{codes, SynthResult, SynthesisError};
use crate::stack::StackBuilder;
use crate::template::{types, Resource};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// The model resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    /// Logical ID.
    pub logical_id: String,
    /// Container image URI template.
    pub image: String,
    /// Model artifact.
    pub artifact: ArtifactLocation,
    /// Execution role ARN.
    pub execution_role_arn: Expr,
    /// Network placement.
    pub placement: Option<VpcPlacement>,
}

impl ModelSpec {
    fn to_resource(&self) -> SynthResult<Resource> {
        if self.image.trim().is_empty() {
            return Err(SynthesisError::coded(
                codes::INFERENCE,
                format!("Model '{}' has no container image", self.logical_id),
            ));
        }
        let mut resource = Resource::new(types::SAGEMAKER_MODEL)
            .with_property("ExecutionRoleArn", self.execution_role_arn.clone())
            .with_property(
                "PrimaryContainer",
                Expr::map([
                    ("Image", Expr::text(self.image.as_str())),
                    ("ModelDataUrl", self.artifact.s3_uri()),
                ]),
            );
        if let Some(placement) = &self.placement {
            resource = resource.with_property("VpcConfig", placement.model_config());
        }
        Ok(resource)
    }
}

/// One production variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionVariant {
    /// Variant name.
    pub variant_name: String,
    /// Instance type.
    pub instance_type: String,
    /// Instance count.
    pub initial_instance_count: u32,
}

impl ProductionVariant {
    fn to_expr(&self, model_name: Expr) -> Expr {
        Expr::map([
            ("InitialInstanceCount", Expr::from(self.initial_instance_count)),
            ("InstanceType", Expr::from(self.instance_type.as_str())),
            ("ModelName", model_name),
            ("VariantName", Expr::from(self.variant_name.as_str())),
        ])
    }
}

/// What data capture records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureMode {
    /// Request payloads.
    Input,
    /// Response payloads.
    Output,
}

impl CaptureMode {
    /// Wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "Input",
            Self::Output => "Output",
        }
    }
}

/// Endpoint data capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCaptureConfig {
    /// Capture enabled.
    pub enable_capture: bool,
    /// Sampled share of requests, in percent.
    pub initial_sampling_percentage: u32,
    /// `s3://` destination.
    pub destination: Expr,
    /// Captured payloads.
    pub modes: Vec<CaptureMode>,
}

impl DataCaptureConfig {
    /// Capture every request and response.
    #[must_use]
    pub fn always_on(destination: Expr) -> Self {
        Self {
            enable_capture: true,
            initial_sampling_percentage: 100,
            destination,
            modes: vec![CaptureMode::Input, CaptureMode::Output],
        }
    }

    /// Returns true if every input and output payload is captured.
    #[must_use]
    pub fn captures_everything(&self) -> bool {
        self.enable_capture
            && self.initial_sampling_percentage == 100
            && self.modes.contains(&CaptureMode::Input)
            && self.modes.contains(&CaptureMode::Output)
    }

    /// Checks the capture samples everything.
    ///
    /// # Errors
    ///
    /// Returns a `SYNTH-031-CAPTURE` error otherwise.
    pub fn validate(&self) -> SynthResult<()> {
        if self.captures_everything() {
            Ok(())
        } else {
            Err(SynthesisError::coded(
                codes::CAPTURE,
                format!(
                    "Data capture must sample 100% of input and output (enabled: {}, sampling: {}%, modes: {:?})",
                    self.enable_capture, self.initial_sampling_percentage, self.modes
                ),
            )
            .with_fix_hint("Use DataCaptureConfig::always_on."))
        }
    }

    pub(crate) fn to_expr(&self) -> Expr {
        Expr::map([
            (
                "CaptureOptions",
                Expr::list(
                    self.modes
                        .iter()
                        .map(|m| Expr::map([("CaptureMode", Expr::from(m.as_str()))])),
                ),
            ),
            ("DestinationS3Uri", self.destination.clone()),
            ("EnableCapture", Expr::from(self.enable_capture)),
            ("InitialSamplingPercentage", Expr::from(self.initial_sampling_percentage)),
        ])
    }
}

/// The endpoint configuration resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfigSpec {
    /// Logical ID.
    pub logical_id: String,
    /// Variants. Each serves the chain's model.
    pub variants: Vec<ProductionVariant>,
    /// Data capture.
    pub data_capture: DataCaptureConfig,
}

impl EndpointConfigSpec {
    fn to_resource(&self, model_id: &str) -> SynthResult<Resource> {
        if self.variants.is_empty() {
            return Err(SynthesisError::coded(
                codes::INFERENCE,
                format!("Endpoint configuration '{}' has no production variants", self.logical_id),
            ));
        }
        if let Some(variant) = self.variants.iter().find(|v| v.initial_instance_count == 0) {
            return Err(SynthesisError::coded(
                codes::INFERENCE,
                format!("Variant '{}' needs at least one instance", variant.variant_name),
            ));
        }
        self.data_capture.validate()?;
        let model_name = Expr::get_att(model_id, "ModelName");
        Ok(Resource::new(types::SAGEMAKER_ENDPOINT_CONFIG)
            .with_property(
                "ProductionVariants",
                Expr::list(self.variants.iter().map(|v| v.to_expr(model_name.clone()))),
            )
            .with_property("DataCaptureConfig", self.data_capture.to_expr())
            .with_dependency(model_id))
    }
}

/// The endpoint resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    /// Logical ID.
    pub logical_id: String,
}

/// Model → configuration → endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceChain {
    /// The model.
    pub model: ModelSpec,
    /// The configuration.
    pub config: EndpointConfigSpec,
    /// The endpoint.
    pub endpoint: EndpointSpec,
}

/// Handles to a lowered chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRefs {
    /// Model logical ID.
    pub model_id: String,
    /// Configuration logical ID.
    pub config_id: String,
    /// Endpoint logical ID.
    pub endpoint_id: String,
}

impl InferenceRefs {
    /// The endpoint's physical name.
    #[must_use]
    pub fn endpoint_name(&self) -> Expr {
        Expr::get_att(&self.endpoint_id, "EndpointName")
    }

    /// The endpoint ARN (`Ref` of an endpoint).
    #[must_use]
    pub fn endpoint_arn(&self) -> Expr {
        Expr::reference(&self.endpoint_id)
    }
}

impl InferenceChain {
    /// Lowers the chain with explicit ordering edges.
    ///
    /// # Errors
    ///
    /// Returns an error if a descriptor is malformed or builder validation
    /// fails.
    pub fn add_to(&self, builder: &mut StackBuilder) -> SynthResult<InferenceRefs> {
        let model_id = &self.model.logical_id;
        let config_id = &self.config.logical_id;
        let endpoint_id = &self.endpoint.logical_id;

        builder.add_resource(model_id, self.model.to_resource()?)?;
        builder.add_resource(config_id, self.config.to_resource(model_id)?)?;
        builder.add_resource(
            endpoint_id,
            Resource::new(types::SAGEMAKER_ENDPOINT)
                .with_property("EndpointConfigName", Expr::get_att(config_id, "EndpointConfigName"))
                .with_dependency(config_id),
        )?;
        debug!(model = %model_id, config = %config_id, endpoint = %endpoint_id, "lowered inference chain");

        Ok(InferenceRefs {
            model_id: model_id.clone(),
            config_id: config_id.clone(),
            endpoint_id: endpoint_id.clone(),
        })
    }
}

/// Progress of an endpoint from nothing to serving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EndpointLifecycle {
    /// Nothing registered.
    #[default]
    NoModel,
    /// The model exists.
    ModelRegistered,
    /// The configuration exists.
    ConfigurationRegistered,
    /// The endpoint serves traffic.
    EndpointLive,
}

impl EndpointLifecycle {
    /// The following state, if any.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::NoModel => Some(Self::ModelRegistered),
            Self::ModelRegistered => Some(Self::ConfigurationRegistered),
            Self::ConfigurationRegistered => Some(Self::EndpointLive),
            Self::EndpointLive => None,
        }
    }

    /// Moves one step forward to `target`.
    ///
    /// # Errors
    ///
    /// Returns a `SYNTH-030-INFERENCE` error if `target` is not the
    /// immediate successor.
    pub fn advance(&mut self, target: Self) -> SynthResult<()> {
        if self.next() == Some(target) {
            *self = target;
            Ok(())
        } else {
            Err(SynthesisError::coded(
                codes::INFERENCE,
                format!("Endpoint cannot move from {self} to {target}"),
            )
            .with_fix_hint("Create the model, then the configuration, then the endpoint."))
        }
    }

    /// The state reached once a resource of `resource_type` exists.
    #[must_use]
    pub fn reached_by(resource_type: &str) -> Option<Self> {
        match resource_type {
            types::SAGEMAKER_MODEL => Some(Self::ModelRegistered),
            types::SAGEMAKER_ENDPOINT_CONFIG => Some(Self::ConfigurationRegistered),
            types::SAGEMAKER_ENDPOINT => Some(Self::EndpointLive),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoModel => "NoModel",
            Self::ModelRegistered => "ModelRegistered",
            Self::ConfigurationRegistered => "ConfigurationRegistered",
            Self::EndpointLive => "EndpointLive",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::BucketRef;
    use crate::template::Parameter;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn chain() -> InferenceChain {
        let bucket = BucketRef::imported("models-${AWS::AccountId}");
        InferenceChain {
            model: ModelSpec {
                logical_id: "CaptionModel".into(),
                image: "img:${AWS::Region}".into(),
                artifact: ArtifactLocation::new(bucket.clone(), "model.tar.gz").unwrap(),
                execution_role_arn: Expr::reference("RoleArn"),
                placement: None,
            },
            config: EndpointConfigSpec {
                logical_id: "CaptionEndpointConfig".into(),
                variants: vec![ProductionVariant {
                    variant_name: "AllTraffic".into(),
                    instance_type: "ml.m5.xlarge".into(),
                    initial_instance_count: 1,
                }],
                data_capture: DataCaptureConfig::always_on(bucket.s3_uri("datacapture/")),
            },
            endpoint: EndpointSpec {
                logical_id: "CaptionEndpoint".into(),
            },
        }
    }

    fn builder() -> StackBuilder {
        let mut builder = StackBuilder::new("Test");
        builder.add_parameter("RoleArn", Parameter::string("arn:aws:iam::1:role/x", "role")).unwrap();
        builder
    }

    #[test]
    fn test_chain_has_explicit_edges() {
        let mut builder = builder();
        let refs = chain().add_to(&mut builder).unwrap();
        assert_eq!(refs.endpoint_name(), Expr::get_att("CaptionEndpoint", "EndpointName"));

        let config = builder.get("CaptionEndpointConfig").unwrap();
        assert!(config.depends_on.contains("CaptionModel"));
        let endpoint = builder.get("CaptionEndpoint").unwrap();
        assert!(endpoint.depends_on.contains("CaptionEndpointConfig"));

        let stack = builder.build().unwrap();
        let order = stack.creation_order();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("CaptionModel") < pos("CaptionEndpointConfig"));
        assert!(pos("CaptionEndpointConfig") < pos("CaptionEndpoint"));
    }

    #[test]
    fn test_model_and_capture_properties() {
        let mut builder = builder();
        chain().add_to(&mut builder).unwrap();
        let model = serde_json::to_value(builder.get("CaptionModel").unwrap()).unwrap();
        assert_eq!(
            model["Properties"]["PrimaryContainer"],
            json!({
                "Image": {"Fn::Sub": "img:${AWS::Region}"},
                "ModelDataUrl": {"Fn::Sub": "s3://models-${AWS::AccountId}/model.tar.gz"}
            })
        );
        let config = serde_json::to_value(builder.get("CaptionEndpointConfig").unwrap()).unwrap();
        assert_eq!(
            config["Properties"]["DataCaptureConfig"],
            json!({
                "CaptureOptions": [{"CaptureMode": "Input"}, {"CaptureMode": "Output"}],
                "DestinationS3Uri": {"Fn::Sub": "s3://models-${AWS::AccountId}/datacapture/"},
                "EnableCapture": true,
                "InitialSamplingPercentage": 100
            })
        );
        assert_eq!(
            config["Properties"]["ProductionVariants"][0]["ModelName"],
            json!({"Fn::GetAtt": ["CaptionModel", "ModelName"]})
        );
    }

    #[test]
    fn test_partial_capture_rejected() {
        let mut bad = chain();
        bad.config.data_capture.initial_sampling_percentage = 50;
        let err = bad.add_to(&mut builder()).unwrap_err();
        assert_eq!(err.code(), Some(codes::CAPTURE));

        let mut bad = chain();
        bad.config.data_capture.modes = vec![CaptureMode::Input];
        assert!(bad.add_to(&mut builder()).is_err());
    }

    #[test]
    fn test_empty_variants_rejected() {
        let mut bad = chain();
        bad.config.variants.clear();
        assert_eq!(bad.add_to(&mut builder()).unwrap_err().code(), Some(codes::INFERENCE));
    }

    #[test]
    fn test_lifecycle_is_one_way() {
        let mut state = EndpointLifecycle::default();
        assert!(state.advance(EndpointLifecycle::EndpointLive).is_err());
        state.advance(EndpointLifecycle::ModelRegistered).unwrap();
        state.advance(EndpointLifecycle::ConfigurationRegistered).unwrap();
        state.advance(EndpointLifecycle::EndpointLive).unwrap();
        assert_eq!(state.next(), None);
        assert!(state.advance(EndpointLifecycle::NoModel).is_err());
        assert_eq!(
            EndpointLifecycle::reached_by(types::SAGEMAKER_ENDPOINT_CONFIG),
            Some(EndpointLifecycle::ConfigurationRegistered)
        );
    }
}
