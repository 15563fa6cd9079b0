//! The image-captioning topology.
//!
//! One parameterized definition covers every revision of the stack; the
//! differences between revisions are the flags in [`TopologyVariant`].
//! Resources are declared leaf-first: network, storage, access role,
//! perimeter, inference chain, automation functions, event rule.

use crate::config::StackConfig;
use crate::core::Expr;
use crate::errors::{SynthResult, SynthesisError};
use crate::events::{pipeline_arn_expr, NotificationFilter, PipelineEventSchema};
use crate::network::{verify_private_isolation, NetworkRefs};
use crate::resources::{
    iam::PASSED_TO_SERVICE, ArtifactLocation, AutoDeleteProvider, BucketRef, BucketSpec, CodeLocation,
    DataCaptureConfig, DeployEnvironment, EndpointConfigSpec, EndpointSpec, EventRuleSpec, FunctionRef, FunctionSpec,
    InferenceChain, InferenceRefs, ManagedPolicy, ModelSpec, PolicyStatement, ProductionVariant, Role, RoleRef,
    SecurityGroup, ServicePrincipal, VpcPlacement, PIPELINE_NAME,
};
use crate::stack::{Stack, StackBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, info_span, warn};

/// Logical IDs of the topology's resources.
pub mod ids {
    /// Role assumed by the inference service.
    pub const INFERENCE_ROLE: &str = "SageMakerExecRole";
    /// Endpoint security group.
    pub const ENDPOINT_SECURITY_GROUP: &str = "SmEndpointSG";
    /// Model.
    pub const MODEL: &str = "CaptionModel";
    /// Endpoint configuration.
    pub const ENDPOINT_CONFIG: &str = "CaptionEndpointConfig";
    /// Endpoint.
    pub const ENDPOINT: &str = "CaptionEndpoint";
    /// Ingest bucket.
    pub const INGEST_BUCKET: &str = "IngestBucket";
    /// Policy letting the auto-delete provider empty the ingest bucket.
    pub const INGEST_BUCKET_POLICY: &str = "IngestBucketPolicy";
    /// Custom resource that empties the ingest bucket on teardown.
    pub const INGEST_AUTO_DELETE: &str = "IngestBucketAutoDeleteObjects";
    /// Provider function backing the auto-delete custom resource.
    pub const AUTO_DELETE_PROVIDER: &str = "IngestBucketAutoDeleteProvider";
    /// Role of the auto-delete provider.
    pub const AUTO_DELETE_ROLE: &str = "IngestBucketAutoDeleteProviderRole";
    /// Security group of both functions.
    pub const FUNCTION_SECURITY_GROUP: &str = "AutomationFnSG";
    /// Trigger function role.
    pub const TRIGGER_ROLE: &str = "TriggerPipelineFnRole";
    /// Trigger function.
    pub const TRIGGER_FUNCTION: &str = "TriggerPipelineFn";
    /// Lets the ingest bucket invoke the trigger function.
    pub const TRIGGER_PERMISSION: &str = "IngestBucketAllowTriggerPipelineFn";
    /// Deploy function role.
    pub const DEPLOY_ROLE: &str = "DeployModelFnRole";
    /// Deploy function.
    pub const DEPLOY_FUNCTION: &str = "DeployModelFn";
    /// Rule matching pipeline success.
    pub const PIPELINE_SUCCEEDED_RULE: &str = "PipelineSucceededRule";
}

/// Revision flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyVariant {
    /// Declare the ingest bucket notification, both functions and the rule.
    #[serde(default = "default_true")]
    pub automation: bool,
    /// Success-event shape the rule subscribes to.
    #[serde(default)]
    pub event_schema: PipelineEventSchema,
    /// Admit HTTPS from the network's own CIDR on the endpoint group.
    #[serde(default = "default_true")]
    pub endpoint_https_ingress: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TopologyVariant {
    fn default() -> Self {
        Self {
            automation: true,
            event_schema: PipelineEventSchema::default(),
            endpoint_https_ingress: true,
        }
    }
}

impl TopologyVariant {
    /// The first revision: network, storage and the inference chain only.
    #[must_use]
    pub fn endpoint_only() -> Self {
        Self {
            automation: false,
            event_schema: PipelineEventSchema::default(),
            endpoint_https_ingress: false,
        }
    }
}

/// Synthesizes the topology from a configuration.
#[derive(Debug, Clone)]
pub struct CaptionTopology {
    config: StackConfig,
}

struct Declared {
    network: NetworkRefs,
    model_bucket: BucketRef,
    inference_role: RoleRef,
    endpoint_sg: Expr,
    inference: InferenceRefs,
}

impl CaptionTopology {
    /// Creates a topology for `config`.
    #[must_use]
    pub fn new(config: StackConfig) -> Self {
        Self { config }
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Builds and validates the stack.
    ///
    /// # Errors
    ///
    /// Returns the first synthesis error: invalid configuration, network
    /// sizing, least-privilege, inference, capture, pattern or graph errors.
    pub fn synthesize(&self) -> SynthResult<Stack> {
        let config = &self.config;
        let span = info_span!("synthesize", stack = %config.stack_name);
        let _guard = span.enter();

        config.validate().map_err(SynthesisError::from)?;
        let mut builder = StackBuilder::new(&config.stack_name).description(
            config
                .description
                .clone()
                .unwrap_or_else(|| "Image-captioning inference endpoint and retraining automation".to_string()),
        );

        let declared = self.declare_core(&mut builder)?;
        if config.variant.automation {
            self.declare_automation(&mut builder, &declared)?;
        } else {
            BucketSpec::ephemeral(ids::INGEST_BUCKET, &config.ingest.bucket, self.auto_delete_provider())
                .add_to(&mut builder)?;
        }

        builder.add_output("VpcId", declared.network.vpc_id(), "Network ID")?;
        builder.add_output("EndpointName", declared.inference.endpoint_name(), "Inference endpoint name")?;
        builder.add_output("ModelBucketName", declared.model_bucket.name(), "Bucket holding model artifacts")?;
        builder.add_output(
            "IngestBucketName",
            Expr::reference(ids::INGEST_BUCKET),
            "Bucket receiving training images",
        )?;

        let stack = builder.build()?;
        verify_private_isolation(&stack)?;
        info!(
            resources = stack.resource_count(),
            fingerprint = %stack.fingerprint(),
            "synthesized stack"
        );
        Ok(stack)
    }

    fn declare_core(&self, builder: &mut StackBuilder) -> SynthResult<Declared> {
        let config = &self.config;
        let network = config.network.plan()?.add_to(builder)?;
        let model_bucket = BucketRef::imported(&config.model.bucket);

        let inference_role = Role::new(ids::INFERENCE_ROLE, ServicePrincipal::SageMaker)
            .with_description("Execution role of the captioning model")
            .with_managed_policy(ManagedPolicy::AmazonS3ReadOnlyAccess)
            .with_managed_policy(ManagedPolicy::AmazonEc2ContainerRegistryReadOnly)
            .add_to(builder)?;

        let endpoint_sg = SecurityGroup::endpoint(
            ids::ENDPOINT_SECURITY_GROUP,
            network.vpc_id(),
            network.vpc_cidr(),
            config.variant.endpoint_https_ingress,
        )
        .add_to(builder)?;

        let chain = InferenceChain {
            model: ModelSpec {
                logical_id: ids::MODEL.to_string(),
                image: config.model.image.clone(),
                artifact: ArtifactLocation::new(model_bucket.clone(), &config.model.artifact_key)?,
                execution_role_arn: inference_role.arn(),
                placement: Some(Self::model_placement(&network, &endpoint_sg)),
            },
            config: EndpointConfigSpec {
                logical_id: ids::ENDPOINT_CONFIG.to_string(),
                variants: vec![self.production_variant()],
                data_capture: DataCaptureConfig::always_on(model_bucket.s3_uri(&config.model.capture_prefix)),
            },
            endpoint: EndpointSpec {
                logical_id: ids::ENDPOINT.to_string(),
            },
        };
        let inference = chain.add_to(builder)?;

        Ok(Declared {
            network,
            model_bucket,
            inference_role,
            endpoint_sg,
            inference,
        })
    }

    fn declare_automation(&self, builder: &mut StackBuilder, declared: &Declared) -> SynthResult<()> {
        let config = &self.config;
        let function_sg = SecurityGroup {
            logical_id: ids::FUNCTION_SECURITY_GROUP.to_string(),
            description: "Automation functions: outbound only".to_string(),
            vpc_id: declared.network.vpc_id(),
            ingress: Vec::new(),
            allow_all_outbound: true,
        }
        .add_to(builder)?;
        let function_placement = VpcPlacement {
            subnets: declared.network.private_subnet_ids(),
            security_group_ids: vec![function_sg],
        };

        let trigger = self.declare_trigger(builder, &function_placement)?;
        let ingest = BucketSpec::ephemeral(ids::INGEST_BUCKET, &config.ingest.bucket, self.auto_delete_provider());
        trigger.grant_invoke(
            builder,
            ids::TRIGGER_PERMISSION,
            ServicePrincipal::S3,
            ingest.bucket_ref().arn(),
            Some(Expr::reference(crate::core::pseudo::ACCOUNT_ID)),
        )?;
        ingest
            .with_notification(
                NotificationFilter::put_under(&config.ingest.prefix),
                trigger.arn(),
                ids::TRIGGER_PERMISSION,
            )
            .add_to(builder)?;

        let deploy = self.declare_deploy(builder, declared, &function_placement)?;

        if !config.variant.event_schema.is_documented() {
            warn!(
                schema = ?config.variant.event_schema,
                "rule uses a pipelineName predicate the service never emits; deployments will not fire"
            );
        }
        EventRuleSpec {
            logical_id: ids::PIPELINE_SUCCEEDED_RULE.to_string(),
            description: format!("Deploy the newest model when {} succeeds", config.pipeline.name),
            pattern: config.variant.event_schema.success_pattern(&config.pipeline.name),
            enabled: true,
        }
        .add_to(builder, &deploy)?;
        debug!("declared automation");
        Ok(())
    }

    fn auto_delete_provider(&self) -> AutoDeleteProvider {
        let functions = &self.config.functions;
        AutoDeleteProvider {
            handler: functions.auto_delete.handler.clone(),
            runtime: functions.runtime,
            timeout_secs: functions.auto_delete.timeout_secs,
            memory_mb: functions.auto_delete.memory_mb,
            code: CodeLocation {
                bucket: functions.code_bucket.clone(),
                key: functions.auto_delete.code_key.clone(),
            },
        }
    }

    fn declare_trigger(&self, builder: &mut StackBuilder, placement: &VpcPlacement) -> SynthResult<FunctionRef> {
        let config = &self.config;
        let role = Role::new(ids::TRIGGER_ROLE, ServicePrincipal::Lambda)
            .with_managed_policy(ManagedPolicy::AwsLambdaBasicExecutionRole)
            .with_managed_policy(ManagedPolicy::AwsLambdaVpcAccessExecutionRole)
            .with_statement(PolicyStatement::allow(
                ["sagemaker:StartPipelineExecution"],
                [pipeline_arn_expr(&config.pipeline.name)],
            ))
            .add_to(builder)?;
        FunctionSpec {
            logical_id: ids::TRIGGER_FUNCTION.to_string(),
            handler: config.functions.trigger.handler.clone(),
            runtime: config.functions.runtime,
            role_arn: role.arn(),
            environment: BTreeMap::from([(PIPELINE_NAME.to_string(), Expr::from(config.pipeline.name.as_str()))]),
            timeout_secs: config.functions.trigger.timeout_secs,
            memory_mb: config.functions.trigger.memory_mb,
            placement: Some(placement.clone()),
            code: CodeLocation {
                bucket: config.functions.code_bucket.clone(),
                key: config.functions.trigger.code_key.clone(),
            },
        }
        .add_to(builder)
    }

    fn declare_deploy(
        &self,
        builder: &mut StackBuilder,
        declared: &Declared,
        placement: &VpcPlacement,
    ) -> SynthResult<FunctionRef> {
        let config = &self.config;
        let bucket = &declared.model_bucket;
        let output_prefix = &config.pipeline.output_prefix;
        let sagemaker_arn = |kind: &str| {
            Expr::sub(format!(
                "arn:${{AWS::Partition}}:sagemaker:${{AWS::Region}}:${{AWS::AccountId}}:{kind}/captionmodel-*"
            ))
        };

        let role = Role::new(ids::DEPLOY_ROLE, ServicePrincipal::Lambda)
            .with_managed_policy(ManagedPolicy::AwsLambdaBasicExecutionRole)
            .with_managed_policy(ManagedPolicy::AwsLambdaVpcAccessExecutionRole)
            .with_statement(PolicyStatement::allow(["sagemaker:CreateModel"], [sagemaker_arn("model")]))
            .with_statement(PolicyStatement::allow(
                ["sagemaker:CreateEndpointConfig"],
                [sagemaker_arn("endpoint-config")],
            ))
            .with_statement(PolicyStatement::allow(
                ["sagemaker:UpdateEndpoint", "sagemaker:DescribeEndpoint"],
                [declared.inference.endpoint_arn()],
            ))
            .with_statement(
                PolicyStatement::allow(["s3:ListBucket"], [bucket.arn()]).with_condition(
                    "StringLike",
                    "s3:prefix",
                    format!("{output_prefix}*"),
                ),
            )
            .with_statement(PolicyStatement::allow(["s3:GetObject"], [bucket.objects_arn(output_prefix)]))
            .with_statement(
                PolicyStatement::allow(["iam:PassRole"], [declared.inference_role.arn()]).with_condition(
                    "StringEquals",
                    PASSED_TO_SERVICE,
                    ServicePrincipal::SageMaker.as_str(),
                ),
            )
            .add_to(builder)?;

        FunctionSpec {
            logical_id: ids::DEPLOY_FUNCTION.to_string(),
            handler: config.functions.deploy.handler.clone(),
            runtime: config.functions.runtime,
            role_arn: role.arn(),
            environment: DeployEnvironment::template(
                declared.inference_role.arn(),
                declared.inference.endpoint_name(),
                &config.model.image,
                bucket.name(),
                output_prefix,
                &Self::model_placement(&declared.network, &declared.endpoint_sg),
            ),
            timeout_secs: config.functions.deploy.timeout_secs,
            memory_mb: config.functions.deploy.memory_mb,
            placement: Some(placement.clone()),
            code: CodeLocation {
                bucket: config.functions.code_bucket.clone(),
                key: config.functions.deploy.code_key.clone(),
            },
        }
        .add_to(builder)
    }

    fn model_placement(network: &NetworkRefs, endpoint_sg: &Expr) -> VpcPlacement {
        VpcPlacement {
            subnets: network.private_subnet_ids(),
            security_group_ids: vec![endpoint_sg.clone()],
        }
    }

    fn production_variant(&self) -> ProductionVariant {
        ProductionVariant {
            variant_name: self.config.model.variant_name.clone(),
            instance_type: self.config.model.instance_type.clone(),
            initial_instance_count: self.config.model.instance_count,
        }
    }
}

/// Synthesizes the topology for `config`.
///
/// # Errors
///
/// See [`CaptionTopology::synthesize`].
pub fn synthesize(config: &StackConfig) -> SynthResult<Stack> {
    CaptionTopology::new(config.clone()).synthesize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::codes;
    use crate::network::{analyze_routing, DefaultRoute};
    use crate::resources::{is_allowed, Grant};
    use crate::template::types;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stack() -> Stack {
        synthesize(&StackConfig::default()).unwrap()
    }

    fn properties(stack: &Stack, id: &str) -> serde_json::Value {
        serde_json::to_value(stack.resource(id).unwrap()).unwrap()["Properties"].clone()
    }

    #[test]
    fn test_default_topology_resources() {
        let stack = stack();
        let template = stack.template();
        assert_eq!(template.resources_of_type(types::SUBNET).len(), 4);
        assert_eq!(template.resources_of_type(types::NAT_GATEWAY).len(), 2);
        assert_eq!(template.resources_of_type(types::LAMBDA_FUNCTION).len(), 3);
        assert_eq!(template.resources_of_type(types::LAMBDA_PERMISSION).len(), 2);
        assert_eq!(template.resources_of_type(types::EVENTS_RULE).len(), 1);
        assert_eq!(template.resources_of_type(types::BUCKET), vec![ids::INGEST_BUCKET]);
        assert_eq!(template.resources_of_type(types::ROLE).len(), 4);
        assert_eq!(template.resources_of_type(types::S3_AUTO_DELETE_OBJECTS), vec![ids::INGEST_AUTO_DELETE]);
    }

    #[test]
    fn test_ingest_bucket_emptied_by_custom_resource() {
        let stack = stack();
        let props = properties(&stack, ids::INGEST_AUTO_DELETE);
        assert_eq!(props["BucketName"], json!({"Ref": ids::INGEST_BUCKET}));
        assert_eq!(props["ServiceToken"], json!({"Fn::GetAtt": [ids::AUTO_DELETE_PROVIDER, "Arn"]}));
        for (dependent, dependency) in [
            (ids::INGEST_AUTO_DELETE, ids::INGEST_BUCKET_POLICY),
            (ids::INGEST_AUTO_DELETE, ids::AUTO_DELETE_PROVIDER),
            (ids::INGEST_BUCKET_POLICY, ids::INGEST_BUCKET),
        ] {
            assert!(stack.dependencies_of(dependent).contains(dependency), "{dependent} -> {dependency}");
            assert!(stack.creation_index(dependency) < stack.creation_index(dependent));
        }

        let policy = properties(&stack, ids::INGEST_BUCKET_POLICY);
        assert_eq!(policy["Bucket"], json!({"Ref": ids::INGEST_BUCKET}));
        assert_eq!(
            policy["PolicyDocument"]["Statement"][0]["Principal"]["AWS"],
            json!({"Fn::GetAtt": [ids::AUTO_DELETE_ROLE, "Arn"]})
        );

        let code = &properties(&stack, ids::AUTO_DELETE_PROVIDER)["Code"];
        assert_eq!(code["S3Key"], json!({"Ref": "IngestBucketAutoDeleteProviderCodeKey"}));
        assert_eq!(
            stack.template().parameters["IngestBucketAutoDeleteProviderCodeKey"].default.as_deref(),
            Some("lambda/auto-delete-objects.zip")
        );
    }

    #[test]
    fn test_endpoint_created_after_configuration_and_model() {
        let stack = stack();
        let model = stack.creation_index(ids::MODEL).unwrap();
        let config = stack.creation_index(ids::ENDPOINT_CONFIG).unwrap();
        let endpoint = stack.creation_index(ids::ENDPOINT).unwrap();
        assert!(model < config && config < endpoint);
        assert!(stack.resource(ids::ENDPOINT).unwrap().depends_on.contains(ids::ENDPOINT_CONFIG));
        assert!(stack.resource(ids::ENDPOINT_CONFIG).unwrap().depends_on.contains(ids::MODEL));
    }

    #[test]
    fn test_private_subnets_isolated_from_internet() {
        let routing = analyze_routing(&stack());
        let private: Vec<_> = routing.iter().filter(|r| !r.public).collect();
        assert_eq!(private.len(), 2);
        for subnet in private {
            assert!(!subnet.is_publicly_routable());
            assert!(matches!(subnet.default_route, DefaultRoute::NatGateway(_)));
            assert!(subnet.reaches_storage_privately());
        }
    }

    #[test]
    fn test_no_account_or_region_literals() {
        let json = stack().to_json_pretty().unwrap();
        assert!(!json.contains("564750642551"));
        assert!(!json.contains("eu-north-1"));
    }

    #[test]
    fn test_capture_always_on() {
        let props = properties(&stack(), ids::ENDPOINT_CONFIG);
        let capture = &props["DataCaptureConfig"];
        assert_eq!(capture["EnableCapture"], true);
        assert_eq!(capture["InitialSamplingPercentage"], 100);
        assert_eq!(
            capture["DestinationS3Uri"],
            json!({"Fn::Sub": "s3://cdk-hnb659fds-assets-${AWS::AccountId}-${AWS::Region}/datacapture/"})
        );
    }

    #[test]
    fn test_ingest_bucket_notification() {
        let stack = stack();
        let props = properties(&stack, ids::INGEST_BUCKET);
        let config = &props["NotificationConfiguration"]["LambdaConfigurations"][0];
        assert_eq!(config["Event"], "s3:ObjectCreated:Put");
        assert_eq!(config["Filter"]["S3Key"]["Rules"][0]["Value"], "train-images/");
        assert!(stack.resource(ids::INGEST_BUCKET).unwrap().depends_on.contains(ids::TRIGGER_PERMISSION));
    }

    #[test]
    fn test_rule_uses_pinned_schema() {
        let props = properties(&stack(), ids::PIPELINE_SUCCEEDED_RULE);
        assert_eq!(
            props["EventPattern"]["detail"]["currentPipelineExecutionStatus"],
            json!(["Succeeded"])
        );
        assert!(props["EventPattern"]["detail"].get("pipelineName").is_none());
    }

    #[test]
    fn test_deploy_environment_contract() {
        let props = properties(&stack(), ids::DEPLOY_FUNCTION);
        let vars = props["Environment"]["Variables"].as_object().unwrap();
        for key in ["SM_ROLE_ARN", "ENDPOINT_NAME", "INFERENCE_IMAGE", "ASSET_BUCKET", "OUTPUT_PREFIX", "VPC_CONFIG"] {
            assert!(vars.contains_key(key), "missing {key}");
        }
        assert_eq!(vars["OUTPUT_PREFIX"], "output/");
    }

    #[test]
    fn test_endpoint_only_variant() {
        let config = StackConfig::default().with_variant(TopologyVariant::endpoint_only());
        let stack = synthesize(&config).unwrap();
        assert_eq!(
            stack.template().resources_of_type(types::LAMBDA_FUNCTION),
            vec![ids::AUTO_DELETE_PROVIDER]
        );
        assert!(stack.resource(ids::INGEST_BUCKET).is_some());
        assert!(stack.resource(ids::INGEST_AUTO_DELETE).is_some());
        assert!(properties(&stack, ids::ENDPOINT_SECURITY_GROUP).get("SecurityGroupIngress").is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = StackConfig::default();
        config.model.instance_count = 0;
        assert_eq!(synthesize(&config).unwrap_err().code(), Some(codes::CONFIG));

        let mut config = StackConfig::default();
        config.network.nat_gateways = 0;
        assert_eq!(synthesize(&config).unwrap_err().code(), Some(codes::NETWORK));

        let config = StackConfig::default().with_artifact_key("../escape.tar.gz");
        assert_eq!(synthesize(&config).unwrap_err().code(), Some(codes::INFERENCE));
    }

    #[test]
    fn test_trigger_role_is_narrow() {
        let stack = stack();
        let props = properties(&stack, ids::TRIGGER_ROLE);
        let statements = &props["Policies"][0]["PolicyDocument"]["Statement"];
        assert_eq!(statements.as_array().unwrap().len(), 1);
        assert_eq!(statements[0]["Action"], json!(["sagemaker:StartPipelineExecution"]));

        let grant = Grant {
            effect: crate::resources::Effect::Allow,
            actions: vec!["sagemaker:StartPipelineExecution".into()],
            resources: vec!["arn:aws:sagemaker:eu-north-1:1:pipeline/captionmodelpipeline".into()],
            conditions: BTreeMap::new(),
        };
        assert!(!is_allowed(
            &[grant],
            "sagemaker:StartPipelineExecution",
            "arn:aws:sagemaker:eu-north-1:1:pipeline/other",
            &BTreeMap::new()
        ));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(stack().fingerprint(), stack().fingerprint());
        let other = synthesize(&StackConfig::default().with_artifact_key("v2/model.tar.gz")).unwrap();
        assert_ne!(stack().fingerprint(), other.fingerprint());
    }
}
