//! An in-memory control plane.
//!
//! Deploying walks a stack in creation order, resolving every property
//! against the resources created so far. A resource whose dependencies do
//! not exist yet fails the deployment and rolls back what was created.
//! Bucket notifications and event rules deliver to registered
//! [`FunctionHandler`]s, which call back through a role-scoped
//! [`ServiceClient`].

use super::client::ServiceClient;
use super::handlers::{FunctionHandler, Invocation, InvocationContext, InvocationOutcome, InvocationSource};
use super::records::{
    generated_name, physical_suffix, BucketState, CloudEnvironment, DeployedResource, DeploymentResolver,
    EndpointConfigRecord, EndpointRecord, FunctionRecord, ModelRecord, ObjectSummary, PermissionRecord,
    PipelineExecution, RoleRecord, RuleRecord, StackDeployment, VariantRecord,
};
use crate::core::Expr;
use crate::errors::CloudError;
use crate::events::sink::activity;
use crate::events::{
    object_event_record, pipeline_arn, EventPattern, EventSink, NoOpEventSink, NotificationFilter,
    PipelineExecutionStatus, PipelineStatusChange, S3EventType,
};
use crate::resources::{grants_from_document, is_allowed, EndpointLifecycle, ManagedPolicy, ServicePrincipal};
use crate::stack::Stack;
use crate::template::{types, DeletionPolicy, Resource};
use crate::utils::{iso_timestamp, now_utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Outcome of a teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Logical IDs whose physical resources were deleted.
    pub deleted: Vec<String>,
    /// Logical IDs kept by their deletion policy.
    pub retained: Vec<String>,
}

#[derive(Default)]
struct CloudState {
    sequence: u64,
    stacks: BTreeMap<String, StackDeployment>,
    buckets: BTreeMap<String, BucketState>,
    roles: BTreeMap<String, RoleRecord>,
    functions: BTreeMap<String, FunctionRecord>,
    permissions: Vec<PermissionRecord>,
    rules: BTreeMap<String, RuleRecord>,
    models: BTreeMap<String, ModelRecord>,
    endpoint_configs: BTreeMap<String, EndpointConfigRecord>,
    endpoints: BTreeMap<String, EndpointRecord>,
    pipelines: BTreeSet<String>,
    executions: Vec<PipelineExecution>,
    invocations: Vec<Invocation>,
}

impl CloudState {
    fn artifact_exists(&self, uri: &str) -> bool {
        uri.strip_prefix("s3://")
            .and_then(|rest| rest.split_once('/'))
            .is_some_and(|(bucket, key)| {
                self.buckets
                    .get(bucket)
                    .is_some_and(|b| b.objects.contains_key(key))
            })
    }

    fn admits(&self, function_arn: &str, principal: ServicePrincipal, source_arn: &str, account: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p.admits(function_arn, principal.as_str(), source_arn, account))
    }
}

struct Inner {
    env: CloudEnvironment,
    state: Mutex<CloudState>,
    handlers: RwLock<HashMap<String, Arc<dyn FunctionHandler>>>,
    sink: Arc<dyn EventSink>,
}

/// Shared handle to one simulated account and region.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<Inner>,
}

impl fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlane")
            .field("env", &self.inner.env)
            .field("handlers", &self.inner.handlers.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn text(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToString::to_string)
}

fn require(value: &Value, key: &str) -> Result<String, String> {
    text(value, key).ok_or_else(|| format!("property {key} is missing or not a string"))
}

/// Principals named by a policy statement, as a string or a list.
fn principals(statement: &Value) -> Vec<String> {
    match statement.pointer("/Principal/AWS") {
        Some(Value::String(arn)) => vec![arn.clone()],
        Some(Value::Array(arns)) => arns.iter().filter_map(Value::as_str).map(ToString::to_string).collect(),
        _ => Vec::new(),
    }
}

fn ec2_id(prefix: &str) -> String {
    format!("{prefix}-0{}", physical_suffix().to_ascii_lowercase())
}

impl ControlPlane {
    /// Creates a control plane that discards activity records.
    #[must_use]
    pub fn new(env: CloudEnvironment) -> Self {
        Self::with_sink(env, Arc::new(NoOpEventSink))
    }

    /// Creates a control plane that reports activity to `sink`.
    #[must_use]
    pub fn with_sink(env: CloudEnvironment, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                env,
                state: Mutex::new(CloudState::default()),
                handlers: RwLock::new(HashMap::new()),
                sink,
            }),
        }
    }

    /// The account and region.
    #[must_use]
    pub fn environment(&self) -> &CloudEnvironment {
        &self.inner.env
    }

    /// Registers the code run by the function with `logical_id`.
    pub fn register_handler(&self, logical_id: impl Into<String>, handler: Arc<dyn FunctionHandler>) {
        self.inner.handlers.write().insert(logical_id.into(), handler);
    }

    /// Declares a pipeline that exists outside any stack.
    pub fn register_pipeline(&self, name: impl Into<String>) {
        self.inner.state.lock().pipelines.insert(name.into());
    }

    /// ARN of a pipeline in this account.
    #[must_use]
    pub fn pipeline_arn(&self, name: &str) -> String {
        let env = &self.inner.env;
        pipeline_arn(&env.partition, &env.region, &env.account_id, name)
    }

    /// Resolves an expression that only uses pseudo parameters.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the expression reads a resource.
    pub fn resolve(&self, expr: &Expr) -> Result<Value, CloudError> {
        let deployment = StackDeployment::default();
        let resolver = DeploymentResolver {
            env: &self.inner.env,
            deployment: &deployment,
        };
        expr.resolve(&resolver)
            .map_err(|e| CloudError::Validation(e.to_string()))
    }

    /// Resolves a name template such as
    /// `caption-ingest-${AWS::AccountId}-${AWS::Region}`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the template reads a resource.
    pub fn resolve_text(&self, template: &str) -> Result<String, CloudError> {
        match self.resolve(&Expr::text(template))? {
            Value::String(text) => Ok(text),
            other => Ok(other.to_string()),
        }
    }

    // ---------------------------------------------------------------------
    // Stacks
    // ---------------------------------------------------------------------

    /// Deploys a stack with default parameter values.
    ///
    /// # Errors
    ///
    /// See [`ControlPlane::deploy_with_parameters`].
    pub fn deploy(&self, stack: &Stack) -> Result<StackDeployment, CloudError> {
        self.deploy_with_parameters(stack, &BTreeMap::new())
    }

    /// Deploys a stack in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack already exists, a parameter has no
    /// value, or a resource cannot be created. A failed deployment rolls
    /// back every resource it created.
    pub fn deploy_with_parameters(
        &self,
        stack: &Stack,
        overrides: &BTreeMap<String, String>,
    ) -> Result<StackDeployment, CloudError> {
        let span = info_span!("deploy", stack = %stack.name());
        let _guard = span.enter();

        let template = stack.template();
        let mut deployment = StackDeployment {
            name: stack.name().to_string(),
            fingerprint: stack.fingerprint(),
            ..StackDeployment::default()
        };
        for (name, parameter) in &template.parameters {
            let value = overrides
                .get(name)
                .or(parameter.default.as_ref())
                .ok_or_else(|| CloudError::Validation(format!("Parameter {name} has no value")))?;
            deployment.parameters.insert(name.clone(), value.clone());
        }

        let mut state = self.inner.state.lock();
        if state.stacks.contains_key(stack.name()) {
            return Err(CloudError::AlreadyExists {
                kind: "Stack".to_string(),
                name: stack.name().to_string(),
            });
        }

        for id in stack.creation_order() {
            let Some(resource) = stack.resource(id) else {
                continue;
            };
            if let Err(reason) = self.create_resource(&mut state, &mut deployment, id, resource) {
                warn!(logical_id = %id, %reason, "create failed; rolling back");
                Self::roll_back(&mut state, &deployment);
                return Err(CloudError::stack_operation(id, reason));
            }
        }

        state.stacks.insert(deployment.name.clone(), deployment.clone());
        drop(state);
        info!(
            resources = deployment.resources.len(),
            fingerprint = %deployment.fingerprint,
            "stack deployed"
        );
        Ok(deployment)
    }

    fn create_resource(
        &self,
        state: &mut CloudState,
        deployment: &mut StackDeployment,
        id: &str,
        resource: &Resource,
    ) -> Result<(), String> {
        if let Some(missing) = resource
            .dependencies()
            .into_iter()
            .find(|dep| !deployment.resources.contains_key(dep) && !deployment.parameters.contains_key(dep))
        {
            return Err(format!("dependency {missing} has not been created"));
        }
        let properties = {
            let resolver = DeploymentResolver {
                env: &self.inner.env,
                deployment: &*deployment,
            };
            Expr::Map(resource.properties.clone())
                .resolve(&resolver)
                .map_err(|e| e.to_string())?
        };
        let deployed = self.create_physical(state, &deployment.name, id, &resource.resource_type, properties)?;
        let deployed = DeployedResource {
            deletion_policy: resource.effective_deletion_policy(),
            ..deployed
        };

        if let Some(target) = EndpointLifecycle::reached_by(&resource.resource_type) {
            deployment.lifecycle.advance(target).map_err(|e| e.to_string())?;
        }
        debug!(logical_id = %id, physical_id = %deployed.physical_id, "created");
        self.inner.sink.try_emit(
            activity::RESOURCE_CREATED,
            Some(json!({
                "stack": deployment.name,
                "logical_id": id,
                "type": resource.resource_type,
                "physical_id": deployed.physical_id,
            })),
        );
        deployment.created.push(id.to_string());
        deployment.resources.insert(id.to_string(), deployed);
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn create_physical(
        &self,
        state: &mut CloudState,
        stack_name: &str,
        id: &str,
        resource_type: &str,
        properties: Value,
    ) -> Result<DeployedResource, String> {
        let env = &self.inner.env;
        let mut attributes = BTreeMap::new();
        let physical_id = match resource_type {
            types::VPC => {
                attributes.insert("CidrBlock".to_string(), require(&properties, "CidrBlock")?);
                ec2_id("vpc")
            }
            types::SUBNET => {
                attributes.insert("AvailabilityZone".to_string(), require(&properties, "AvailabilityZone")?);
                ec2_id("subnet")
            }
            types::ROUTE_TABLE => ec2_id("rtb"),
            types::ROUTE => format!(
                "{}|{}",
                require(&properties, "RouteTableId")?,
                require(&properties, "DestinationCidrBlock")?
            ),
            types::SUBNET_ROUTE_TABLE_ASSOCIATION => ec2_id("rtbassoc"),
            types::INTERNET_GATEWAY => ec2_id("igw"),
            types::VPC_GATEWAY_ATTACHMENT => ec2_id("igw-attach"),
            types::EIP => {
                attributes.insert("AllocationId".to_string(), ec2_id("eipalloc"));
                let n = state.sequence % 250 + 1;
                state.sequence += 1;
                format!("203.0.113.{n}")
            }
            types::NAT_GATEWAY => ec2_id("nat"),
            types::VPC_ENDPOINT => ec2_id("vpce"),
            types::SECURITY_GROUP => {
                let group = ec2_id("sg");
                attributes.insert("GroupId".to_string(), group.clone());
                group
            }
            types::BUCKET => self.create_bucket_resource(state, stack_name, id, &properties, &mut attributes)?,
            types::ROLE => self.create_role(state, stack_name, id, &properties, &mut attributes)?,
            types::SAGEMAKER_MODEL => {
                let role_arn = require(&properties, "ExecutionRoleArn")?;
                let role = state
                    .roles
                    .get(&role_arn)
                    .ok_or_else(|| format!("Could not access role {role_arn}"))?;
                if role.principal != ServicePrincipal::SageMaker.as_str() {
                    return Err(format!("Role {role_arn} cannot be assumed by the inference service"));
                }
                let container = properties.get("PrimaryContainer").cloned().unwrap_or(Value::Null);
                let name = generated_name(&[id], 63);
                let record = ModelRecord {
                    name: name.clone(),
                    arn: env.sagemaker_arn("model", &name),
                    image: require(&container, "Image")?,
                    model_data_url: require(&container, "ModelDataUrl")?,
                    execution_role_arn: role_arn,
                    vpc_config: properties
                        .get("VpcConfig")
                        .map(|v| serde_json::from_value(v.clone()))
                        .transpose()
                        .map_err(|e| format!("VpcConfig is malformed: {e}"))?,
                };
                attributes.insert("ModelName".to_string(), name.clone());
                attributes.insert("Arn".to_string(), record.arn.clone());
                state.models.insert(name.clone(), record);
                name
            }
            types::SAGEMAKER_ENDPOINT_CONFIG => {
                let variants: Vec<VariantRecord> = properties
                    .get("ProductionVariants")
                    .and_then(Value::as_array)
                    .ok_or("ProductionVariants is missing")?
                    .iter()
                    .map(|v| {
                        Ok(VariantRecord {
                            variant_name: require(v, "VariantName")?,
                            model_name: require(v, "ModelName")?,
                            instance_type: require(v, "InstanceType")?,
                            initial_instance_count: v
                                .get("InitialInstanceCount")
                                .and_then(Value::as_u64)
                                .and_then(|n| u32::try_from(n).ok())
                                .ok_or("InitialInstanceCount is missing")?,
                        })
                    })
                    .collect::<Result<_, String>>()?;
                if let Some(missing) = variants.iter().find(|v| !state.models.contains_key(&v.model_name)) {
                    return Err(format!("Could not find model {}", missing.model_name));
                }
                let name = generated_name(&[id], 63);
                let arn = env.sagemaker_arn("endpoint-config", &name);
                attributes.insert("EndpointConfigName".to_string(), name.clone());
                state.endpoint_configs.insert(
                    name.clone(),
                    EndpointConfigRecord {
                        name: name.clone(),
                        arn,
                        variants,
                        data_capture: properties.get("DataCaptureConfig").cloned(),
                    },
                );
                name
            }
            types::SAGEMAKER_ENDPOINT => {
                let config_name = require(&properties, "EndpointConfigName")?;
                let config = state
                    .endpoint_configs
                    .get(&config_name)
                    .ok_or_else(|| format!("Could not find endpoint configuration {config_name}"))?;
                Self::check_artifacts(state, config)?;
                let name = generated_name(&[id], 63);
                let arn = env.sagemaker_arn("endpoint", &name);
                attributes.insert("EndpointName".to_string(), name.clone());
                state.endpoints.insert(
                    name.clone(),
                    EndpointRecord {
                        name: name.clone(),
                        arn,
                        config_name,
                        history: Vec::new(),
                        lifecycle: EndpointLifecycle::EndpointLive,
                    },
                );
                name
            }
            types::LAMBDA_FUNCTION => {
                let role_arn = require(&properties, "Role")?;
                let role = state
                    .roles
                    .get(&role_arn)
                    .ok_or_else(|| format!("The role defined for the function cannot be assumed: {role_arn}"))?;
                if role.principal != ServicePrincipal::Lambda.as_str() {
                    return Err(format!("Role {role_arn} cannot be assumed by the function service"));
                }
                let name = generated_name(&[stack_name, id], 64);
                let arn = env.arn("lambda", &format!("function:{name}"));
                let environment = properties
                    .pointer("/Environment/Variables")
                    .and_then(Value::as_object)
                    .map(|vars| {
                        vars.iter()
                            .map(|(k, v)| (k.clone(), v.as_str().map_or_else(|| v.to_string(), ToString::to_string)))
                            .collect()
                    })
                    .unwrap_or_default();
                attributes.insert("Arn".to_string(), arn.clone());
                state.functions.insert(
                    arn.clone(),
                    FunctionRecord {
                        logical_id: id.to_string(),
                        name: name.clone(),
                        arn,
                        role_arn,
                        handler: require(&properties, "Handler")?,
                        environment,
                    },
                );
                name
            }
            types::LAMBDA_PERMISSION => {
                let function_arn = require(&properties, "FunctionName")?;
                if !state.functions.contains_key(&function_arn) {
                    return Err(format!("Function not found: {function_arn}"));
                }
                state.permissions.push(PermissionRecord {
                    logical_id: id.to_string(),
                    function_arn,
                    principal: require(&properties, "Principal")?,
                    source_arn: text(&properties, "SourceArn"),
                    source_account: text(&properties, "SourceAccount"),
                });
                generated_name(&[stack_name, id], 64)
            }
            types::EVENTS_RULE => {
                let pattern = properties
                    .get("EventPattern")
                    .cloned()
                    .ok_or("EventPattern is missing")
                    .and_then(|p| EventPattern::new(p).map_err(|_| "EventPattern is invalid"))?;
                let targets: Vec<String> = properties
                    .get("Targets")
                    .and_then(Value::as_array)
                    .map(|targets| targets.iter().filter_map(|t| text(t, "Arn")).collect())
                    .unwrap_or_default();
                if let Some(missing) = targets.iter().find(|t| !state.functions.contains_key(*t)) {
                    return Err(format!("Target {missing} does not exist"));
                }
                let name = generated_name(&[stack_name, id], 64);
                let arn = env.arn("events", &format!("rule/{name}"));
                attributes.insert("Arn".to_string(), arn.clone());
                state.rules.insert(
                    arn.clone(),
                    RuleRecord {
                        name: name.clone(),
                        arn,
                        pattern,
                        targets,
                        enabled: text(&properties, "State").as_deref() != Some("DISABLED"),
                    },
                );
                name
            }
            types::BUCKET_POLICY => {
                let bucket_name = require(&properties, "Bucket")?;
                let document = properties.get("PolicyDocument").ok_or("PolicyDocument is missing")?;
                let statements = document
                    .get("Statement")
                    .and_then(Value::as_array)
                    .ok_or("PolicyDocument has no Statement list")?;
                let mut policy = Vec::new();
                for statement in statements {
                    let named = principals(statement);
                    if named.is_empty() {
                        return Err("Policy statement has no AWS principal".to_string());
                    }
                    let grants = grants_from_document(&json!({ "Statement": [statement] }))?;
                    for principal in named {
                        policy.extend(grants.iter().cloned().map(|g| (principal.clone(), g)));
                    }
                }
                let bucket = state
                    .buckets
                    .get_mut(&bucket_name)
                    .ok_or_else(|| format!("The specified bucket does not exist: {bucket_name}"))?;
                bucket.policy = policy;
                attributes.insert("Bucket".to_string(), bucket_name);
                generated_name(&[stack_name, id], 64)
            }
            types::S3_AUTO_DELETE_OBJECTS => {
                let service_token = require(&properties, "ServiceToken")?;
                if !state.functions.contains_key(&service_token) {
                    return Err(format!("Provider {service_token} does not exist"));
                }
                let bucket_name = require(&properties, "BucketName")?;
                if !state.buckets.contains_key(&bucket_name) {
                    return Err(format!("The specified bucket does not exist: {bucket_name}"));
                }
                attributes.insert("ServiceToken".to_string(), service_token);
                attributes.insert("BucketArn".to_string(), env.bucket_arn(&bucket_name));
                attributes.insert("BucketName".to_string(), bucket_name);
                generated_name(&[stack_name, id], 64)
            }
            other => return Err(format!("Unsupported resource type {other}")),
        };

        let reference = match resource_type {
            types::SAGEMAKER_MODEL | types::SAGEMAKER_ENDPOINT_CONFIG | types::SAGEMAKER_ENDPOINT => {
                let kind = match resource_type {
                    types::SAGEMAKER_MODEL => "model",
                    types::SAGEMAKER_ENDPOINT_CONFIG => "endpoint-config",
                    _ => "endpoint",
                };
                env.sagemaker_arn(kind, &physical_id)
            }
            _ => physical_id.clone(),
        };
        Ok(DeployedResource {
            logical_id: id.to_string(),
            resource_type: resource_type.to_string(),
            physical_id,
            reference,
            attributes,
            properties,
            deletion_policy: DeletionPolicy::Delete,
        })
    }

    fn create_bucket_resource(
        &self,
        state: &mut CloudState,
        stack_name: &str,
        id: &str,
        properties: &Value,
        attributes: &mut BTreeMap<String, String>,
    ) -> Result<String, String> {
        let env = &self.inner.env;
        let name = text(properties, "BucketName")
            .unwrap_or_else(|| generated_name(&[stack_name, id], 63).to_ascii_lowercase());
        if state.buckets.contains_key(&name) {
            return Err(format!("{name} already exists"));
        }
        let bucket_arn = env.bucket_arn(&name);
        let configurations = properties
            .pointer("/NotificationConfiguration/LambdaConfigurations")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut notifications = Vec::with_capacity(configurations.len());
        for entry in configurations {
            let (filter, function_arn) = NotificationFilter::from_configuration(entry)
                .ok_or("NotificationConfiguration is malformed")?;
            if !state.admits(&function_arn, ServicePrincipal::S3, &bucket_arn, &env.account_id) {
                return Err(format!(
                    "Unable to validate the following destination configurations: {function_arn}"
                ));
            }
            notifications.push((filter, function_arn));
        }
        state.buckets.insert(
            name.clone(),
            BucketState {
                objects: BTreeMap::new(),
                notifications,
                policy: Vec::new(),
            },
        );
        attributes.insert("Arn".to_string(), bucket_arn);
        attributes.insert("DomainName".to_string(), format!("{name}.s3.amazonaws.com"));
        attributes.insert(
            "RegionalDomainName".to_string(),
            format!("{name}.s3.{}.amazonaws.com", env.region),
        );
        Ok(name)
    }

    fn create_role(
        &self,
        state: &mut CloudState,
        stack_name: &str,
        id: &str,
        properties: &Value,
        attributes: &mut BTreeMap<String, String>,
    ) -> Result<String, String> {
        let principal = properties
            .pointer("/AssumeRolePolicyDocument/Statement/0/Principal/Service")
            .and_then(Value::as_str)
            .ok_or("AssumeRolePolicyDocument has no service principal")?
            .to_string();
        let mut grants = Vec::new();
        for arn in properties
            .get("ManagedPolicyArns")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let arn = arn.as_str().unwrap_or_default();
            let policy = ManagedPolicy::from_arn(arn).ok_or_else(|| format!("Policy {arn} does not exist"))?;
            grants.extend(policy.grants());
        }
        for policy in properties
            .get("Policies")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let document = policy.get("PolicyDocument").ok_or("Policy has no PolicyDocument")?;
            grants.extend(grants_from_document(document)?);
        }

        let name = generated_name(&[stack_name, id], 64);
        let arn = self.inner.env.role_arn(&name);
        attributes.insert("Arn".to_string(), arn.clone());
        attributes.insert("RoleId".to_string(), format!("AROA{}", physical_suffix()));
        state.roles.insert(
            arn.clone(),
            RoleRecord {
                name: name.clone(),
                arn,
                principal,
                grants,
            },
        );
        Ok(name)
    }

    fn check_artifacts(state: &CloudState, config: &EndpointConfigRecord) -> Result<(), String> {
        for variant in &config.variants {
            let model = state
                .models
                .get(&variant.model_name)
                .ok_or_else(|| format!("Could not find model {}", variant.model_name))?;
            if !state.artifact_exists(&model.model_data_url) {
                return Err(format!(
                    "Failed to download model data for {}: {} does not exist",
                    model.name, model.model_data_url
                ));
            }
        }
        Ok(())
    }

    fn roll_back(state: &mut CloudState, deployment: &StackDeployment) {
        for id in deployment.created.iter().rev() {
            if let Some(deployed) = deployment.resources.get(id) {
                if let Err(reason) = Self::delete_physical(state, deployed, true) {
                    warn!(logical_id = %id, %reason, "rollback could not delete resource");
                }
            }
        }
    }

    /// Runs the auto-delete provider: removes every object, provided the
    /// bucket policy lets the provider's role list and delete them.
    fn empty_bucket(
        state: &mut CloudState,
        service_token: &str,
        bucket_name: &str,
        bucket_arn: &str,
    ) -> Result<(), String> {
        let role_arn = state
            .functions
            .get(service_token)
            .map(|f| f.role_arn.clone())
            .ok_or_else(|| format!("Provider {service_token} does not exist"))?;
        let Some(bucket) = state.buckets.get_mut(bucket_name) else {
            return Ok(());
        };
        let grants: Vec<_> = bucket
            .policy
            .iter()
            .filter(|(principal, _)| *principal == role_arn)
            .map(|(_, grant)| grant.clone())
            .collect();
        let context = BTreeMap::new();
        if !is_allowed(&grants, "s3:ListBucket", bucket_arn, &context) {
            return Err(format!("AccessDenied: {role_arn} cannot list {bucket_name}"));
        }
        if let Some(key) = bucket
            .objects
            .keys()
            .find(|key| !is_allowed(&grants, "s3:DeleteObject", &format!("{bucket_arn}/{key}"), &context))
        {
            return Err(format!("AccessDenied: {role_arn} cannot delete {bucket_name}/{key}"));
        }
        debug!(bucket = %bucket_name, objects = bucket.objects.len(), "emptied bucket");
        bucket.objects.clear();
        Ok(())
    }

    fn delete_physical(state: &mut CloudState, deployed: &DeployedResource, force: bool) -> Result<(), String> {
        let attribute = |key: &str| deployed.attributes.get(key).cloned().unwrap_or_default();
        match deployed.resource_type.as_str() {
            types::BUCKET => {
                let name = &deployed.physical_id;
                let non_empty = state.buckets.get(name).is_some_and(|b| !b.objects.is_empty());
                if non_empty && !force {
                    return Err(format!("The bucket {name} is not empty"));
                }
                state.buckets.remove(name);
            }
            types::BUCKET_POLICY => {
                if let Some(bucket) = state.buckets.get_mut(&attribute("Bucket")) {
                    bucket.policy.clear();
                }
            }
            types::S3_AUTO_DELETE_OBJECTS => {
                if let Err(reason) = Self::empty_bucket(
                    state,
                    &attribute("ServiceToken"),
                    &attribute("BucketName"),
                    &attribute("BucketArn"),
                ) {
                    if !force {
                        return Err(reason);
                    }
                }
            }
            types::ROLE => {
                state.roles.remove(&attribute("Arn"));
            }
            types::SAGEMAKER_MODEL => {
                state.models.remove(&deployed.physical_id);
            }
            types::SAGEMAKER_ENDPOINT_CONFIG => {
                state.endpoint_configs.remove(&deployed.physical_id);
            }
            types::SAGEMAKER_ENDPOINT => {
                state.endpoints.remove(&deployed.physical_id);
            }
            types::LAMBDA_FUNCTION => {
                state.functions.remove(&attribute("Arn"));
            }
            types::LAMBDA_PERMISSION => {
                state.permissions.retain(|p| p.logical_id != deployed.logical_id);
            }
            types::EVENTS_RULE => {
                state.rules.remove(&attribute("Arn"));
            }
            _ => {}
        }
        Ok(())
    }

    /// Deletes a stack in reverse creation order. Resources with a
    /// `Retain` policy are left in place. Deleting an auto-delete custom
    /// resource runs its provider, which empties the bucket when the bucket
    /// policy allows it. A bucket that is still non-empty stops the
    /// teardown.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack does not exist or a resource cannot be
    /// deleted. Resources deleted before the failure stay deleted.
    pub fn teardown(&self, stack_name: &str) -> Result<TeardownReport, CloudError> {
        let span = info_span!("teardown", stack = %stack_name);
        let _guard = span.enter();

        let mut state = self.inner.state.lock();
        let mut deployment = state
            .stacks
            .remove(stack_name)
            .ok_or_else(|| CloudError::not_found("Stack", stack_name))?;

        let mut report = TeardownReport::default();
        for id in deployment.created.clone().iter().rev() {
            let Some(deployed) = deployment.resources.get(id) else {
                continue;
            };
            if deployed.deletion_policy == DeletionPolicy::Retain {
                self.inner.sink.try_emit(
                    activity::RESOURCE_RETAINED,
                    Some(json!({"stack": stack_name, "logical_id": id, "physical_id": deployed.physical_id})),
                );
                report.retained.push(id.clone());
                continue;
            }
            if let Err(reason) = Self::delete_physical(&mut state, deployed, false) {
                warn!(logical_id = %id, %reason, "delete failed");
                state.stacks.insert(stack_name.to_string(), deployment);
                return Err(CloudError::stack_operation(id, reason));
            }
            self.inner.sink.try_emit(
                activity::RESOURCE_DELETED,
                Some(json!({"stack": stack_name, "logical_id": id, "physical_id": deployed.physical_id})),
            );
            deployment.resources.remove(id);
            deployment.created.retain(|c| c != id);
            report.deleted.push(id.clone());
        }
        info!(
            deleted = report.deleted.len(),
            retained = report.retained.len(),
            "stack deleted"
        );
        Ok(report)
    }

    /// Returns a deployed stack.
    #[must_use]
    pub fn deployment(&self, stack_name: &str) -> Option<StackDeployment> {
        self.inner.state.lock().stacks.get(stack_name).cloned()
    }

    /// Physical ID of a resource in a deployed stack.
    #[must_use]
    pub fn physical_id(&self, stack_name: &str, logical_id: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .stacks
            .get(stack_name)?
            .resources
            .get(logical_id)
            .map(|r| r.physical_id.clone())
    }

    // ---------------------------------------------------------------------
    // Object storage
    // ---------------------------------------------------------------------

    /// Creates a bucket outside any stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket exists.
    pub fn create_bucket(&self, name: &str) -> Result<(), CloudError> {
        let mut state = self.inner.state.lock();
        if state.buckets.contains_key(name) {
            return Err(CloudError::AlreadyExists {
                kind: "Bucket".to_string(),
                name: name.to_string(),
            });
        }
        state.buckets.insert(name.to_string(), BucketState::default());
        Ok(())
    }

    /// Returns true if the bucket exists.
    #[must_use]
    pub fn bucket_exists(&self, name: &str) -> bool {
        self.inner.state.lock().buckets.contains_key(name)
    }

    /// Lists objects under a prefix, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket does not exist.
    pub fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>, CloudError> {
        let state = self.inner.state.lock();
        let bucket_state = state
            .buckets
            .get(bucket)
            .ok_or_else(|| CloudError::not_found("Bucket", bucket))?;
        Ok(bucket_state
            .objects
            .values()
            .filter(|o| o.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    /// Stores an object and delivers the notifications it fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket does not exist.
    pub async fn put_object(&self, bucket: &str, key: &str, size: usize) -> Result<Vec<Invocation>, CloudError> {
        let (bucket_arn, deliveries) = {
            let mut state = self.inner.state.lock();
            state.sequence += 1;
            let sequence = state.sequence;
            let bucket_state = state
                .buckets
                .get_mut(bucket)
                .ok_or_else(|| CloudError::not_found("Bucket", bucket))?;
            let now = now_utc();
            bucket_state.objects.insert(
                key.to_string(),
                ObjectSummary {
                    key: key.to_string(),
                    size,
                    last_modified: now,
                    sequence,
                },
            );
            let event = S3EventType::ObjectCreatedPut;
            let bucket_arn = self.inner.env.bucket_arn(bucket);
            let deliveries: Vec<(String, Value)> = bucket_state
                .notifications
                .iter()
                .filter(|(filter, _)| filter.matches(event, key))
                .map(|(_, function_arn)| {
                    (
                        function_arn.clone(),
                        object_event_record(event, &self.inner.env.region, bucket, &bucket_arn, key, size, &now),
                    )
                })
                .collect();
            (bucket_arn, deliveries)
        };
        self.inner
            .sink
            .emit(activity::OBJECT_PUT, Some(json!({"bucket": bucket, "key": key, "size": size})))
            .await;

        let source = InvocationSource::Storage {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let invocations = join_all(deliveries.into_iter().map(|(function_arn, event)| {
            self.deliver(ServicePrincipal::S3, bucket_arn.clone(), function_arn, event, source.clone())
        }))
        .await;
        Ok(invocations)
    }

    /// Stores several objects concurrently.
    ///
    /// # Errors
    ///
    /// Returns the first error; objects stored before it stay stored.
    pub async fn put_objects<K: Into<String>>(
        &self,
        bucket: &str,
        objects: impl IntoIterator<Item = (K, usize)>,
    ) -> Result<Vec<Invocation>, CloudError> {
        let objects: Vec<(String, usize)> = objects.into_iter().map(|(k, size)| (k.into(), size)).collect();
        let results = join_all(objects.iter().map(|(key, size)| self.put_object(bucket, key, *size))).await;
        let mut invocations = Vec::new();
        for result in results {
            invocations.extend(result?);
        }
        Ok(invocations)
    }

    // ---------------------------------------------------------------------
    // Events and pipelines
    // ---------------------------------------------------------------------

    /// Puts an event on the bus and delivers it to every matching rule's
    /// targets.
    pub async fn put_event(&self, event: Value) -> Vec<Invocation> {
        let deliveries: Vec<(String, String)> = {
            let state = self.inner.state.lock();
            state
                .rules
                .values()
                .filter(|rule| rule.enabled && rule.pattern.matches(&event))
                .flat_map(|rule| rule.targets.iter().map(|t| (rule.arn.clone(), t.clone())))
                .collect()
        };
        for (rule_arn, _) in &deliveries {
            self.inner
                .sink
                .emit(activity::RULE_MATCHED, Some(json!({"rule": rule_arn})))
                .await;
        }
        join_all(deliveries.into_iter().map(|(rule_arn, function_arn)| {
            let source = InvocationSource::EventRule {
                rule_arn: rule_arn.clone(),
            };
            self.deliver(ServicePrincipal::Events, rule_arn, function_arn, event.clone(), source)
        }))
        .await
    }

    pub(crate) fn start_execution(&self, pipeline_name: &str) -> Result<String, CloudError> {
        let mut state = self.inner.state.lock();
        if !state.pipelines.contains(pipeline_name) {
            return Err(CloudError::not_found("Pipeline", pipeline_name));
        }
        let pipeline_arn = self.pipeline_arn(pipeline_name);
        let arn = format!("{pipeline_arn}/execution/{}", physical_suffix().to_ascii_lowercase());
        state.executions.push(PipelineExecution {
            arn: arn.clone(),
            pipeline_name: pipeline_name.to_string(),
            pipeline_arn,
            status: PipelineExecutionStatus::Executing,
            started_at: now_utc(),
        });
        drop(state);
        self.inner
            .sink
            .try_emit(activity::PIPELINE_STARTED, Some(json!({"execution": arn})));
        Ok(arn)
    }

    /// Every pipeline execution, oldest first.
    #[must_use]
    pub fn executions(&self) -> Vec<PipelineExecution> {
        self.inner.state.lock().executions.clone()
    }

    /// Moves an execution to `status` and publishes the status-change event.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution does not exist or has already
    /// finished.
    pub async fn complete_execution(
        &self,
        execution_arn: &str,
        status: PipelineExecutionStatus,
    ) -> Result<Vec<Invocation>, CloudError> {
        let change = {
            let mut state = self.inner.state.lock();
            let execution = state
                .executions
                .iter_mut()
                .find(|e| e.arn == execution_arn)
                .ok_or_else(|| CloudError::not_found("PipelineExecution", execution_arn))?;
            if execution.status.is_terminal() {
                return Err(CloudError::Validation(format!(
                    "Execution {execution_arn} already finished as {}",
                    execution.status
                )));
            }
            let previous = execution.status;
            execution.status = status;
            PipelineStatusChange {
                id: Uuid::new_v4().to_string(),
                account: self.inner.env.account_id.clone(),
                region: self.inner.env.region.clone(),
                time: iso_timestamp(),
                pipeline_arn: execution.pipeline_arn.clone(),
                execution_arn: execution_arn.to_string(),
                previous,
                current: status,
            }
        };
        info!(execution = %execution_arn, %status, "pipeline execution changed status");
        Ok(self.put_event(change.to_event()).await)
    }

    // ---------------------------------------------------------------------
    // Functions
    // ---------------------------------------------------------------------

    /// Invokes a function directly by logical ID or name.
    ///
    /// # Errors
    ///
    /// Returns an error if no such function exists. Handler failures are
    /// recorded in the returned invocation.
    pub async fn invoke(&self, function: &str, event: Value) -> Result<Invocation, CloudError> {
        let arn = self
            .function(function)
            .map(|f| f.arn)
            .ok_or_else(|| CloudError::not_found("Function", function))?;
        Ok(self.run(&arn, event, InvocationSource::Direct, None).await)
    }

    async fn deliver(
        &self,
        principal: ServicePrincipal,
        source_arn: String,
        function_arn: String,
        event: Value,
        source: InvocationSource,
    ) -> Invocation {
        self.run(&function_arn, event, source, Some((principal, source_arn))).await
    }

    async fn run(
        &self,
        function_arn: &str,
        event: Value,
        source: InvocationSource,
        caller: Option<(ServicePrincipal, String)>,
    ) -> Invocation {
        let request_id = Uuid::new_v4().to_string();
        let started_at = now_utc();

        let prepared = {
            let state = self.inner.state.lock();
            match state.functions.get(function_arn) {
                None => Err(CloudError::not_found("Function", function_arn)),
                Some(function) => {
                    let admitted = caller.as_ref().map_or(true, |(principal, source_arn)| {
                        state.admits(function_arn, *principal, source_arn, &self.inner.env.account_id)
                    });
                    if admitted {
                        let grants = state
                            .roles
                            .get(&function.role_arn)
                            .map(|r| r.grants.clone())
                            .unwrap_or_default();
                        Ok((function.clone(), grants))
                    } else {
                        Err(CloudError::AccessDenied {
                            principal: caller.as_ref().map(|(p, _)| p.as_str().to_string()).unwrap_or_default(),
                            action: "lambda:InvokeFunction".to_string(),
                            resource: function_arn.to_string(),
                        })
                    }
                }
            }
        };

        let (logical_id, name, result) = match prepared {
            Err(error) => (String::new(), function_arn.to_string(), Err(error)),
            Ok((function, grants)) => {
                let handler = self.inner.handlers.read().get(&function.logical_id).cloned();
                let result = match handler {
                    None => Err(CloudError::HandlerFailed {
                        function: function.name.clone(),
                        message: "no handler registered".to_string(),
                    }),
                    Some(handler) => {
                        let context = InvocationContext {
                            request_id: request_id.clone(),
                            function_name: function.name.clone(),
                            environment: function.environment.clone(),
                            client: ServiceClient::new(self.clone(), function.role_arn.clone(), grants),
                        };
                        let span = info_span!("invoke", function = %function.logical_id, request_id = %request_id);
                        handler.handle(event.clone(), &context).instrument(span).await
                    }
                };
                (function.logical_id, function.name, result)
            }
        };

        let outcome = match result {
            Ok(response) => {
                info!(function = %logical_id, %request_id, "invocation succeeded");
                InvocationOutcome::Succeeded { response }
            }
            Err(error) => {
                warn!(function = %logical_id, %request_id, %error, "invocation failed");
                InvocationOutcome::Failed { error }
            }
        };
        let invocation = Invocation {
            request_id,
            function_logical_id: logical_id,
            function_name: name,
            source,
            event,
            outcome,
            started_at,
        };
        self.inner.state.lock().invocations.push(invocation.clone());
        let activity_type = if invocation.succeeded() {
            activity::FUNCTION_INVOKED
        } else {
            activity::FUNCTION_FAILED
        };
        self.inner
            .sink
            .emit(
                activity_type,
                Some(json!({
                    "function": invocation.function_logical_id,
                    "request_id": invocation.request_id,
                })),
            )
            .await;
        invocation
    }

    /// Finds a function by logical ID or name.
    #[must_use]
    pub fn function(&self, function: &str) -> Option<FunctionRecord> {
        self.inner
            .state
            .lock()
            .functions
            .values()
            .find(|f| f.logical_id == function || f.name == function)
            .cloned()
    }

    /// Every recorded invocation, in completion order.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.inner.state.lock().invocations.clone()
    }

    /// Invocations of the function with `logical_id`.
    #[must_use]
    pub fn invocations_of(&self, logical_id: &str) -> Vec<Invocation> {
        self.inner
            .state
            .lock()
            .invocations
            .iter()
            .filter(|i| i.function_logical_id == logical_id)
            .cloned()
            .collect()
    }

    // ---------------------------------------------------------------------
    // Inference
    // ---------------------------------------------------------------------

    pub(crate) fn create_model(&self, record: ModelRecord) -> Result<(), CloudError> {
        let mut state = self.inner.state.lock();
        if state.models.contains_key(&record.name) {
            return Err(CloudError::AlreadyExists {
                kind: "Model".to_string(),
                name: record.name,
            });
        }
        if !state.roles.contains_key(&record.execution_role_arn) {
            return Err(CloudError::Validation(format!(
                "Could not access role {}",
                record.execution_role_arn
            )));
        }
        debug!(model = %record.name, "model created");
        state.models.insert(record.name.clone(), record);
        Ok(())
    }

    pub(crate) fn create_endpoint_config(&self, record: EndpointConfigRecord) -> Result<(), CloudError> {
        let mut state = self.inner.state.lock();
        if state.endpoint_configs.contains_key(&record.name) {
            return Err(CloudError::AlreadyExists {
                kind: "EndpointConfig".to_string(),
                name: record.name,
            });
        }
        if let Some(missing) = record.variants.iter().find(|v| !state.models.contains_key(&v.model_name)) {
            return Err(CloudError::Validation(format!("Could not find model {}", missing.model_name)));
        }
        debug!(config = %record.name, "endpoint configuration created");
        state.endpoint_configs.insert(record.name.clone(), record);
        Ok(())
    }

    /// Switches an endpoint to a new configuration. The state lock is held
    /// for the whole check-and-switch, so concurrent updates apply one at a
    /// time.
    pub(crate) fn update_endpoint(&self, endpoint_name: &str, config_name: &str) -> Result<EndpointRecord, CloudError> {
        let mut state = self.inner.state.lock();
        let config = state
            .endpoint_configs
            .get(config_name)
            .ok_or_else(|| CloudError::Validation(format!("Could not find endpoint configuration {config_name}")))?;
        Self::check_artifacts(&state, config).map_err(CloudError::Validation)?;
        let endpoint = state
            .endpoints
            .get_mut(endpoint_name)
            .ok_or_else(|| CloudError::Validation(format!("Could not find endpoint {endpoint_name}")))?;
        let previous = std::mem::replace(&mut endpoint.config_name, config_name.to_string());
        endpoint.history.push(previous);
        let updated = endpoint.clone();
        drop(state);

        self.inner.sink.try_emit(
            activity::ENDPOINT_UPDATED,
            Some(json!({"endpoint": endpoint_name, "config": config_name})),
        );
        Ok(updated)
    }

    /// Returns an endpoint.
    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<EndpointRecord> {
        self.inner.state.lock().endpoints.get(name).cloned()
    }

    /// Returns an endpoint configuration.
    #[must_use]
    pub fn endpoint_config(&self, name: &str) -> Option<EndpointConfigRecord> {
        self.inner.state.lock().endpoint_configs.get(name).cloned()
    }

    /// Returns a model.
    #[must_use]
    pub fn model(&self, name: &str) -> Option<ModelRecord> {
        self.inner.state.lock().models.get(name).cloned()
    }

    /// Every model, by name.
    #[must_use]
    pub fn models(&self) -> Vec<ModelRecord> {
        self.inner.state.lock().models.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::resources::{AutoDeleteProvider, BucketSpec, CodeLocation, Runtime, AUTO_DELETE_TAG};
    use crate::stack::StackBuilder;
    use pretty_assertions::assert_eq;

    fn cloud() -> ControlPlane {
        ControlPlane::new(CloudEnvironment::default())
    }

    fn scratch_stack() -> Stack {
        let provider = AutoDeleteProvider {
            handler: "auto_delete_objects.handler".to_string(),
            runtime: Runtime::Python312,
            timeout_secs: 900,
            memory_mb: 128,
            code: CodeLocation {
                bucket: "code".to_string(),
                key: "lambda/auto-delete-objects.zip".to_string(),
            },
        };
        let mut builder = StackBuilder::new("Scratch");
        BucketSpec::ephemeral("Scratch", "scratch", provider)
            .add_to(&mut builder)
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_resolve_pseudo_parameters() {
        let value = cloud()
            .resolve(&Expr::text("caption-ingest-${AWS::AccountId}-${AWS::Region}"))
            .unwrap();
        assert_eq!(value, json!("caption-ingest-111122223333-eu-north-1"));
        assert!(cloud().resolve(&Expr::reference("SomeBucket")).is_err());
    }

    #[test]
    fn test_deploy_resolves_references_in_order() {
        let mut builder = StackBuilder::new("Small");
        builder
            .add_resource("Vpc", Resource::new(types::VPC).with_property("CidrBlock", "10.0.0.0/16"))
            .unwrap();
        builder
            .add_resource(
                "Group",
                Resource::new(types::SECURITY_GROUP)
                    .with_property("GroupDescription", "test")
                    .with_property("VpcId", Expr::reference("Vpc")),
            )
            .unwrap();
        let stack = builder.build().unwrap();

        let cloud = cloud();
        let deployment = cloud.deploy(&stack).unwrap();
        assert_eq!(deployment.created, vec!["Vpc", "Group"]);
        let vpc_id = &deployment.resources["Vpc"].physical_id;
        assert!(vpc_id.starts_with("vpc-"));
        assert_eq!(deployment.resources["Group"].properties["VpcId"], json!(vpc_id));
        assert_eq!(deployment.resources["Vpc"].attributes["CidrBlock"], "10.0.0.0/16");

        let err = cloud.deploy(&stack).unwrap_err();
        assert!(matches!(err, CloudError::AlreadyExists { .. }));
    }

    #[test]
    fn test_failed_deploy_rolls_back() {
        let mut builder = StackBuilder::new("Broken");
        builder
            .add_resource("Bucket", Resource::new(types::BUCKET).with_property("BucketName", "taken"))
            .unwrap();
        builder
            .add_resource(
                "Model",
                Resource::new(types::SAGEMAKER_MODEL)
                    .with_property("ExecutionRoleArn", "arn:aws:iam::111122223333:role/missing")
                    .with_dependency("Bucket"),
            )
            .unwrap();
        let stack = builder.build().unwrap();

        let cloud = cloud();
        let err = cloud.deploy(&stack).unwrap_err();
        assert!(matches!(err, CloudError::StackOperation { ref logical_id, .. } if logical_id == "Model"));
        assert!(!cloud.bucket_exists("taken"));
        assert!(cloud.deployment("Broken").is_none());
    }

    #[tokio::test]
    async fn test_teardown_refuses_non_empty_bucket_without_provider() {
        let tags = Expr::list([Expr::map([("Key", Expr::from(AUTO_DELETE_TAG)), ("Value", Expr::from("true"))])]);
        let mut builder = StackBuilder::new("Keep");
        builder
            .add_resource(
                "Bucket",
                Resource::new(types::BUCKET)
                    .with_property("BucketName", "plain")
                    .with_property("Tags", tags),
            )
            .unwrap();
        let stack = builder.build().unwrap();
        let cloud = cloud();
        cloud.deploy(&stack).unwrap();

        cloud.put_object("plain", "a.txt", 1).await.unwrap();

        let err = cloud.teardown("Keep").unwrap_err();
        assert!(err.to_string().contains("not empty"));
        assert!(cloud.bucket_exists("plain"));
        assert!(cloud.deployment("Keep").is_some());
    }

    #[tokio::test]
    async fn test_auto_delete_resource_empties_bucket_on_teardown() {
        let cloud = cloud();
        cloud.deploy(&scratch_stack()).unwrap();
        cloud
            .put_objects("scratch", [("train-images/a.jpg", 1), ("train-images/b.jpg", 1)])
            .await
            .unwrap();

        let report = cloud.teardown("Scratch").unwrap();
        assert!(!cloud.bucket_exists("scratch"));
        let position = |id: &str| report.deleted.iter().position(|d| d == id).unwrap();
        assert!(position("ScratchAutoDeleteObjects") < position("ScratchPolicy"));
        assert!(position("ScratchPolicy") < position("Scratch"));
        assert!(cloud.function("ScratchAutoDeleteProvider").is_none());
    }

    #[tokio::test]
    async fn test_auto_delete_needs_delete_grant_in_bucket_policy() {
        let stack = scratch_stack();
        let mut template = stack.template().clone();
        let list_only = Expr::map([
            ("Version", Expr::from("2012-10-17")),
            (
                "Statement",
                Expr::list([Expr::map([
                    ("Effect", Expr::from("Allow")),
                    (
                        "Principal",
                        Expr::map([("AWS", Expr::get_att("ScratchAutoDeleteProviderRole", "Arn"))]),
                    ),
                    ("Action", Expr::list([Expr::from("s3:List*")])),
                    ("Resource", Expr::list([Expr::get_att("Scratch", "Arn")])),
                ])]),
            ),
        ]);
        template
            .resources
            .get_mut("ScratchPolicy")
            .unwrap()
            .properties
            .insert("PolicyDocument".to_string(), list_only);
        let patched = Stack::from_template("Scratch", template, stack.creation_order()).unwrap();

        let cloud = cloud();
        cloud.deploy(&patched).unwrap();
        cloud.put_object("scratch", "train-images/a.jpg", 1).await.unwrap();

        let err = cloud.teardown("Scratch").unwrap_err();
        assert!(matches!(err, CloudError::StackOperation { ref logical_id, ref reason }
            if logical_id == "ScratchAutoDeleteObjects" && reason.contains("AccessDenied")));
        assert_eq!(cloud.list_objects("scratch", "").unwrap().len(), 1);
        assert!(cloud.deployment("Scratch").is_some());
    }

    #[tokio::test]
    async fn test_put_object_to_missing_bucket() {
        let err = cloud().put_object("nope", "k", 1).await.unwrap_err();
        assert_eq!(err, CloudError::not_found("Bucket", "nope"));
    }

    #[tokio::test]
    async fn test_objects_listed_by_prefix_with_sequence() {
        let cloud = cloud();
        cloud.create_bucket("models").unwrap();
        cloud
            .put_objects("models", [("output/a/model.tar.gz", 10), ("output/b/model.tar.gz", 20), ("other", 1)])
            .await
            .unwrap();
        let listed = cloud.list_objects("models", "output/").unwrap();
        assert_eq!(listed.len(), 2);
        assert_ne!(listed[0].sequence, listed[1].sequence);
        assert!(cloud.create_bucket("models").is_err());
    }

    #[tokio::test]
    async fn test_execution_lifecycle_emits_activity() {
        let sink = Arc::new(CollectingEventSink::new());
        let cloud = ControlPlane::with_sink(CloudEnvironment::default(), sink.clone());
        cloud.register_pipeline("CaptionModelPipeline");
        assert!(cloud.start_execution("Other").is_err());

        let arn = cloud.start_execution("CaptionModelPipeline").unwrap();
        assert!(arn.starts_with(
            "arn:aws:sagemaker:eu-north-1:111122223333:pipeline/captionmodelpipeline/execution/"
        ));
        let delivered = cloud
            .complete_execution(&arn, PipelineExecutionStatus::Succeeded)
            .await
            .unwrap();
        assert!(delivered.is_empty());
        assert_eq!(cloud.executions()[0].status, PipelineExecutionStatus::Succeeded);
        assert!(cloud
            .complete_execution(&arn, PipelineExecutionStatus::Failed)
            .await
            .is_err());
        assert_eq!(sink.count(activity::PIPELINE_STARTED), 1);
    }

    #[tokio::test]
    async fn test_invoke_unknown_function() {
        let err = cloud().invoke("Missing", json!({})).await.unwrap_err();
        assert_eq!(err, CloudError::not_found("Function", "Missing"));
    }
}
