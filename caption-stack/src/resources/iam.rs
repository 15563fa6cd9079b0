//! Roles, policy statements and a small policy evaluator.
//!
//! Every role is assumable by exactly one service principal. Inline
//! statements must name concrete actions (never a bare `*`) and concrete
//! resources, and `iam:PassRole` must be pinned to a receiving service.

use crate::core::{Expr, ResolveError, Resolver};
use crate::errors::{codes, SynthResult, SynthesisError};
use crate::stack::StackBuilder;
use crate::template::{types, Resource};
use crate::utils::glob_match;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Condition key naming the service a role is passed to.
pub const PASSED_TO_SERVICE: &str = "iam:PassedToService";

/// Service principals roles are assumed by or grant access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePrincipal {
    /// The managed inference/training service.
    SageMaker,
    /// The function runtime.
    Lambda,
    /// Object storage.
    S3,
    /// The event bus.
    Events,
}

impl ServicePrincipal {
    /// Principal name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SageMaker => "sagemaker.amazonaws.com",
            Self::Lambda => "lambda.amazonaws.com",
            Self::S3 => "s3.amazonaws.com",
            Self::Events => "events.amazonaws.com",
        }
    }
}

impl fmt::Display for ServicePrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// AWS managed policies attached by the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManagedPolicy {
    /// Read-only object storage.
    AmazonS3ReadOnlyAccess,
    /// Read-only container registry.
    AmazonEc2ContainerRegistryReadOnly,
    /// Function logging.
    AwsLambdaBasicExecutionRole,
    /// Function network interfaces plus logging.
    AwsLambdaVpcAccessExecutionRole,
}

impl ManagedPolicy {
    /// Every policy the topology attaches.
    pub const ALL: [Self; 4] = [
        Self::AmazonS3ReadOnlyAccess,
        Self::AmazonEc2ContainerRegistryReadOnly,
        Self::AwsLambdaBasicExecutionRole,
        Self::AwsLambdaVpcAccessExecutionRole,
    ];

    /// Looks a policy up by its resolved ARN.
    #[must_use]
    pub fn from_arn(arn: &str) -> Option<Self> {
        let (_, path) = arn.split_once(":policy/")?;
        Self::ALL.into_iter().find(|policy| policy.path() == path)
    }

    /// Policy path and name below `arn:aws:iam::aws:policy/`.
    #[must_use]
    pub fn path(&self) -> &'static str {
        match self {
            Self::AmazonS3ReadOnlyAccess => "AmazonS3ReadOnlyAccess",
            Self::AmazonEc2ContainerRegistryReadOnly => "AmazonEC2ContainerRegistryReadOnly",
            Self::AwsLambdaBasicExecutionRole => "service-role/AWSLambdaBasicExecutionRole",
            Self::AwsLambdaVpcAccessExecutionRole => "service-role/AWSLambdaVPCAccessExecutionRole",
        }
    }

    /// Partition-aware policy ARN.
    #[must_use]
    pub fn arn(&self) -> Expr {
        Expr::sub(format!("arn:${{AWS::Partition}}:iam::aws:policy/{}", self.path()))
    }

    /// The effective permissions of the policy, as far as the simulated
    /// control plane needs them.
    #[must_use]
    pub fn grants(&self) -> Vec<Grant> {
        let actions: &[&str] = match self {
            Self::AmazonS3ReadOnlyAccess => &["s3:Get*", "s3:List*"],
            Self::AmazonEc2ContainerRegistryReadOnly => &[
                "ecr:GetAuthorizationToken",
                "ecr:BatchCheckLayerAvailability",
                "ecr:GetDownloadUrlForLayer",
                "ecr:BatchGetImage",
                "ecr:DescribeRepositories",
                "ecr:ListImages",
            ],
            Self::AwsLambdaBasicExecutionRole => &["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
            Self::AwsLambdaVpcAccessExecutionRole => &[
                "logs:CreateLogGroup",
                "logs:CreateLogStream",
                "logs:PutLogEvents",
                "ec2:CreateNetworkInterface",
                "ec2:DescribeNetworkInterfaces",
                "ec2:DeleteNetworkInterface",
            ],
        };
        vec![Grant {
            effect: Effect::Allow,
            actions: actions.iter().map(ToString::to_string).collect(),
            resources: vec!["*".to_string()],
            conditions: BTreeMap::new(),
        }]
    }
}

/// Statement effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    /// Grants the actions.
    #[default]
    Allow,
    /// Denies the actions, overriding any allow.
    Deny,
}

/// Condition operator → key → expected value.
pub type Conditions = BTreeMap<String, BTreeMap<String, String>>;

/// An inline policy statement with deploy-time resource expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStatement {
    /// Effect.
    pub effect: Effect,
    /// Actions, e.g. `sagemaker:UpdateEndpoint`.
    pub actions: Vec<String>,
    /// Resource ARNs.
    pub resources: Vec<Expr>,
    /// Conditions.
    pub conditions: Conditions,
}

impl PolicyStatement {
    /// Allows `actions` on `resources`.
    #[must_use]
    pub fn allow<A: Into<String>>(
        actions: impl IntoIterator<Item = A>,
        resources: impl IntoIterator<Item = Expr>,
    ) -> Self {
        Self {
            effect: Effect::Allow,
            actions: actions.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().collect(),
            conditions: Conditions::new(),
        }
    }

    /// Adds a condition.
    #[must_use]
    pub fn with_condition(mut self, operator: &str, key: &str, value: impl Into<String>) -> Self {
        self.conditions
            .entry(operator.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
        self
    }

    fn to_expr(&self) -> Expr {
        let mut entries = vec![
            (
                "Effect",
                Expr::from(match self.effect {
                    Effect::Allow => "Allow",
                    Effect::Deny => "Deny",
                }),
            ),
            ("Action", Expr::list(self.actions.iter().map(|a| Expr::from(a.as_str())))),
            ("Resource", Expr::list(self.resources.iter().cloned())),
        ];
        if !self.conditions.is_empty() {
            entries.push((
                "Condition",
                Expr::map(self.conditions.iter().map(|(op, pairs)| {
                    (
                        op.clone(),
                        Expr::map(pairs.iter().map(|(k, v)| (k.clone(), Expr::from(v.as_str())))),
                    )
                })),
            ));
        }
        Expr::map(entries)
    }

    /// Resolves resource expressions into a concrete grant.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource expression cannot be resolved.
    pub fn resolve(&self, resolver: &dyn Resolver) -> Result<Grant, ResolveError> {
        let mut resources = Vec::with_capacity(self.resources.len());
        for expr in &self.resources {
            let value = expr.resolve(resolver)?;
            match value {
                serde_json::Value::String(s) => resources.push(s),
                other => {
                    return Err(ResolveError::TypeMismatch {
                        function: "Resource".to_string(),
                        found: other.to_string(),
                    })
                }
            }
        }
        Ok(Grant {
            effect: self.effect,
            actions: self.actions.clone(),
            resources,
            conditions: self.conditions.clone(),
        })
    }
}

/// A statement with concrete resource ARNs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Effect.
    pub effect: Effect,
    /// Action patterns.
    pub actions: Vec<String>,
    /// Resource ARN patterns.
    pub resources: Vec<String>,
    /// Conditions.
    pub conditions: Conditions,
}

impl Grant {
    fn applies(&self, action: &str, resource: &str, context: &BTreeMap<String, String>) -> bool {
        let action = action.to_ascii_lowercase();
        self.actions.iter().any(|a| glob_match(&a.to_ascii_lowercase(), &action))
            && self.resources.iter().any(|r| glob_match(r, resource))
            && self.conditions.iter().all(|(op, pairs)| {
                pairs.iter().all(|(key, expected)| {
                    context.get(key).is_some_and(|actual| match op.as_str() {
                        "StringEquals" => actual == expected,
                        "StringLike" => glob_match(expected, actual),
                        _ => false,
                    })
                })
            })
    }
}

/// Evaluates a request against grants. An explicit deny wins; otherwise
/// some allow must match action, resource and every condition.
#[must_use]
pub fn is_allowed(grants: &[Grant], action: &str, resource: &str, context: &BTreeMap<String, String>) -> bool {
    let applicable = grants.iter().filter(|g| g.applies(action, resource, context));
    let mut allowed = false;
    for grant in applicable {
        match grant.effect {
            Effect::Deny => return false,
            Effect::Allow => allowed = true,
        }
    }
    allowed
}

/// Reads the grants of a resolved policy document.
///
/// `Action` and `Resource` may be a string or a list of strings, as in any
/// IAM document.
///
/// # Errors
///
/// Returns a message naming the first malformed statement.
pub fn grants_from_document(document: &serde_json::Value) -> Result<Vec<Grant>, String> {
    let statements = document
        .get("Statement")
        .and_then(serde_json::Value::as_array)
        .ok_or("policy document has no Statement list")?;
    statements
        .iter()
        .enumerate()
        .map(|(i, statement)| {
            let effect = match statement.get("Effect").and_then(serde_json::Value::as_str) {
                Some("Allow") => Effect::Allow,
                Some("Deny") => Effect::Deny,
                other => return Err(format!("statement {i} has invalid Effect {other:?}")),
            };
            let strings = |key: &str| -> Result<Vec<String>, String> {
                match statement.get(key) {
                    Some(serde_json::Value::String(s)) => Ok(vec![s.clone()]),
                    Some(serde_json::Value::Array(items)) => items
                        .iter()
                        .map(|item| {
                            item.as_str()
                                .map(ToString::to_string)
                                .ok_or_else(|| format!("statement {i} has a non-string {key}"))
                        })
                        .collect(),
                    _ => Err(format!("statement {i} has no {key}")),
                }
            };
            let conditions = statement
                .get("Condition")
                .map(|c| serde_json::from_value::<Conditions>(c.clone()))
                .transpose()
                .map_err(|e| format!("statement {i} has a malformed Condition: {e}"))?
                .unwrap_or_default();
            Ok(Grant {
                effect,
                actions: strings("Action")?,
                resources: strings("Resource")?,
                conditions,
            })
        })
        .collect()
}

/// An IAM role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    /// Logical ID.
    pub logical_id: String,
    /// The one principal allowed to assume the role.
    pub principal: ServicePrincipal,
    /// Description.
    pub description: Option<String>,
    /// Attached managed policies.
    pub managed_policies: Vec<ManagedPolicy>,
    /// Inline statements.
    pub statements: Vec<PolicyStatement>,
}

impl Role {
    /// Creates a role with no permissions.
    #[must_use]
    pub fn new(logical_id: impl Into<String>, principal: ServicePrincipal) -> Self {
        Self {
            logical_id: logical_id.into(),
            principal,
            description: None,
            managed_policies: Vec::new(),
            statements: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attaches a managed policy.
    #[must_use]
    pub fn with_managed_policy(mut self, policy: ManagedPolicy) -> Self {
        if !self.managed_policies.contains(&policy) {
            self.managed_policies.push(policy);
        }
        self
    }

    /// Adds an inline statement.
    #[must_use]
    pub fn with_statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }

    /// Checks the least-privilege rules.
    ///
    /// # Errors
    ///
    /// Returns a `SYNTH-020-IAM` error naming the first broken rule.
    pub fn validate(&self) -> SynthResult<()> {
        let fail = |reason: String| {
            Err(SynthesisError::coded(codes::IAM, format!("Role '{}': {reason}", self.logical_id))
                .with_resources(vec![self.logical_id.clone()]))
        };
        for (idx, statement) in self.statements.iter().enumerate() {
            if statement.actions.is_empty() {
                return fail(format!("statement {idx} has no actions"));
            }
            if statement.resources.is_empty() {
                return fail(format!("statement {idx} has no resources"));
            }
            if let Some(action) = statement.actions.iter().find(|a| a.as_str() == "*" || a.ends_with(":*")) {
                return fail(format!("statement {idx} grants wildcard action '{action}'"));
            }
            if statement.effect == Effect::Allow
                && statement.resources.iter().any(|r| r.as_str() == Some("*"))
                && !statement.actions.iter().all(|a| is_list_only(a))
            {
                return fail(format!("statement {idx} grants mutating actions on every resource"));
            }
            let passes_role = statement.actions.iter().any(|a| a.eq_ignore_ascii_case("iam:PassRole"));
            let pinned = statement
                .conditions
                .get("StringEquals")
                .is_some_and(|c| c.contains_key(PASSED_TO_SERVICE));
            if passes_role && !pinned {
                return fail(format!("statement {idx} passes a role without a {PASSED_TO_SERVICE} condition"));
            }
        }
        Ok(())
    }

    /// Validates and lowers the role.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_to(&self, builder: &mut StackBuilder) -> SynthResult<RoleRef> {
        self.validate()?;
        let trust = Expr::map([
            ("Version", Expr::from("2012-10-17")),
            (
                "Statement",
                Expr::list([Expr::map([
                    ("Effect", Expr::from("Allow")),
                    ("Principal", Expr::map([("Service", Expr::from(self.principal.as_str()))])),
                    ("Action", Expr::from("sts:AssumeRole")),
                ])]),
            ),
        ]);
        let mut resource = Resource::new(types::ROLE).with_property("AssumeRolePolicyDocument", trust);
        if let Some(description) = &self.description {
            resource = resource.with_property("Description", description.as_str());
        }
        if !self.managed_policies.is_empty() {
            resource = resource.with_property(
                "ManagedPolicyArns",
                Expr::list(self.managed_policies.iter().map(ManagedPolicy::arn)),
            );
        }
        if !self.statements.is_empty() {
            resource = resource.with_property(
                "Policies",
                Expr::list([Expr::map([
                    ("PolicyName", Expr::from(format!("{}DefaultPolicy", self.logical_id))),
                    (
                        "PolicyDocument",
                        Expr::map([
                            ("Version", Expr::from("2012-10-17")),
                            ("Statement", Expr::list(self.statements.iter().map(PolicyStatement::to_expr))),
                        ]),
                    ),
                ])]),
            );
        }
        builder.add_resource(&self.logical_id, resource)?;
        Ok(RoleRef {
            logical_id: self.logical_id.clone(),
        })
    }

    /// Every grant the role carries, managed and inline.
    ///
    /// # Errors
    ///
    /// Returns an error if an inline resource cannot be resolved.
    pub fn grants(&self, resolver: &dyn Resolver) -> Result<Vec<Grant>, ResolveError> {
        let mut grants: Vec<Grant> = self.managed_policies.iter().flat_map(ManagedPolicy::grants).collect();
        for statement in &self.statements {
            grants.push(statement.resolve(resolver)?);
        }
        Ok(grants)
    }
}

fn is_list_only(action: &str) -> bool {
    let verb = action.split(':').nth(1).unwrap_or(action);
    verb.starts_with("List") || verb.starts_with("Describe") || verb.starts_with("Get")
}

/// Handle to a lowered role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRef {
    /// Logical ID.
    pub logical_id: String,
}

impl RoleRef {
    /// The role ARN.
    #[must_use]
    pub fn arn(&self) -> Expr {
        Expr::get_att(&self.logical_id, "Arn")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn grant(actions: &[&str], resources: &[&str]) -> Grant {
        Grant {
            effect: Effect::Allow,
            actions: actions.iter().map(ToString::to_string).collect(),
            resources: resources.iter().map(ToString::to_string).collect(),
            conditions: Conditions::new(),
        }
    }

    #[test]
    fn test_is_allowed_wildcards_and_case() {
        let grants = vec![grant(
            &["sagemaker:UpdateEndpoint"],
            &["arn:aws:sagemaker:eu-north-1:1:endpoint/caption*"],
        )];
        let none = BTreeMap::new();
        assert!(is_allowed(&grants, "sagemaker:updateendpoint", "arn:aws:sagemaker:eu-north-1:1:endpoint/caption-1", &none));
        assert!(!is_allowed(&grants, "sagemaker:DeleteEndpoint", "arn:aws:sagemaker:eu-north-1:1:endpoint/caption-1", &none));
        assert!(!is_allowed(&grants, "sagemaker:UpdateEndpoint", "arn:aws:sagemaker:eu-north-1:1:endpoint/other", &none));
    }

    #[test]
    fn test_explicit_deny_wins() {
        let mut deny = grant(&["s3:*"], &["*"]);
        deny.effect = Effect::Deny;
        let grants = vec![grant(&["s3:GetObject"], &["*"]), deny];
        assert!(!is_allowed(&grants, "s3:GetObject", "arn:aws:s3:::b/k", &BTreeMap::new()));
    }

    #[test]
    fn test_conditions_must_hold() {
        let mut pass = grant(&["iam:PassRole"], &["arn:aws:iam::1:role/Exec"]);
        pass.conditions
            .entry("StringEquals".into())
            .or_default()
            .insert(PASSED_TO_SERVICE.into(), "sagemaker.amazonaws.com".into());
        let grants = vec![pass];
        assert!(is_allowed(
            &grants,
            "iam:PassRole",
            "arn:aws:iam::1:role/Exec",
            &ctx(&[(PASSED_TO_SERVICE, "sagemaker.amazonaws.com")])
        ));
        assert!(!is_allowed(
            &grants,
            "iam:PassRole",
            "arn:aws:iam::1:role/Exec",
            &ctx(&[(PASSED_TO_SERVICE, "lambda.amazonaws.com")])
        ));
        assert!(!is_allowed(&grants, "iam:PassRole", "arn:aws:iam::1:role/Exec", &BTreeMap::new()));
    }

    #[test]
    fn test_validate_rejects_wildcard_actions() {
        let role = Role::new("Bad", ServicePrincipal::Lambda)
            .with_statement(PolicyStatement::allow(["sagemaker:*"], [Expr::from("arn:x")]));
        assert_eq!(role.validate().unwrap_err().code(), Some(codes::IAM));

        let role = Role::new("Bad", ServicePrincipal::Lambda).with_statement(PolicyStatement::allow(["*"], [Expr::from("*")]));
        assert!(role.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mutation_on_every_resource() {
        let role = Role::new("Bad", ServicePrincipal::Lambda)
            .with_statement(PolicyStatement::allow(["sagemaker:UpdateEndpoint"], [Expr::from("*")]));
        assert!(role.validate().is_err());

        let ok = Role::new("Ok", ServicePrincipal::Lambda)
            .with_statement(PolicyStatement::allow(["sagemaker:DescribeEndpoint"], [Expr::from("*")]));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_pass_role_condition() {
        let unpinned = Role::new("Deploy", ServicePrincipal::Lambda)
            .with_statement(PolicyStatement::allow(["iam:PassRole"], [Expr::get_att("Exec", "Arn")]));
        assert!(unpinned.validate().is_err());

        let pinned = Role::new("Deploy", ServicePrincipal::Lambda).with_statement(
            PolicyStatement::allow(["iam:PassRole"], [Expr::get_att("Exec", "Arn")]).with_condition(
                "StringEquals",
                PASSED_TO_SERVICE,
                ServicePrincipal::SageMaker.as_str(),
            ),
        );
        assert!(pinned.validate().is_ok());
    }

    #[test]
    fn test_role_lowering() {
        let mut builder = StackBuilder::new("Test");
        let role = Role::new("SageMakerExecRole", ServicePrincipal::SageMaker)
            .with_managed_policy(ManagedPolicy::AmazonS3ReadOnlyAccess)
            .with_managed_policy(ManagedPolicy::AmazonEc2ContainerRegistryReadOnly)
            .with_managed_policy(ManagedPolicy::AmazonS3ReadOnlyAccess);
        let handle = role.add_to(&mut builder).unwrap();
        assert_eq!(handle.arn(), Expr::get_att("SageMakerExecRole", "Arn"));

        let json = serde_json::to_value(builder.get("SageMakerExecRole").unwrap()).unwrap();
        assert_eq!(
            json["Properties"]["AssumeRolePolicyDocument"]["Statement"][0]["Principal"],
            json!({"Service": "sagemaker.amazonaws.com"})
        );
        assert_eq!(
            json["Properties"]["ManagedPolicyArns"],
            json!([
                {"Fn::Sub": "arn:${AWS::Partition}:iam::aws:policy/AmazonS3ReadOnlyAccess"},
                {"Fn::Sub": "arn:${AWS::Partition}:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly"}
            ])
        );
        assert!(json["Properties"].get("Policies").is_none());
    }

    #[test]
    fn test_managed_policy_grants() {
        let grants = ManagedPolicy::AmazonS3ReadOnlyAccess.grants();
        let none = BTreeMap::new();
        assert!(is_allowed(&grants, "s3:GetObject", "arn:aws:s3:::any/key", &none));
        assert!(!is_allowed(&grants, "s3:PutObject", "arn:aws:s3:::any/key", &none));
    }

    #[test]
    fn test_managed_policy_from_arn() {
        assert_eq!(
            ManagedPolicy::from_arn("arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"),
            Some(ManagedPolicy::AwsLambdaBasicExecutionRole)
        );
        assert_eq!(ManagedPolicy::from_arn("arn:aws:iam::aws:policy/AdministratorAccess"), None);
    }

    #[test]
    fn test_grants_from_document() {
        let document = json!({
            "Version": "2012-10-17",
            "Statement": [
                {"Effect": "Allow", "Action": "s3:ListBucket", "Resource": ["arn:aws:s3:::models"],
                 "Condition": {"StringLike": {"s3:prefix": "output/*"}}},
                {"Effect": "Deny", "Action": ["s3:ListBucket"], "Resource": "*"}
            ]
        });
        let grants = grants_from_document(&document).unwrap();
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].conditions["StringLike"]["s3:prefix"], "output/*");
        assert_eq!(grants[1].effect, Effect::Deny);

        assert!(grants_from_document(&json!({"Statement": [{"Effect": "Maybe"}]})).is_err());
        assert!(grants_from_document(&json!({})).is_err());
    }
}
