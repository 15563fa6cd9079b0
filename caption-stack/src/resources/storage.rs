//! Object-storage buckets and artifact locations.

use super::{CodeLocation, FunctionSpec, ManagedPolicy, Role, Runtime, ServicePrincipal};
use crate::core::Expr;
use crate::errors::{codes, SynthResult, SynthesisError};
use crate::events::NotificationFilter;
use crate::stack::StackBuilder;
use crate::template::{types, DeletionPolicy, Resource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag marking a bucket whose objects the auto-delete custom resource
/// removes. The tag itself deletes nothing.
pub const AUTO_DELETE_TAG: &str = "aws-cdk:auto-delete-objects";

/// A bucket the stack reads from or writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BucketRef {
    /// An existing bucket referenced by name. The stack never creates or
    /// deletes it.
    Imported {
        /// Bucket name template.
        name: String,
    },
    /// A bucket created by the stack.
    Owned {
        /// Logical ID of the bucket resource.
        logical_id: String,
        /// Bucket name template.
        name: String,
    },
}

impl BucketRef {
    /// References an existing bucket.
    #[must_use]
    pub fn imported(name: impl Into<String>) -> Self {
        Self::Imported { name: name.into() }
    }

    /// Bucket name template.
    #[must_use]
    pub fn name_template(&self) -> &str {
        match self {
            Self::Imported { name } | Self::Owned { name, .. } => name,
        }
    }

    /// Returns true if the stack owns the bucket.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Owned { .. })
    }

    /// The bucket name. Owned buckets are referenced with `Ref` so readers
    /// are created after the bucket.
    #[must_use]
    pub fn name(&self) -> Expr {
        match self {
            Self::Imported { name } => Expr::text(name.as_str()),
            Self::Owned { logical_id, .. } => Expr::reference(logical_id),
        }
    }

    /// Bucket ARN computed from the name, without depending on the bucket
    /// resource.
    #[must_use]
    pub fn arn(&self) -> Expr {
        Expr::sub(format!("arn:${{AWS::Partition}}:s3:::{}", self.name_template()))
    }

    /// ARN pattern of every object under `prefix`.
    #[must_use]
    pub fn objects_arn(&self, prefix: &str) -> Expr {
        Expr::sub(format!("arn:${{AWS::Partition}}:s3:::{}/{prefix}*", self.name_template()))
    }

    /// `s3://` URI of `key` inside the bucket.
    #[must_use]
    pub fn s3_uri(&self, key: &str) -> Expr {
        match self {
            Self::Imported { name } => Expr::text(format!("s3://{name}/{key}")),
            Self::Owned { logical_id, .. } => Expr::join(
                "",
                vec![Expr::string("s3://"), Expr::reference(logical_id), Expr::string(format!("/{key}"))],
            ),
        }
    }
}

/// An object inside a declared bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLocation {
    bucket: BucketRef,
    key: String,
}

impl ArtifactLocation {
    /// Creates a location.
    ///
    /// # Errors
    ///
    /// Returns a `SYNTH-030-INFERENCE` error if the key is empty, absolute,
    /// or would escape the bucket.
    pub fn new(bucket: BucketRef, key: impl Into<String>) -> SynthResult<Self> {
        let key = key.into();
        if key.is_empty() || key.starts_with('/') || key.contains("://") || key.split('/').any(|s| s == "..") {
            return Err(SynthesisError::coded(
                codes::INFERENCE,
                format!("Artifact key '{key}' does not name an object inside bucket '{}'", bucket.name_template()),
            )
            .with_fix_hint("Use a relative object key such as 'model.tar.gz'."));
        }
        Ok(Self { bucket, key })
    }

    /// The bucket.
    #[must_use]
    pub fn bucket(&self) -> &BucketRef {
        &self.bucket
    }

    /// The object key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `s3://bucket/key`.
    #[must_use]
    pub fn s3_uri(&self) -> Expr {
        self.bucket.s3_uri(&self.key)
    }
}

/// Settings of the provider function that empties an ephemeral bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoDeleteProvider {
    /// Entry point, `module.function`.
    pub handler: String,
    /// Runtime.
    pub runtime: Runtime,
    /// Timeout in seconds.
    pub timeout_secs: u32,
    /// Memory in MiB.
    pub memory_mb: u32,
    /// Code package.
    pub code: CodeLocation,
}

/// Object actions the auto-delete provider needs on its bucket.
const AUTO_DELETE_ACTIONS: [&str; 4] = ["s3:PutBucketPolicy", "s3:GetBucket*", "s3:List*", "s3:DeleteObject*"];

/// A bucket created and owned by the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSpec {
    /// Logical ID.
    pub logical_id: String,
    /// Bucket name template.
    pub name: String,
    /// Provider that empties the bucket before it is deleted. Buckets
    /// without one are retained on teardown.
    pub auto_delete: Option<AutoDeleteProvider>,
    /// Notifications routed to functions: filter, function ARN, and the
    /// permission resource that must exist before the bucket.
    pub notifications: Vec<(NotificationFilter, Expr, String)>,
}

impl BucketSpec {
    /// A bucket destroyed together with the stack. `provider` empties it
    /// first.
    #[must_use]
    pub fn ephemeral(logical_id: impl Into<String>, name: impl Into<String>, provider: AutoDeleteProvider) -> Self {
        Self {
            logical_id: logical_id.into(),
            name: name.into(),
            auto_delete: Some(provider),
            notifications: Vec::new(),
        }
    }

    /// A bucket left in place when the stack is deleted.
    #[must_use]
    pub fn retained(logical_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            name: name.into(),
            auto_delete: None,
            notifications: Vec::new(),
        }
    }

    /// Routes matching events to a function.
    #[must_use]
    pub fn with_notification(
        mut self,
        filter: NotificationFilter,
        function_arn: Expr,
        permission_id: impl Into<String>,
    ) -> Self {
        self.notifications.push((filter, function_arn, permission_id.into()));
        self
    }

    /// The bucket reference dependents use.
    #[must_use]
    pub fn bucket_ref(&self) -> BucketRef {
        BucketRef::Owned {
            logical_id: self.logical_id.clone(),
            name: self.name.clone(),
        }
    }

    /// Logical ID of the bucket policy.
    #[must_use]
    pub fn policy_id(&self) -> String {
        format!("{}Policy", self.logical_id)
    }

    /// Logical ID of the custom resource that empties the bucket.
    #[must_use]
    pub fn auto_delete_id(&self) -> String {
        format!("{}AutoDeleteObjects", self.logical_id)
    }

    /// Logical ID of the auto-delete provider function.
    #[must_use]
    pub fn provider_id(&self) -> String {
        format!("{}AutoDeleteProvider", self.logical_id)
    }

    /// Logical ID of the auto-delete provider's role.
    #[must_use]
    pub fn provider_role_id(&self) -> String {
        format!("{}AutoDeleteProviderRole", self.logical_id)
    }

    /// Lowers the bucket. Ephemeral buckets also get the provider role and
    /// function, a bucket policy letting the provider delete objects, and
    /// the custom resource whose deletion empties the bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if builder validation fails.
    pub fn add_to(&self, builder: &mut StackBuilder) -> SynthResult<BucketRef> {
        let mut resource = Resource::new(types::BUCKET).with_property("BucketName", Expr::text(self.name.as_str()));
        if self.auto_delete.is_some() {
            resource = resource
                .with_removal_policy(DeletionPolicy::Delete)
                .with_property(
                    "Tags",
                    Expr::list([Expr::map([("Key", Expr::from(AUTO_DELETE_TAG)), ("Value", Expr::from("true"))])]),
                );
        } else {
            resource = resource.with_removal_policy(DeletionPolicy::Retain);
        }
        if !self.notifications.is_empty() {
            let configs = self
                .notifications
                .iter()
                .map(|(filter, arn, _)| filter.to_expr(arn.clone()));
            resource = resource.with_property(
                "NotificationConfiguration",
                Expr::map([("LambdaConfigurations", Expr::list(configs))]),
            );
            for (_, _, permission) in &self.notifications {
                resource = resource.with_dependency(permission);
            }
        }
        builder.add_resource(&self.logical_id, resource)?;
        if let Some(provider) = &self.auto_delete {
            self.add_auto_delete(builder, provider)?;
        }
        Ok(self.bucket_ref())
    }

    fn add_auto_delete(&self, builder: &mut StackBuilder, provider: &AutoDeleteProvider) -> SynthResult<()> {
        let role = Role::new(self.provider_role_id(), ServicePrincipal::Lambda)
            .with_description(format!("Empties {} before it is deleted", self.logical_id))
            .with_managed_policy(ManagedPolicy::AwsLambdaBasicExecutionRole)
            .add_to(builder)?;
        let function = FunctionSpec {
            logical_id: self.provider_id(),
            handler: provider.handler.clone(),
            runtime: provider.runtime,
            role_arn: role.arn(),
            environment: BTreeMap::new(),
            timeout_secs: provider.timeout_secs,
            memory_mb: provider.memory_mb,
            placement: None,
            code: provider.code.clone(),
        }
        .add_to(builder)?;

        let bucket_arn = Expr::get_att(&self.logical_id, "Arn");
        let statement = Expr::map([
            ("Effect", Expr::from("Allow")),
            ("Principal", Expr::map([("AWS", role.arn())])),
            ("Action", Expr::list(AUTO_DELETE_ACTIONS.map(Expr::from))),
            (
                "Resource",
                Expr::list([bucket_arn.clone(), Expr::join("", vec![bucket_arn, Expr::string("/*")])]),
            ),
        ]);
        builder.add_resource(
            self.policy_id(),
            Resource::new(types::BUCKET_POLICY)
                .with_property("Bucket", Expr::reference(&self.logical_id))
                .with_property(
                    "PolicyDocument",
                    Expr::map([("Version", Expr::from("2012-10-17")), ("Statement", Expr::list([statement]))]),
                ),
        )?;
        builder.add_resource(
            self.auto_delete_id(),
            Resource::new(types::S3_AUTO_DELETE_OBJECTS)
                .with_property("ServiceToken", function.arn())
                .with_property("BucketName", Expr::reference(&self.logical_id))
                .with_dependency(self.policy_id())
                .with_removal_policy(DeletionPolicy::Delete),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> AutoDeleteProvider {
        AutoDeleteProvider {
            handler: "auto_delete_objects.handler".to_string(),
            runtime: Runtime::Python312,
            timeout_secs: 900,
            memory_mb: 128,
            code: CodeLocation {
                bucket: "code".to_string(),
                key: "lambda/auto-delete-objects.zip".to_string(),
            },
        }
    }

    #[test]
    fn test_imported_bucket_expressions() {
        let bucket = BucketRef::imported("cdk-hnb659fds-assets-${AWS::AccountId}-${AWS::Region}");
        assert!(!bucket.is_owned());
        assert_eq!(
            bucket.s3_uri("datacapture/").to_json(),
            json!({"Fn::Sub": "s3://cdk-hnb659fds-assets-${AWS::AccountId}-${AWS::Region}/datacapture/"})
        );
        assert!(bucket.name().references().is_empty());
        assert_eq!(BucketRef::imported("plain").name(), Expr::string("plain"));
    }

    #[test]
    fn test_owned_bucket_expressions_reference_resource() {
        let bucket = BucketSpec::ephemeral("IngestBucket", "ingest-${AWS::AccountId}", provider()).bucket_ref();
        assert!(bucket.name().references().contains("IngestBucket"));
        assert!(bucket.s3_uri("x").references().contains("IngestBucket"));
        assert!(bucket.arn().references().is_empty());
    }

    #[test]
    fn test_artifact_location_rejects_escaping_keys() {
        let bucket = BucketRef::imported("models");
        assert!(ArtifactLocation::new(bucket.clone(), "model.tar.gz").is_ok());
        for key in ["", "/model.tar.gz", "../other/model.tar.gz", "s3://elsewhere/model.tar.gz"] {
            let err = ArtifactLocation::new(bucket.clone(), key).unwrap_err();
            assert_eq!(err.code(), Some(codes::INFERENCE), "key {key:?}");
        }
    }

    #[test]
    fn test_ephemeral_bucket_lowering() {
        let mut builder = StackBuilder::new("Test");
        let spec = BucketSpec::ephemeral("IngestBucket", "ingest", provider());
        spec.add_to(&mut builder).unwrap();
        let resource = builder.get("IngestBucket").unwrap();
        assert_eq!(resource.effective_deletion_policy(), DeletionPolicy::Delete);
        let json = serde_json::to_value(resource).unwrap();
        assert_eq!(json["Properties"]["Tags"][0]["Key"], AUTO_DELETE_TAG);
        assert_eq!(json["DeletionPolicy"], "Delete");

        let stack = builder.build().unwrap();
        let custom = stack.resource("IngestBucketAutoDeleteObjects").unwrap();
        assert_eq!(custom.resource_type, types::S3_AUTO_DELETE_OBJECTS);
        let custom = serde_json::to_value(custom).unwrap();
        assert_eq!(custom["Properties"]["BucketName"], json!({"Ref": "IngestBucket"}));
        assert_eq!(
            custom["Properties"]["ServiceToken"],
            json!({"Fn::GetAtt": ["IngestBucketAutoDeleteProvider", "Arn"]})
        );
        assert!(stack.dependencies_of("IngestBucketAutoDeleteObjects").contains("IngestBucketPolicy"));
        assert!(stack.dependencies_of("IngestBucketAutoDeleteObjects").contains("IngestBucket"));

        let policy = serde_json::to_value(stack.resource("IngestBucketPolicy").unwrap()).unwrap();
        let statement = &policy["Properties"]["PolicyDocument"]["Statement"][0];
        assert_eq!(
            statement["Principal"]["AWS"],
            json!({"Fn::GetAtt": ["IngestBucketAutoDeleteProviderRole", "Arn"]})
        );
        assert!(statement["Action"].as_array().unwrap().contains(&json!("s3:DeleteObject*")));
        assert!(stack.template().parameters.contains_key("IngestBucketAutoDeleteProviderCodeKey"));
    }

    #[test]
    fn test_retained_bucket_has_no_provider() {
        let mut builder = StackBuilder::new("Test");
        BucketSpec::retained("Archive", "archive").add_to(&mut builder).unwrap();
        let stack = builder.build().unwrap();
        assert_eq!(stack.resource_count(), 1);
        assert_eq!(
            stack.resource("Archive").unwrap().effective_deletion_policy(),
            DeletionPolicy::Retain
        );
    }
}
