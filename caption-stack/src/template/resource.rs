//! A single template resource.

use crate::core::Expr;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// CloudFormation resource type names used by the topology.
pub mod types {
    /// A virtual network.
    pub const VPC: &str = "AWS::EC2::VPC";
    /// A subnet.
    pub const SUBNET: &str = "AWS::EC2::Subnet";
    /// A route table.
    pub const ROUTE_TABLE: &str = "AWS::EC2::RouteTable";
    /// A route in a route table.
    pub const ROUTE: &str = "AWS::EC2::Route";
    /// Associates a subnet with a route table.
    pub const SUBNET_ROUTE_TABLE_ASSOCIATION: &str = "AWS::EC2::SubnetRouteTableAssociation";
    /// An internet gateway.
    pub const INTERNET_GATEWAY: &str = "AWS::EC2::InternetGateway";
    /// Attaches an internet gateway to a network.
    pub const VPC_GATEWAY_ATTACHMENT: &str = "AWS::EC2::VPCGatewayAttachment";
    /// An elastic IP.
    pub const EIP: &str = "AWS::EC2::EIP";
    /// A NAT gateway.
    pub const NAT_GATEWAY: &str = "AWS::EC2::NatGateway";
    /// A gateway or interface endpoint.
    pub const VPC_ENDPOINT: &str = "AWS::EC2::VPCEndpoint";
    /// A security group.
    pub const SECURITY_GROUP: &str = "AWS::EC2::SecurityGroup";
    /// An object storage bucket.
    pub const BUCKET: &str = "AWS::S3::Bucket";
    /// An IAM role.
    pub const ROLE: &str = "AWS::IAM::Role";
    /// A SageMaker model.
    pub const SAGEMAKER_MODEL: &str = "AWS::SageMaker::Model";
    /// A SageMaker endpoint configuration.
    pub const SAGEMAKER_ENDPOINT_CONFIG: &str = "AWS::SageMaker::EndpointConfig";
    /// A SageMaker endpoint.
    pub const SAGEMAKER_ENDPOINT: &str = "AWS::SageMaker::Endpoint";
    /// A Lambda function.
    pub const LAMBDA_FUNCTION: &str = "AWS::Lambda::Function";
    /// A resource policy statement on a Lambda function.
    pub const LAMBDA_PERMISSION: &str = "AWS::Lambda::Permission";
    /// An EventBridge rule.
    pub const EVENTS_RULE: &str = "AWS::Events::Rule";
    /// A bucket's resource policy.
    pub const BUCKET_POLICY: &str = "AWS::S3::BucketPolicy";
    /// Custom resource whose provider empties a bucket when it is deleted.
    pub const S3_AUTO_DELETE_OBJECTS: &str = "Custom::S3AutoDeleteObjects";
}

/// What happens to the physical resource when it leaves the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Delete the physical resource.
    Delete,
    /// Keep the physical resource.
    Retain,
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => write!(f, "Delete"),
            Self::Retain => write!(f, "Retain"),
        }
    }
}

/// A resource declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    /// The resource type, e.g. `AWS::SageMaker::Model`.
    #[serde(rename = "Type")]
    pub resource_type: String,
    /// Resource properties.
    #[serde(rename = "Properties", skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Expr>,
    /// Explicit ordering edges.
    #[serde(rename = "DependsOn", skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Deletion policy.
    #[serde(rename = "DeletionPolicy", skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
    /// Policy applied to the old physical resource on replacement.
    #[serde(rename = "UpdateReplacePolicy", skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<DeletionPolicy>,
    /// Free-form metadata.
    #[serde(rename = "Metadata", skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Resource {
    /// Creates a resource of the given type with no properties.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            deletion_policy: None,
            update_replace_policy: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, logical_id: impl Into<String>) -> Self {
        self.depends_on.insert(logical_id.into());
        self
    }

    /// Sets both the deletion and update-replace policies.
    #[must_use]
    pub fn with_removal_policy(mut self, policy: DeletionPolicy) -> Self {
        self.deletion_policy = Some(policy);
        self.update_replace_policy = Some(policy);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns a property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Expr> {
        self.properties.get(key)
    }

    /// Returns true if this resource is of the given type.
    #[must_use]
    pub fn is_type(&self, resource_type: &str) -> bool {
        self.resource_type == resource_type
    }

    /// Logical IDs read by the properties (implicit edges).
    #[must_use]
    pub fn references(&self) -> BTreeSet<String> {
        self.properties
            .values()
            .flat_map(Expr::references)
            .collect()
    }

    /// All logical IDs this resource must be created after.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps = self.references();
        deps.extend(self.depends_on.iter().cloned());
        deps
    }

    /// Returns the effective deletion policy.
    #[must_use]
    pub fn effective_deletion_policy(&self) -> DeletionPolicy {
        self.deletion_policy.unwrap_or(DeletionPolicy::Delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependencies_merge_implicit_and_explicit() {
        let endpoint = Resource::new(types::SAGEMAKER_ENDPOINT)
            .with_property(
                "EndpointConfigName",
                Expr::get_att("CaptionEndpointConfig", "EndpointConfigName"),
            )
            .with_dependency("CaptionModel");

        let deps: Vec<String> = endpoint.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["CaptionEndpointConfig", "CaptionModel"]);
        assert_eq!(endpoint.references().len(), 1);
    }

    #[test]
    fn test_serialize_resource() {
        let bucket = Resource::new(types::BUCKET)
            .with_property("BucketName", "ingest")
            .with_removal_policy(DeletionPolicy::Delete);

        let value = serde_json::to_value(&bucket).unwrap();
        assert_eq!(
            value,
            json!({
                "Type": "AWS::S3::Bucket",
                "Properties": {"BucketName": "ingest"},
                "DeletionPolicy": "Delete",
                "UpdateReplacePolicy": "Delete"
            })
        );
    }

    #[test]
    fn test_default_deletion_policy() {
        let role = Resource::new(types::ROLE);
        assert_eq!(role.effective_deletion_policy(), DeletionPolicy::Delete);
        assert!(role.is_type(types::ROLE));
        assert!(role.property("AssumeRolePolicyDocument").is_none());
    }
}
