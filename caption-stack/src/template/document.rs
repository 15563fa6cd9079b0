//! The synthesized template document.

use super::Resource;
use crate::core::Expr;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// The only template format version CloudFormation accepts.
pub const FORMAT_VERSION: &str = "2010-09-09";

/// A template parameter, resolved by the control plane at deploy time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Parameter {
    /// Parameter type, e.g. `String`.
    #[serde(rename = "Type")]
    pub parameter_type: String,
    /// Default value.
    #[serde(rename = "Default", skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Human-readable description.
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Parameter {
    /// Creates a string parameter with a default.
    #[must_use]
    pub fn string(default: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            parameter_type: "String".to_string(),
            default: Some(default.into()),
            description: Some(description.into()),
        }
    }
}

/// A stack output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Output {
    /// The output value.
    #[serde(rename = "Value")]
    pub value: Expr,
    /// Human-readable description.
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A complete template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    /// Format version.
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    /// Template description.
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Deploy-time parameters.
    #[serde(rename = "Parameters", skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,
    /// Resources keyed by logical ID.
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, Resource>,
    /// Outputs keyed by name.
    #[serde(rename = "Outputs", skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            description: None,
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

impl Template {
    /// Renders the template as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the template as compact JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// SHA-256 hex digest of the compact JSON form.
    ///
    /// All maps are ordered, so equal templates always hash equally.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(bytes))
    }

    /// Returns the logical IDs of all resources of a type.
    #[must_use]
    pub fn resources_of_type(&self, resource_type: &str) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|(_, r)| r.is_type(resource_type))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::types;

    fn sample() -> Template {
        let mut template = Template {
            description: Some("sample".to_string()),
            ..Template::default()
        };
        template
            .resources
            .insert("CaptionVpc".to_string(), Resource::new(types::VPC).with_property("CidrBlock", "10.0.0.0/16"));
        template.outputs.insert(
            "VpcId".to_string(),
            Output {
                value: Expr::reference("CaptionVpc"),
                description: None,
            },
        );
        template
    }

    #[test]
    fn test_template_json_layout() {
        let value: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        assert_eq!(value["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(value["Resources"]["CaptionVpc"]["Type"], "AWS::EC2::VPC");
        assert_eq!(value["Outputs"]["VpcId"]["Value"]["Ref"], "CaptionVpc");
        assert!(value.get("Parameters").is_none());
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        b.resources
            .get_mut("CaptionVpc")
            .unwrap()
            .properties
            .insert("CidrBlock".to_string(), Expr::string("10.1.0.0/16"));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_resources_of_type() {
        let template = sample();
        assert_eq!(template.resources_of_type(types::VPC), vec!["CaptionVpc"]);
        assert!(template.resources_of_type(types::SUBNET).is_empty());
    }
}
