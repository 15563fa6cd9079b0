//! The validated resource graph.

use crate::errors::SynthResult;
use crate::template::{Resource, Template};
use crate::utils::validation::{validate_all, DependencyEdges};
use std::collections::{BTreeSet, VecDeque};

/// A synthesized stack: a template plus its validated creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    /// The stack name.
    name: String,
    /// The template document.
    template: Template,
    /// Creation order (dependencies first).
    creation_order: Vec<String>,
}

impl Stack {
    /// Validates a template and computes its creation order.
    ///
    /// Resources are visited in `insertion_order` first, then by logical ID.
    ///
    /// # Errors
    ///
    /// Returns an error on self-dependencies, missing references or cycles.
    pub fn from_template(
        name: impl Into<String>,
        template: Template,
        insertion_order: &[String],
    ) -> SynthResult<Self> {
        let edges = dependency_edges(&template);
        let externals: BTreeSet<String> = template.parameters.keys().cloned().collect();
        let creation_order = validate_all(&edges, &externals, insertion_order)?;

        Ok(Self {
            name: name.into(),
            template,
            creation_order,
        })
    }

    /// Returns the stack name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the template.
    #[must_use]
    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Returns a resource by logical ID.
    #[must_use]
    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.template.resources.get(logical_id)
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.template.resources.len()
    }

    /// Returns the creation order.
    #[must_use]
    pub fn creation_order(&self) -> &[String] {
        &self.creation_order
    }

    /// Returns the deletion order (reverse creation order).
    #[must_use]
    pub fn deletion_order(&self) -> Vec<String> {
        self.creation_order.iter().rev().cloned().collect()
    }

    /// Returns the position of a resource in the creation order.
    #[must_use]
    pub fn creation_index(&self, logical_id: &str) -> Option<usize> {
        self.creation_order.iter().position(|id| id == logical_id)
    }

    /// Returns the resources a resource must be created after.
    ///
    /// Template parameters are not included.
    #[must_use]
    pub fn dependencies_of(&self, logical_id: &str) -> BTreeSet<String> {
        self.resource(logical_id)
            .map(|r| {
                r.dependencies()
                    .into_iter()
                    .filter(|d| self.template.resources.contains_key(d))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the resources that directly depend on a resource.
    #[must_use]
    pub fn dependents_of(&self, logical_id: &str) -> BTreeSet<String> {
        self.template
            .resources
            .iter()
            .filter(|(_, r)| r.dependencies().contains(logical_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns every resource that transitively depends on a resource.
    #[must_use]
    pub fn transitive_dependents(&self, logical_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([logical_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(&current) {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }

    /// SHA-256 hex digest of the template.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.template.fingerprint()
    }

    /// Renders the template as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        self.template.to_json_pretty()
    }
}

fn dependency_edges(template: &Template) -> DependencyEdges {
    template
        .resources
        .iter()
        .map(|(id, resource)| (id.clone(), resource.dependencies()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Expr;
    use crate::errors::codes;
    use crate::template::types;

    fn inference_template() -> Template {
        let mut template = Template::default();
        template.resources.insert(
            "CaptionEndpoint".to_string(),
            Resource::new(types::SAGEMAKER_ENDPOINT)
                .with_property(
                    "EndpointConfigName",
                    Expr::get_att("CaptionEndpointConfig", "EndpointConfigName"),
                )
                .with_dependency("CaptionEndpointConfig"),
        );
        template.resources.insert(
            "CaptionEndpointConfig".to_string(),
            Resource::new(types::SAGEMAKER_ENDPOINT_CONFIG)
                .with_property("ModelName", Expr::get_att("CaptionModel", "ModelName"))
                .with_dependency("CaptionModel"),
        );
        template
            .resources
            .insert("CaptionModel".to_string(), Resource::new(types::SAGEMAKER_MODEL));
        template
    }

    #[test]
    fn test_creation_order_follows_edges() {
        let stack = Stack::from_template("test", inference_template(), &[]).unwrap();
        assert_eq!(
            stack.creation_order(),
            ["CaptionModel", "CaptionEndpointConfig", "CaptionEndpoint"]
        );
        assert_eq!(
            stack.deletion_order(),
            vec!["CaptionEndpoint", "CaptionEndpointConfig", "CaptionModel"]
        );
        assert!(stack.creation_index("CaptionModel") < stack.creation_index("CaptionEndpoint"));
    }

    #[test]
    fn test_dependents() {
        let stack = Stack::from_template("test", inference_template(), &[]).unwrap();
        let direct: Vec<String> = stack.dependents_of("CaptionModel").into_iter().collect();
        assert_eq!(direct, vec!["CaptionEndpointConfig"]);

        let all: Vec<String> = stack.transitive_dependents("CaptionModel").into_iter().collect();
        assert_eq!(all, vec!["CaptionEndpoint", "CaptionEndpointConfig"]);
        assert!(stack.transitive_dependents("CaptionEndpoint").is_empty());
    }

    #[test]
    fn test_from_template_rejects_cycle() {
        let mut template = inference_template();
        template
            .resources
            .get_mut("CaptionModel")
            .unwrap()
            .depends_on
            .insert("CaptionEndpoint".to_string());

        let err = Stack::from_template("test", template, &[]).unwrap_err();
        assert_eq!(err.code(), Some(codes::CYCLE));
    }

    #[test]
    fn test_from_template_rejects_dangling_reference() {
        let mut template = inference_template();
        template.resources.remove("CaptionModel");

        let err = Stack::from_template("test", template, &[]).unwrap_err();
        assert_eq!(err.code(), Some(codes::MISSING_REF));
    }
}
