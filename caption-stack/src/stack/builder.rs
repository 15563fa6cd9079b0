//! Stack builder with incremental validation.

use super::Stack;
use crate::core::{validate_logical_id, Expr};
use crate::errors::{codes, CycleDetectedError, ErrorInfo, SynthResult, SynthesisError};
use crate::template::{Output, Parameter, Resource, Template};
use crate::utils::validation::{missing_dependency_error, self_dependency_error};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Builder for creating validated stacks.
///
/// Resources are added leaf-first: every reference and `DependsOn` entry
/// of a new resource must already be declared.
#[derive(Debug, Clone)]
pub struct StackBuilder {
    /// The stack name.
    name: String,
    /// Template description.
    description: Option<String>,
    /// Declared resources.
    resources: BTreeMap<String, Resource>,
    /// Insertion order for resources.
    resource_order: Vec<String>,
    /// Deploy-time parameters.
    parameters: BTreeMap<String, Parameter>,
    /// Stack outputs.
    outputs: BTreeMap<String, Output>,
}

impl StackBuilder {
    /// Creates a new stack builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            resources: BTreeMap::new(),
            resource_order: Vec::new(),
            parameters: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Sets the template description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a resource, consuming and returning the builder.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails (bad ID, duplicate, missing dependency, cycle).
    pub fn resource(mut self, logical_id: impl Into<String>, resource: Resource) -> SynthResult<Self> {
        self.add_resource(logical_id, resource)?;
        Ok(self)
    }

    /// Adds a resource.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_resource(&mut self, logical_id: impl Into<String>, resource: Resource) -> SynthResult<()> {
        let logical_id = logical_id.into();
        self.check_new_id(&logical_id)?;

        let deps = resource.dependencies();
        if deps.contains(&logical_id) {
            return Err(self_dependency_error(&logical_id));
        }
        for dep in &deps {
            if !self.contains(dep) {
                return Err(missing_dependency_error(&logical_id, dep));
            }
        }

        debug!(
            logical_id = %logical_id,
            resource_type = %resource.resource_type,
            dependencies = deps.len(),
            "declared resource"
        );
        self.resource_order.push(logical_id.clone());
        self.resources.insert(logical_id, resource);

        self.detect_cycles()?;
        Ok(())
    }

    /// Declares a template parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or already used.
    pub fn add_parameter(&mut self, name: impl Into<String>, parameter: Parameter) -> SynthResult<()> {
        let name = name.into();
        self.check_new_id(&name)?;
        self.parameters.insert(name, parameter);
        Ok(())
    }

    /// Declares a stack output.
    ///
    /// # Errors
    ///
    /// Returns an error if the value references an undeclared resource.
    pub fn add_output(
        &mut self,
        name: impl Into<String>,
        value: Expr,
        description: impl Into<String>,
    ) -> SynthResult<()> {
        let name = name.into();
        validate_logical_id(&name)?;
        for dep in value.references() {
            if !self.contains(&dep) {
                return Err(missing_dependency_error(&name, &dep));
            }
        }
        self.outputs.insert(
            name,
            Output {
                value,
                description: Some(description.into()),
            },
        );
        Ok(())
    }

    /// Returns true if a resource or parameter with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name) || self.parameters.contains_key(name)
    }

    /// Returns a declared resource.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.get(logical_id)
    }

    /// Builds the stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no resources.
    pub fn build(self) -> SynthResult<Stack> {
        if self.resources.is_empty() {
            return Err(SynthesisError::new("Stack has no resources").with_error_info(
                ErrorInfo::new(codes::EMPTY, "Cannot synthesize an empty stack")
                    .with_fix_hint("Add at least one resource before building."),
            ));
        }

        let template = Template {
            description: self.description,
            parameters: self.parameters,
            resources: self.resources,
            outputs: self.outputs,
            ..Template::default()
        };
        Stack::from_template(self.name, template, &self.resource_order)
    }

    /// Returns the stack name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    fn check_new_id(&self, id: &str) -> SynthResult<()> {
        validate_logical_id(id)?;
        if self.contains(id) {
            return Err(SynthesisError::new(format!("Logical ID '{id}' is declared twice"))
                .with_resources(vec![id.to_string()])
                .with_error_info(
                    ErrorInfo::new(codes::DUPLICATE, "Duplicate logical ID")
                        .with_fix_hint("Give every resource and parameter a distinct logical ID."),
                ));
        }
        Ok(())
    }

    /// Detects cycles in the dependency graph.
    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for name in &self.resource_order {
            if !visited.contains(name) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(resource) = self.resources.get(node) {
            for dep in resource.dependencies() {
                if !self.resources.contains_key(&dep) {
                    continue;
                }
                if !visited.contains(&dep) {
                    if let Some(cycle) = self.dfs_cycle(&dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(&dep) {
                    let cycle_start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[cycle_start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}
