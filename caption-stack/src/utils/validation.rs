//! Validation helpers for resource dependency graphs.
//!
//! Graphs are given as `logical id -> ids it must be created after`.

use crate::errors::{codes, CycleDetectedError, ErrorInfo, SynthResult, SynthesisError};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Dependency edges keyed by logical ID.
pub type DependencyEdges = BTreeMap<String, BTreeSet<String>>;

/// Validates that no resource depends on itself.
///
/// # Errors
///
/// Returns a `SYNTH-005-SELF_DEP` error naming the first offender.
pub fn validate_no_self_dependencies(edges: &DependencyEdges) -> SynthResult<()> {
    for (id, deps) in edges {
        if deps.contains(id) {
            return Err(self_dependency_error(id));
        }
    }
    Ok(())
}

/// Validates that every dependency names a known node.
///
/// `externals` are names that may be referenced without being nodes
/// (template parameters).
///
/// # Errors
///
/// Returns a `SYNTH-001-MISSING_REF` error naming the first missing target.
pub fn validate_dependencies_exist(
    edges: &DependencyEdges,
    externals: &BTreeSet<String>,
) -> SynthResult<()> {
    for (id, deps) in edges {
        for dep in deps {
            if !edges.contains_key(dep) && !externals.contains(dep) {
                return Err(missing_dependency_error(id, dep));
            }
        }
    }
    Ok(())
}

/// Validates that the edges form a DAG and returns a creation order.
///
/// Dependencies always precede their dependents. Nodes are visited in
/// `insertion_order` first so the order is deterministic; edges to names
/// that are not nodes are ignored.
///
/// # Errors
///
/// Returns the cycle path if the graph is not acyclic.
pub fn topological_order(
    edges: &DependencyEdges,
    insertion_order: &[String],
) -> Result<Vec<String>, CycleDetectedError> {
    fn visit(
        node: &str,
        edges: &DependencyEdges,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<(), Vec<String>> {
        if let Some(start) = path.iter().position(|n| n == node) {
            let mut cycle = path[start..].to_vec();
            cycle.push(node.to_string());
            return Err(cycle);
        }
        if visited.contains(node) {
            return Ok(());
        }

        path.push(node.to_string());
        if let Some(deps) = edges.get(node) {
            for dep in deps.iter().filter(|d| edges.contains_key(*d)) {
                visit(dep, edges, visited, path, order)?;
            }
        }
        path.pop();

        visited.insert(node.to_string());
        order.push(node.to_string());
        Ok(())
    }

    let mut visited = HashSet::new();
    let mut path = Vec::new();
    let mut order = Vec::with_capacity(edges.len());

    let remaining = edges.keys().filter(|id| !insertion_order.contains(*id));
    for node in insertion_order.iter().chain(remaining) {
        visit(node, edges, &mut visited, &mut path, &mut order).map_err(CycleDetectedError::new)?;
    }

    Ok(order)
}

/// Performs all validations and returns the creation order.
///
/// # Errors
///
/// Returns the first self-dependency, missing dependency or cycle found.
pub fn validate_all(
    edges: &DependencyEdges,
    externals: &BTreeSet<String>,
    insertion_order: &[String],
) -> SynthResult<Vec<String>> {
    validate_no_self_dependencies(edges)?;
    validate_dependencies_exist(edges, externals)?;
    Ok(topological_order(edges, insertion_order)?)
}

pub(crate) fn self_dependency_error(id: &str) -> SynthesisError {
    SynthesisError::new(format!("Resource '{id}' cannot depend on itself"))
        .with_resources(vec![id.to_string()])
        .with_error_info(ErrorInfo::new(codes::SELF_DEP, "Self-referencing resource"))
}

pub(crate) fn missing_dependency_error(id: &str, dep: &str) -> SynthesisError {
    SynthesisError::new(format!("Resource '{id}' depends on unknown resource '{dep}'"))
        .with_resources(vec![id.to_string(), dep.to_string()])
        .with_error_info(
            ErrorInfo::new(codes::MISSING_REF, format!("Dependency '{dep}' not found"))
                .with_fix_hint("Add the dependency before the resource that references it."),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &[&str])]) -> DependencyEdges {
        pairs
            .iter()
            .map(|(id, deps)| {
                (
                    (*id).to_string(),
                    deps.iter().map(|d| (*d).to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_topological_order_puts_dependencies_first() {
        let graph = edges(&[
            ("Endpoint", &["EndpointConfig"]),
            ("EndpointConfig", &["Model"]),
            ("Model", &[]),
        ]);
        let order = topological_order(&graph, &["Endpoint".to_string()]).unwrap();
        assert_eq!(order, vec!["Model", "EndpointConfig", "Endpoint"]);
    }

    #[test]
    fn test_topological_order_respects_insertion_order() {
        let graph = edges(&[("B", &[]), ("A", &[]), ("C", &[])]);
        let insertion = vec!["C".to_string(), "A".to_string(), "B".to_string()];
        assert_eq!(topological_order(&graph, &insertion).unwrap(), insertion);
    }

    #[test]
    fn test_cycle_detected() {
        let graph = edges(&[("A", &["C"]), ("B", &["A"]), ("C", &["B"])]);
        let err = topological_order(&graph, &[]).unwrap_err();
        assert_eq!(err.cycle_path.first(), err.cycle_path.last());
        assert_eq!(err.cycle_path.len(), 4);
    }

    #[test]
    fn test_missing_dependency() {
        let graph = edges(&[("Endpoint", &["EndpointConfig"])]);
        let err = validate_dependencies_exist(&graph, &BTreeSet::new()).unwrap_err();
        assert_eq!(err.code(), Some(codes::MISSING_REF));

        let externals: BTreeSet<String> = ["EndpointConfig".to_string()].into();
        assert!(validate_dependencies_exist(&graph, &externals).is_ok());
    }

    #[test]
    fn test_self_dependency() {
        let graph = edges(&[("Model", &["Model"])]);
        let err = validate_all(&graph, &BTreeSet::new(), &[]).unwrap_err();
        assert_eq!(err.code(), Some(codes::SELF_DEP));
    }
}
