//! Test assertions for stacks and invocations.

use crate::simulation::Invocation;
use crate::stack::Stack;

/// Asserts that `dependent` depends on `dependency` and is created after it.
pub fn assert_depends_on(stack: &Stack, dependent: &str, dependency: &str) {
    let deps = stack.dependencies_of(dependent);
    assert!(
        deps.contains(dependency),
        "Expected {dependent} to depend on {dependency}, dependencies: {deps:?}"
    );
    let (Some(before), Some(after)) = (stack.creation_index(dependency), stack.creation_index(dependent)) else {
        panic!("Expected both {dependency} and {dependent} in the creation order");
    };
    assert!(
        before < after,
        "Expected {dependency} (#{before}) to be created before {dependent} (#{after})"
    );
}

/// Asserts the number of resources of a type.
pub fn assert_resource_count(stack: &Stack, resource_type: &str, expected: usize) {
    let found = stack.template().resources_of_type(resource_type);
    assert_eq!(
        found.len(),
        expected,
        "Expected {expected} resources of type {resource_type}, found {found:?}"
    );
}

/// Asserts that an invocation succeeded.
pub fn assert_invocation_succeeded(invocation: &Invocation) {
    assert!(
        invocation.succeeded(),
        "Expected {} to succeed, got {:?}",
        invocation.function_logical_id,
        invocation.error()
    );
}

/// Asserts that an invocation failed.
pub fn assert_invocation_failed(invocation: &Invocation) {
    assert!(
        !invocation.succeeded(),
        "Expected {} to fail, got {:?}",
        invocation.function_logical_id,
        invocation.response()
    );
}
