//! Change sets between two synthesized stacks.
//!
//! A property change either updates a resource in place or forces a new
//! physical resource. Replacing a resource gives it a new identity, so every
//! property that reads it through `Ref` or `Fn::GetAtt` changes as well and
//! the change propagates along the graph.

use crate::stack::Stack;
use crate::template::{types, Resource};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What the control plane does with a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeAction {
    /// Create a new resource.
    Add,
    /// Modify the existing physical resource.
    Update,
    /// Create a new physical resource and delete the old one.
    Replace,
    /// Delete the resource.
    Remove,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Add => "Add",
            Self::Update => "Update",
            Self::Replace => "Replace",
            Self::Remove => "Remove",
        };
        f.pad(name)
    }
}

/// One planned change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceChange {
    /// Logical ID.
    pub logical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Action.
    pub action: ChangeAction,
    /// Properties whose value changes, directly or through a replaced
    /// dependency.
    pub changed_properties: BTreeSet<String>,
    /// Replaced resources this change is caused by.
    pub caused_by: BTreeSet<String>,
}

/// All changes between two stacks, in execution order: additions, updates
/// and replacements in creation order, then removals in deletion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    /// Fingerprint of the deployed template.
    pub from_fingerprint: String,
    /// Fingerprint of the new template.
    pub to_fingerprint: String,
    /// Planned changes.
    pub changes: Vec<ResourceChange>,
}

impl ChangeSet {
    /// Returns true if nothing changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the change planned for a resource.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&ResourceChange> {
        self.changes.iter().find(|c| c.logical_id == logical_id)
    }

    /// Returns the action planned for a resource.
    #[must_use]
    pub fn action_of(&self, logical_id: &str) -> Option<ChangeAction> {
        self.get(logical_id).map(|c| c.action)
    }

    /// Logical IDs of replaced resources.
    #[must_use]
    pub fn replacements(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|c| c.action == ChangeAction::Replace)
            .map(|c| c.logical_id.as_str())
            .collect()
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes ({})", self.to_fingerprint);
        }
        writeln!(f, "{} -> {}", self.from_fingerprint, self.to_fingerprint)?;
        for change in &self.changes {
            write!(f, "{:<8} {} ({})", change.action, change.logical_id, change.resource_type)?;
            if !change.changed_properties.is_empty() {
                let props: Vec<&str> = change.changed_properties.iter().map(String::as_str).collect();
                write!(f, " [{}]", props.join(", "))?;
            }
            if !change.caused_by.is_empty() {
                let causes: Vec<&str> = change.caused_by.iter().map(String::as_str).collect();
                write!(f, " via {}", causes.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Which property changes force a replacement.
enum Replacement {
    /// Every property change.
    Any,
    /// Only changes to these properties.
    Only(&'static [&'static str]),
}

fn replacement_rule(resource_type: &str) -> Replacement {
    match resource_type {
        types::SAGEMAKER_MODEL
        | types::SAGEMAKER_ENDPOINT_CONFIG
        | types::LAMBDA_PERMISSION
        | types::SUBNET_ROUTE_TABLE_ASSOCIATION => Replacement::Any,
        types::SAGEMAKER_ENDPOINT => Replacement::Only(&["EndpointName"]),
        types::VPC => Replacement::Only(&["CidrBlock"]),
        types::SUBNET => Replacement::Only(&["AvailabilityZone", "CidrBlock", "VpcId"]),
        types::ROUTE_TABLE => Replacement::Only(&["VpcId"]),
        types::ROUTE => Replacement::Only(&["DestinationCidrBlock", "RouteTableId"]),
        types::EIP => Replacement::Only(&["Domain"]),
        types::NAT_GATEWAY => Replacement::Only(&["AllocationId", "SubnetId"]),
        types::VPC_ENDPOINT => Replacement::Only(&["ServiceName", "VpcEndpointType", "VpcId"]),
        types::SECURITY_GROUP => Replacement::Only(&["GroupDescription", "GroupName", "VpcId"]),
        types::BUCKET => Replacement::Only(&["BucketName"]),
        types::ROLE => Replacement::Only(&["RoleName", "Path"]),
        types::LAMBDA_FUNCTION => Replacement::Only(&["FunctionName"]),
        types::EVENTS_RULE => Replacement::Only(&["Name"]),
        _ => Replacement::Only(&[]),
    }
}

fn forces_replacement(resource_type: &str, property: &str) -> bool {
    match replacement_rule(resource_type) {
        Replacement::Any => true,
        Replacement::Only(props) => props.contains(&property),
    }
}

fn direct_changes(old: &Resource, new: &Resource) -> BTreeSet<String> {
    old.properties
        .keys()
        .chain(new.properties.keys())
        .filter(|key| old.properties.get(*key) != new.properties.get(*key))
        .cloned()
        .collect()
}

/// Plans the changes that turn `old` into `new`.
#[must_use]
pub fn plan(old: &Stack, new: &Stack) -> ChangeSet {
    let mut replaced: BTreeSet<String> = BTreeSet::new();
    let mut changes = Vec::new();

    for id in new.creation_order() {
        let Some(resource) = new.resource(id) else {
            continue;
        };
        let Some(previous) = old.resource(id) else {
            changes.push(ResourceChange {
                logical_id: id.clone(),
                resource_type: resource.resource_type.clone(),
                action: ChangeAction::Add,
                changed_properties: resource.properties.keys().cloned().collect(),
                caused_by: BTreeSet::new(),
            });
            continue;
        };

        if previous.resource_type != resource.resource_type {
            replaced.insert(id.clone());
            changes.push(ResourceChange {
                logical_id: id.clone(),
                resource_type: resource.resource_type.clone(),
                action: ChangeAction::Replace,
                changed_properties: resource.properties.keys().cloned().collect(),
                caused_by: BTreeSet::new(),
            });
            continue;
        }

        let mut changed = direct_changes(previous, resource);
        let mut caused_by = BTreeSet::new();
        for (key, value) in &resource.properties {
            let upstream: Vec<String> = value.references().intersection(&replaced).cloned().collect();
            if !upstream.is_empty() {
                changed.insert(key.clone());
                caused_by.extend(upstream);
            }
        }
        if changed.is_empty() {
            continue;
        }

        let action = if changed.iter().any(|p| forces_replacement(&resource.resource_type, p)) {
            replaced.insert(id.clone());
            ChangeAction::Replace
        } else {
            ChangeAction::Update
        };
        changes.push(ResourceChange {
            logical_id: id.clone(),
            resource_type: resource.resource_type.clone(),
            action,
            changed_properties: changed,
            caused_by,
        });
    }

    for id in old.deletion_order() {
        if new.resource(&id).is_none() {
            if let Some(resource) = old.resource(&id) {
                changes.push(ResourceChange {
                    logical_id: id.clone(),
                    resource_type: resource.resource_type.clone(),
                    action: ChangeAction::Remove,
                    changed_properties: BTreeSet::new(),
                    caused_by: BTreeSet::new(),
                });
            }
        }
    }

    ChangeSet {
        from_fingerprint: old.fingerprint(),
        to_fingerprint: new.fingerprint(),
        changes,
    }
}

/// Counts planned changes by action.
#[must_use]
pub fn summarize(changes: &ChangeSet) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for change in &changes.changes {
        *counts.entry(change.action.to_string()).or_insert(0) += 1;
    }
    counts
}
