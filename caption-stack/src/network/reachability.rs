//! Static routing analysis of a synthesized stack.
//!
//! Reads subnets, route-table associations, routes and gateway endpoints
//! back out of the template to answer two questions per subnet: where does
//! its default route go, and does it reach object storage without leaving
//! the network.

use super::vpc::ANY_IPV4;
use crate::core::Expr;
use crate::errors::{codes, ErrorInfo, SynthResult, SynthesisError};
use crate::stack::Stack;
use crate::template::{types, Resource};
use std::fmt;

/// Where a subnet's default route leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultRoute {
    /// No default route.
    None,
    /// Directly to the internet gateway.
    InternetGateway(String),
    /// Through a NAT gateway.
    NatGateway(String),
}

impl fmt::Display for DefaultRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::InternetGateway(id) => write!(f, "igw:{id}"),
            Self::NatGateway(id) => write!(f, "nat:{id}"),
        }
    }
}

/// Routing facts for one subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRouting {
    /// Logical ID of the subnet.
    pub subnet: String,
    /// Whether instances get public addresses.
    pub public: bool,
    /// Associated route table.
    pub route_table: Option<String>,
    /// Default route target.
    pub default_route: DefaultRoute,
    /// Storage gateway endpoint attached to the route table.
    pub s3_endpoint: Option<String>,
}

impl SubnetRouting {
    /// Returns true if the subnet has a direct route to the internet.
    #[must_use]
    pub fn is_publicly_routable(&self) -> bool {
        matches!(self.default_route, DefaultRoute::InternetGateway(_))
    }

    /// Returns true if storage traffic stays on the provider network.
    #[must_use]
    pub fn reaches_storage_privately(&self) -> bool {
        self.s3_endpoint.is_some()
    }
}

/// Analyzes the routing of every subnet in the stack.
#[must_use]
pub fn analyze_routing(stack: &Stack) -> Vec<SubnetRouting> {
    let resources = &stack.template().resources;
    let refers_to = |expr: Option<&Expr>, id: &str| matches!(expr, Some(Expr::Ref(r)) if r == id);
    let of_type = |t: &'static str| resources.iter().filter(move |(_, r)| r.is_type(t));

    of_type(types::SUBNET)
        .map(|(subnet_id, subnet)| {
            let route_table = of_type(types::SUBNET_ROUTE_TABLE_ASSOCIATION)
                .find(|(_, a)| refers_to(a.property("SubnetId"), subnet_id))
                .and_then(|(_, a)| ref_target(a.property("RouteTableId")));

            let default_route = route_table
                .as_deref()
                .and_then(|rt| {
                    of_type(types::ROUTE)
                        .map(|(_, r)| r)
                        .find(|r| {
                            refers_to(r.property("RouteTableId"), rt)
                                && r.property("DestinationCidrBlock").and_then(Expr::as_str) == Some(ANY_IPV4)
                        })
                        .map(|r| route_target(r, resources))
                })
                .unwrap_or(DefaultRoute::None);

            let s3_endpoint = route_table.as_deref().and_then(|rt| {
                of_type(types::VPC_ENDPOINT)
                    .find(|(_, e)| is_storage_gateway(e) && lists_ref(e.property("RouteTableIds"), rt))
                    .map(|(id, _)| id.clone())
            });

            SubnetRouting {
                subnet: subnet_id.clone(),
                public: matches!(subnet.property("MapPublicIpOnLaunch"), Some(Expr::Bool(true))),
                route_table,
                default_route,
                s3_endpoint,
            }
        })
        .collect()
}

/// Verifies that private subnets are not publicly routable and, when the
/// network has a storage endpoint, that they all use it.
///
/// # Errors
///
/// Returns a `SYNTH-010-NETWORK` error naming the offending subnets.
pub fn verify_private_isolation(stack: &Stack) -> SynthResult<()> {
    let routing = analyze_routing(stack);
    let has_endpoint = !stack.template().resources_of_type(types::VPC_ENDPOINT).is_empty();

    let offenders: Vec<String> = routing
        .iter()
        .filter(|r| !r.public)
        .filter(|r| r.is_publicly_routable() || (has_endpoint && !r.reaches_storage_privately()))
        .map(|r| r.subnet.clone())
        .collect();

    if offenders.is_empty() {
        return Ok(());
    }
    Err(SynthesisError::new(format!(
        "Private subnets are publicly routable or bypass the storage endpoint: {}",
        offenders.join(", ")
    ))
    .with_resources(offenders)
    .with_error_info(ErrorInfo::new(codes::NETWORK, "Private segment isolation violated")))
}

fn ref_target(expr: Option<&Expr>) -> Option<String> {
    match expr {
        Some(Expr::Ref(id)) => Some(id.clone()),
        _ => None,
    }
}

fn lists_ref(expr: Option<&Expr>, id: &str) -> bool {
    matches!(expr, Some(Expr::List(items)) if items.iter().any(|e| matches!(e, Expr::Ref(r) if r == id)))
}

fn is_storage_gateway(endpoint: &Resource) -> bool {
    let service = match endpoint.property("ServiceName") {
        Some(Expr::Sub(s) | Expr::Str(s)) => s.as_str(),
        _ => "",
    };
    service.ends_with(".s3") && endpoint.property("VpcEndpointType").and_then(Expr::as_str) == Some("Gateway")
}

fn route_target(route: &Resource, resources: &std::collections::BTreeMap<String, Resource>) -> DefaultRoute {
    if let Some(id) = ref_target(route.property("NatGatewayId")) {
        return DefaultRoute::NatGateway(id);
    }
    match ref_target(route.property("GatewayId")) {
        Some(id) if resources.get(&id).is_some_and(|r| r.is_type(types::INTERNET_GATEWAY)) => {
            DefaultRoute::InternetGateway(id)
        }
        _ => DefaultRoute::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetworkSpec, SubnetGroup, SubnetKind};
    use crate::stack::StackBuilder;

    fn stack_for(spec: &NetworkSpec) -> Stack {
        let mut builder = StackBuilder::new("test");
        spec.plan().unwrap().add_to(&mut builder).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_default_network_routing() {
        let stack = stack_for(&NetworkSpec::default());
        let routing = analyze_routing(&stack);
        assert_eq!(routing.len(), 4);

        for subnet in routing.iter().filter(|r| r.public) {
            assert!(subnet.is_publicly_routable(), "{subnet:?}");
            assert!(!subnet.reaches_storage_privately());
        }
        for subnet in routing.iter().filter(|r| !r.public) {
            assert!(!subnet.is_publicly_routable(), "{subnet:?}");
            assert!(matches!(subnet.default_route, DefaultRoute::NatGateway(_)));
            assert_eq!(subnet.s3_endpoint.as_deref(), Some("CaptionVpcS3Gw"));
        }
        assert!(verify_private_isolation(&stack).is_ok());
    }

    #[test]
    fn test_isolated_subnets_have_no_default_route() {
        let spec = NetworkSpec {
            nat_gateways: 0,
            subnet_groups: vec![SubnetGroup::new("data", SubnetKind::Isolated, 24)],
            ..NetworkSpec::default()
        };
        let routing = analyze_routing(&stack_for(&spec));
        assert!(routing.iter().all(|r| r.default_route == DefaultRoute::None));
        assert!(routing.iter().all(SubnetRouting::reaches_storage_privately));
    }

    #[test]
    fn test_missing_endpoint_association_is_flagged() {
        let stack = stack_for(&NetworkSpec::default());
        let mut template = stack.template().clone();
        template
            .resources
            .get_mut("CaptionVpcS3Gw")
            .unwrap()
            .properties
            .insert(
                "RouteTableIds".to_string(),
                Expr::list([Expr::reference("CaptionVpcPrivateSubnet1RouteTable")]),
            );
        let patched = Stack::from_template("test", template, &[]).unwrap();

        let err = verify_private_isolation(&patched).unwrap_err();
        assert_eq!(err.resources, vec!["CaptionVpcPrivateSubnet2"]);
    }
}
