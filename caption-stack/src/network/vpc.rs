//! Network planning and lowering.
//!
//! A [`NetworkSpec`] is planned into concrete subnet blocks first, so every
//! sizing problem surfaces at synthesis time. The plan is then lowered into
//! VPC, subnet, routing, NAT and gateway-endpoint resources.

use super::Ipv4Cidr;
use crate::core::{ids, Expr};
use crate::errors::{codes, ErrorInfo, SynthResult, SynthesisError};
use crate::stack::StackBuilder;
use crate::template::{types, Resource};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Largest zone count a single region offers.
pub const MAX_ZONES: usize = 6;

/// Smallest subnet the provider allows.
pub const MAX_SUBNET_PREFIX: u8 = 28;

/// Destination used by default routes.
pub const ANY_IPV4: &str = "0.0.0.0/0";

/// How a subnet group reaches the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetKind {
    /// Default route through the internet gateway.
    Public,
    /// Default route through a NAT gateway in a public subnet.
    PrivateWithEgress,
    /// No default route at all.
    Isolated,
}

impl SubnetKind {
    /// Returns true for subnets that must not be publicly routable.
    #[must_use]
    pub fn is_private(&self) -> bool {
        !matches!(self, Self::Public)
    }
}

impl fmt::Display for SubnetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::PrivateWithEgress => write!(f, "private_with_egress"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

/// One subnet per zone with the same role and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetGroup {
    /// Group name, used in logical IDs.
    pub name: String,
    /// Routing role.
    pub kind: SubnetKind,
    /// Prefix length of each subnet.
    pub cidr_mask: u8,
}

impl SubnetGroup {
    /// Creates a subnet group.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: SubnetKind, cidr_mask: u8) -> Self {
        Self {
            name: name.into(),
            kind,
            cidr_mask,
        }
    }
}

/// Requested network shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSpec {
    /// Logical ID of the VPC; prefixes every child ID.
    pub logical_id: String,
    /// Address space of the network.
    pub cidr: Ipv4Cidr,
    /// Number of zones to span.
    pub max_azs: usize,
    /// Number of NAT gateways (one per public subnet, starting at zone 0).
    pub nat_gateways: usize,
    /// Subnet groups, allocated in declaration order.
    pub subnet_groups: Vec<SubnetGroup>,
    /// Whether private subnets reach object storage through a gateway endpoint.
    pub s3_gateway_endpoint: bool,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            logical_id: "CaptionVpc".to_string(),
            cidr: Ipv4Cidr::DEFAULT_VPC,
            max_azs: 2,
            nat_gateways: 2,
            subnet_groups: vec![
                SubnetGroup::new("public", SubnetKind::Public, 24),
                SubnetGroup::new("private", SubnetKind::PrivateWithEgress, 24),
            ],
            s3_gateway_endpoint: true,
        }
    }
}

/// A planned subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetPlan {
    /// Logical ID of the subnet.
    pub logical_id: String,
    /// Owning group name.
    pub group: String,
    /// Routing role.
    pub kind: SubnetKind,
    /// Zone index.
    pub zone: usize,
    /// Allocated block.
    pub cidr: Ipv4Cidr,
}

impl SubnetPlan {
    /// Logical ID of the subnet's route table.
    #[must_use]
    pub fn route_table_id(&self) -> String {
        format!("{}RouteTable", self.logical_id)
    }

    /// Logical ID of the subnet's default route.
    #[must_use]
    pub fn default_route_id(&self) -> String {
        format!("{}DefaultRoute", self.logical_id)
    }

    /// Logical ID of the NAT gateway hosted in this (public) subnet.
    #[must_use]
    pub fn nat_gateway_id(&self) -> String {
        format!("{}NATGateway", self.logical_id)
    }
}

/// References into the lowered network used by other resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRefs {
    /// Logical ID of the VPC.
    pub vpc_logical_id: String,
    /// Public subnet logical IDs.
    pub public_subnets: Vec<String>,
    /// Private (egress or isolated) subnet logical IDs.
    pub private_subnets: Vec<String>,
    /// Route tables of private subnets.
    pub private_route_tables: Vec<String>,
    /// Logical ID of the storage gateway endpoint, if any.
    pub s3_endpoint: Option<String>,
}

impl NetworkRefs {
    /// `Ref` to the VPC ID.
    #[must_use]
    pub fn vpc_id(&self) -> Expr {
        Expr::reference(&self.vpc_logical_id)
    }

    /// The VPC's primary CIDR block.
    #[must_use]
    pub fn vpc_cidr(&self) -> Expr {
        Expr::get_att(&self.vpc_logical_id, "CidrBlock")
    }

    /// `Ref`s to the private subnet IDs.
    #[must_use]
    pub fn private_subnet_ids(&self) -> Vec<Expr> {
        self.private_subnets.iter().map(Expr::reference).collect()
    }
}

/// A validated allocation of subnets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    spec: NetworkSpec,
    subnets: Vec<SubnetPlan>,
}

impl NetworkSpec {
    /// Plans the subnet allocation.
    ///
    /// Blocks are allocated group by group in declaration order, zone by
    /// zone within a group, each aligned to its own size.
    ///
    /// # Errors
    ///
    /// Returns a `SYNTH-010-NETWORK` error if zone count, NAT count, masks or
    /// address space do not fit together.
    pub fn plan(&self) -> SynthResult<NetworkPlan> {
        self.check_shape()?;

        let vpc_start = u64::from(u32::from(self.cidr.network()));
        let vpc_end = vpc_start + self.cidr.size();
        let mut cursor = vpc_start;
        let mut subnets = Vec::with_capacity(self.subnet_groups.len() * self.max_azs);

        for group in &self.subnet_groups {
            let block = 1u64 << (32 - u32::from(group.cidr_mask));
            for zone in 0..self.max_azs {
                cursor = cursor.div_ceil(block) * block;
                if cursor + block > vpc_end {
                    return Err(network_error(format!(
                        "Address space {} cannot hold {} subnets of the requested sizes",
                        self.cidr,
                        self.subnet_groups.len() * self.max_azs
                    ))
                    .with_fix_hint("Use a shorter network prefix, fewer zones, or longer subnet masks."));
                }
                let index = (cursor - vpc_start) / block;
                let cidr = self
                    .cidr
                    .nth_subnet(group.cidr_mask, index)
                    .map_err(|e| network_error(e.to_string()))?
                    .ok_or_else(|| network_error(format!("No room for subnet {index} of {}", group.name)))?;
                subnets.push(SubnetPlan {
                    logical_id: ids::indexed(&self.logical_id, &format!("{}-subnet", group.name), zone),
                    group: group.name.clone(),
                    kind: group.kind,
                    zone,
                    cidr,
                });
                cursor += block;
            }
        }

        Ok(NetworkPlan {
            spec: self.clone(),
            subnets,
        })
    }

    fn check_shape(&self) -> SynthResult<()> {
        ids::validate_logical_id(&self.logical_id)?;
        if self.max_azs == 0 || self.max_azs > MAX_ZONES {
            return Err(network_error(format!(
                "Zone count must be between 1 and {MAX_ZONES}, got {}",
                self.max_azs
            )));
        }
        if self.subnet_groups.is_empty() {
            return Err(network_error("Network declares no subnet groups"));
        }
        let has_public = self.subnet_groups.iter().any(|g| g.kind == SubnetKind::Public);
        let has_egress = self
            .subnet_groups
            .iter()
            .any(|g| g.kind == SubnetKind::PrivateWithEgress);
        if self.nat_gateways > self.max_azs {
            return Err(network_error(format!(
                "{} NAT gateways requested but only {} zones have public subnets",
                self.nat_gateways, self.max_azs
            )));
        }
        if has_egress && (self.nat_gateways == 0 || !has_public) {
            return Err(network_error(
                "Private subnets with egress need at least one NAT gateway in a public subnet",
            )
            .with_fix_hint("Add a public subnet group and set nat_gateways >= 1, or make the group isolated."));
        }
        if !has_public && self.nat_gateways > 0 {
            return Err(network_error("NAT gateways need a public subnet group"));
        }
        let mut names = std::collections::HashSet::new();
        for group in &self.subnet_groups {
            if !names.insert(group.name.as_str()) {
                return Err(network_error(format!("Subnet group '{}' declared twice", group.name)));
            }
            if group.cidr_mask < self.cidr.prefix() || group.cidr_mask > MAX_SUBNET_PREFIX {
                return Err(network_error(format!(
                    "Subnet group '{}' mask /{} must be between /{} and /{MAX_SUBNET_PREFIX}",
                    group.name,
                    group.cidr_mask,
                    self.cidr.prefix()
                )));
            }
        }
        Ok(())
    }
}

impl NetworkPlan {
    /// Returns the spec this plan was made from.
    #[must_use]
    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    /// Returns the planned subnets.
    #[must_use]
    pub fn subnets(&self) -> &[SubnetPlan] {
        &self.subnets
    }

    /// Returns the planned subnets of a kind.
    pub fn subnets_of(&self, kind: SubnetKind) -> impl Iterator<Item = &SubnetPlan> {
        self.subnets.iter().filter(move |s| s.kind == kind)
    }

    /// Returns the public subnets that host a NAT gateway.
    #[must_use]
    pub fn nat_hosts(&self) -> Vec<&SubnetPlan> {
        let mut hosts: Vec<&SubnetPlan> = self.subnets_of(SubnetKind::Public).collect();
        hosts.sort_by_key(|s| s.zone);
        hosts.dedup_by_key(|s| s.zone);
        hosts.truncate(self.spec.nat_gateways);
        hosts
    }

    /// Lowers the plan into resources.
    ///
    /// # Errors
    ///
    /// Returns an error if any resource fails builder validation.
    pub fn add_to(&self, builder: &mut StackBuilder) -> SynthResult<NetworkRefs> {
        let vpc = self.spec.logical_id.clone();
        builder.add_resource(
            &vpc,
            Resource::new(types::VPC)
                .with_property("CidrBlock", self.spec.cidr.to_string())
                .with_property("EnableDnsHostnames", true)
                .with_property("EnableDnsSupport", true)
                .with_property("Tags", name_tag(&vpc)),
        )?;

        let igw = format!("{vpc}IGW");
        let attachment = format!("{vpc}VPCGW");
        let has_public = self.subnets_of(SubnetKind::Public).next().is_some();
        if has_public {
            builder.add_resource(&igw, Resource::new(types::INTERNET_GATEWAY).with_property("Tags", name_tag(&vpc)))?;
            builder.add_resource(
                &attachment,
                Resource::new(types::VPC_GATEWAY_ATTACHMENT)
                    .with_property("VpcId", Expr::reference(&vpc))
                    .with_property("InternetGatewayId", Expr::reference(&igw)),
            )?;
        }

        for subnet in &self.subnets {
            self.add_subnet(builder, subnet)?;
            if subnet.kind == SubnetKind::Public {
                builder.add_resource(
                    subnet.default_route_id(),
                    Resource::new(types::ROUTE)
                        .with_property("RouteTableId", Expr::reference(subnet.route_table_id()))
                        .with_property("DestinationCidrBlock", ANY_IPV4)
                        .with_property("GatewayId", Expr::reference(&igw))
                        .with_dependency(&attachment),
                )?;
            }
        }

        let nat_hosts = self.nat_hosts();
        for host in &nat_hosts {
            let eip = format!("{}EIP", host.logical_id);
            builder.add_resource(&eip, Resource::new(types::EIP).with_property("Domain", "vpc"))?;
            builder.add_resource(
                host.nat_gateway_id(),
                Resource::new(types::NAT_GATEWAY)
                    .with_property("AllocationId", Expr::get_att(&eip, "AllocationId"))
                    .with_property("SubnetId", Expr::reference(&host.logical_id))
                    .with_property("Tags", name_tag(&host.logical_id))
                    .with_dependency(host.default_route_id()),
            )?;
        }

        let mut refs = NetworkRefs {
            vpc_logical_id: vpc.clone(),
            public_subnets: Vec::new(),
            private_subnets: Vec::new(),
            private_route_tables: Vec::new(),
            s3_endpoint: None,
        };

        for subnet in &self.subnets {
            match subnet.kind {
                SubnetKind::Public => refs.public_subnets.push(subnet.logical_id.clone()),
                SubnetKind::PrivateWithEgress => {
                    let nat = &nat_hosts[subnet.zone % nat_hosts.len()];
                    builder.add_resource(
                        subnet.default_route_id(),
                        Resource::new(types::ROUTE)
                            .with_property("RouteTableId", Expr::reference(subnet.route_table_id()))
                            .with_property("DestinationCidrBlock", ANY_IPV4)
                            .with_property("NatGatewayId", Expr::reference(nat.nat_gateway_id())),
                    )?;
                    refs.private_subnets.push(subnet.logical_id.clone());
                    refs.private_route_tables.push(subnet.route_table_id());
                }
                SubnetKind::Isolated => {
                    refs.private_subnets.push(subnet.logical_id.clone());
                    refs.private_route_tables.push(subnet.route_table_id());
                }
            }
        }

        if self.spec.s3_gateway_endpoint && !refs.private_route_tables.is_empty() {
            let endpoint = format!("{vpc}S3Gw");
            builder.add_resource(
                &endpoint,
                Resource::new(types::VPC_ENDPOINT)
                    .with_property("ServiceName", Expr::sub("com.amazonaws.${AWS::Region}.s3"))
                    .with_property("VpcEndpointType", "Gateway")
                    .with_property("VpcId", Expr::reference(&vpc))
                    .with_property(
                        "RouteTableIds",
                        Expr::list(refs.private_route_tables.iter().map(Expr::reference)),
                    ),
            )?;
            refs.s3_endpoint = Some(endpoint);
        }

        debug!(
            vpc = %vpc,
            subnets = self.subnets.len(),
            nat_gateways = nat_hosts.len(),
            "lowered network plan"
        );
        Ok(refs)
    }

    fn add_subnet(&self, builder: &mut StackBuilder, subnet: &SubnetPlan) -> SynthResult<()> {
        let vpc = &self.spec.logical_id;
        builder.add_resource(
            &subnet.logical_id,
            Resource::new(types::SUBNET)
                .with_property("VpcId", Expr::reference(vpc))
                .with_property("CidrBlock", subnet.cidr.to_string())
                .with_property("AvailabilityZone", Expr::zone(subnet.zone))
                .with_property("MapPublicIpOnLaunch", subnet.kind == SubnetKind::Public)
                .with_property("Tags", name_tag(&subnet.logical_id))
                .with_metadata("SubnetType", serde_json::json!(subnet.kind.to_string())),
        )?;
        builder.add_resource(
            subnet.route_table_id(),
            Resource::new(types::ROUTE_TABLE).with_property("VpcId", Expr::reference(vpc)),
        )?;
        builder.add_resource(
            format!("{}RouteTableAssociation", subnet.logical_id),
            Resource::new(types::SUBNET_ROUTE_TABLE_ASSOCIATION)
                .with_property("RouteTableId", Expr::reference(subnet.route_table_id()))
                .with_property("SubnetId", Expr::reference(&subnet.logical_id)),
        )
    }
}

fn name_tag(value: &str) -> Expr {
    Expr::list([Expr::map([
        ("Key", Expr::string("Name")),
        ("Value", Expr::sub(format!("${{AWS::StackName}}/{value}"))),
    ])])
}

fn network_error(message: impl Into<String>) -> SynthesisError {
    let message = message.into();
    SynthesisError::new(message.clone()).with_error_info(ErrorInfo::new(codes::NETWORK, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_plan_allocation_order() {
        assert_eq!(NetworkSpec::default().cidr.to_string(), "10.0.0.0/16");
        let plan = NetworkSpec::default().plan().unwrap();
        let allocated: Vec<(String, String)> = plan
            .subnets()
            .iter()
            .map(|s| (s.logical_id.clone(), s.cidr.to_string()))
            .collect();
        assert_eq!(
            allocated,
            vec![
                ("CaptionVpcPublicSubnet1".to_string(), "10.0.0.0/24".to_string()),
                ("CaptionVpcPublicSubnet2".to_string(), "10.0.1.0/24".to_string()),
                ("CaptionVpcPrivateSubnet1".to_string(), "10.0.2.0/24".to_string()),
                ("CaptionVpcPrivateSubnet2".to_string(), "10.0.3.0/24".to_string()),
            ]
        );
        assert_eq!(plan.nat_hosts().len(), 2);
    }

    #[test]
    fn test_mixed_masks_are_aligned() {
        let spec = NetworkSpec {
            subnet_groups: vec![
                SubnetGroup::new("public", SubnetKind::Public, 26),
                SubnetGroup::new("private", SubnetKind::PrivateWithEgress, 24),
            ],
            max_azs: 1,
            nat_gateways: 1,
            ..NetworkSpec::default()
        };
        let plan = spec.plan().unwrap();
        assert_eq!(plan.subnets()[0].cidr.to_string(), "10.0.0.0/26");
        assert_eq!(plan.subnets()[1].cidr.to_string(), "10.0.1.0/24");
    }

    #[test]
    fn test_insufficient_address_space() {
        let spec = NetworkSpec {
            cidr: "10.0.0.0/23".parse().unwrap(),
            ..NetworkSpec::default()
        };
        let err = spec.plan().unwrap_err();
        assert_eq!(err.code(), Some(codes::NETWORK));
        assert!(err.message.contains("cannot hold 4 subnets"));
    }

    #[test]
    fn test_invalid_zone_and_nat_counts() {
        let zero = NetworkSpec {
            max_azs: 0,
            ..NetworkSpec::default()
        };
        assert!(zero.plan().is_err());

        let too_many_nats = NetworkSpec {
            nat_gateways: 3,
            ..NetworkSpec::default()
        };
        assert!(too_many_nats.plan().is_err());

        let no_nat = NetworkSpec {
            nat_gateways: 0,
            ..NetworkSpec::default()
        };
        assert_eq!(no_nat.plan().unwrap_err().code(), Some(codes::NETWORK));
    }

    #[test]
    fn test_mask_bounds() {
        let spec = NetworkSpec {
            subnet_groups: vec![SubnetGroup::new("isolated", SubnetKind::Isolated, 29)],
            nat_gateways: 0,
            ..NetworkSpec::default()
        };
        assert!(spec.plan().is_err());

        let wide = NetworkSpec {
            subnet_groups: vec![SubnetGroup::new("isolated", SubnetKind::Isolated, 15)],
            nat_gateways: 0,
            ..NetworkSpec::default()
        };
        assert!(wide.plan().is_err());
    }

    #[test]
    fn test_lowering_resource_counts() {
        let plan = NetworkSpec::default().plan().unwrap();
        let mut builder = StackBuilder::new("test");
        let refs = plan.add_to(&mut builder).unwrap();
        let stack = builder.build().unwrap();
        let template = stack.template();

        assert_eq!(template.resources_of_type(types::VPC).len(), 1);
        assert_eq!(template.resources_of_type(types::SUBNET).len(), 4);
        assert_eq!(template.resources_of_type(types::NAT_GATEWAY).len(), 2);
        assert_eq!(template.resources_of_type(types::ROUTE).len(), 4);
        assert_eq!(template.resources_of_type(types::VPC_ENDPOINT).len(), 1);
        assert_eq!(refs.private_subnets.len(), 2);
        assert_eq!(refs.s3_endpoint.as_deref(), Some("CaptionVpcS3Gw"));
    }

    #[test]
    fn test_single_nat_is_shared() {
        let spec = NetworkSpec {
            nat_gateways: 1,
            ..NetworkSpec::default()
        };
        let mut builder = StackBuilder::new("test");
        spec.plan().unwrap().add_to(&mut builder).unwrap();
        let stack = builder.build().unwrap();

        for route in ["CaptionVpcPrivateSubnet1DefaultRoute", "CaptionVpcPrivateSubnet2DefaultRoute"] {
            assert_eq!(
                stack.resource(route).unwrap().property("NatGatewayId"),
                Some(&Expr::reference("CaptionVpcPublicSubnet1NATGateway"))
            );
        }
    }
}
