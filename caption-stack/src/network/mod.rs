//! Network topology: address planning, lowering and routing analysis.

mod cidr;
mod reachability;
mod vpc;

pub use cidr::{CidrError, Ipv4Cidr};
pub use reachability::{analyze_routing, verify_private_isolation, DefaultRoute, SubnetRouting};
pub use vpc::{
    NetworkPlan, NetworkRefs, NetworkSpec, SubnetGroup, SubnetKind, SubnetPlan, ANY_IPV4, MAX_SUBNET_PREFIX,
    MAX_ZONES,
};
