//! Traffic-control groups and network placement.

use crate::core::Expr;
use crate::errors::{codes, SynthResult, SynthesisError};
use crate::network::ANY_IPV4;
use crate::stack::StackBuilder;
use crate::template::{types, Resource};

/// HTTPS port.
pub const HTTPS_PORT: u16 = 443;

/// One inbound rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    /// IP protocol (`tcp`).
    pub protocol: String,
    /// First port.
    pub from_port: u16,
    /// Last port.
    pub to_port: u16,
    /// Source CIDR.
    pub source: Expr,
    /// Description.
    pub description: String,
}

impl IngressRule {
    /// HTTPS from `source`.
    #[must_use]
    pub fn https_from(source: Expr) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: HTTPS_PORT,
            to_port: HTTPS_PORT,
            source,
            description: "HTTPS from within the VPC".to_string(),
        }
    }

    fn to_expr(&self) -> Expr {
        Expr::map([
            ("IpProtocol", Expr::from(self.protocol.as_str())),
            ("FromPort", Expr::from(u32::from(self.from_port))),
            ("ToPort", Expr::from(u32::from(self.to_port))),
            ("CidrIp", self.source.clone()),
            ("Description", Expr::from(self.description.as_str())),
        ])
    }
}

/// A security group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    /// Logical ID.
    pub logical_id: String,
    /// Group description.
    pub description: String,
    /// Network the group lives in.
    pub vpc_id: Expr,
    /// Inbound rules.
    pub ingress: Vec<IngressRule>,
    /// Allow all outbound traffic.
    pub allow_all_outbound: bool,
}

impl SecurityGroup {
    /// The endpoint group: all outbound, inbound HTTPS from the network's
    /// own CIDR when `https_ingress` is set.
    #[must_use]
    pub fn endpoint(logical_id: impl Into<String>, vpc_id: Expr, vpc_cidr: Expr, https_ingress: bool) -> Self {
        Self {
            logical_id: logical_id.into(),
            description: "Allow HTTPS from VPC to SageMaker endpoint".to_string(),
            vpc_id,
            ingress: if https_ingress {
                vec![IngressRule::https_from(vpc_cidr)]
            } else {
                Vec::new()
            },
            allow_all_outbound: true,
        }
    }

    /// Rejects inbound rules open to the internet.
    ///
    /// # Errors
    ///
    /// Returns a `SYNTH-010-NETWORK` error naming the offending rule.
    pub fn validate(&self) -> SynthResult<()> {
        for rule in &self.ingress {
            if rule.source.as_str() == Some(ANY_IPV4) {
                return Err(SynthesisError::coded(
                    codes::NETWORK,
                    format!("Security group '{}' admits traffic from {ANY_IPV4}", self.logical_id),
                )
                .with_resources(vec![self.logical_id.clone()])
                .with_fix_hint("Restrict ingress to the VPC CIDR."));
            }
            if rule.from_port > rule.to_port {
                return Err(SynthesisError::coded(
                    codes::NETWORK,
                    format!("Security group '{}' has an empty port range", self.logical_id),
                ));
            }
        }
        Ok(())
    }

    /// Validates and lowers the group.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_to(&self, builder: &mut StackBuilder) -> SynthResult<Expr> {
        self.validate()?;
        let mut resource = Resource::new(types::SECURITY_GROUP)
            .with_property("GroupDescription", self.description.as_str())
            .with_property("VpcId", self.vpc_id.clone());
        if !self.ingress.is_empty() {
            let rules = Expr::list(self.ingress.iter().map(IngressRule::to_expr));
            resource = resource.with_property("SecurityGroupIngress", rules);
        }
        if self.allow_all_outbound {
            resource = resource.with_property(
                "SecurityGroupEgress",
                Expr::list([Expr::map([
                    ("CidrIp", Expr::from(ANY_IPV4)),
                    ("Description", Expr::from("Allow all outbound traffic by default")),
                    ("IpProtocol", Expr::from("-1")),
                ])]),
            );
        }
        builder.add_resource(&self.logical_id, resource)?;
        Ok(Expr::get_att(&self.logical_id, "GroupId"))
    }
}

/// Subnets and security groups a workload is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpcPlacement {
    /// Subnet IDs.
    pub subnets: Vec<Expr>,
    /// Security group IDs.
    pub security_group_ids: Vec<Expr>,
}

impl VpcPlacement {
    /// Model-style `VpcConfig` (`Subnets`, `SecurityGroupIds`).
    #[must_use]
    pub fn model_config(&self) -> Expr {
        Expr::map([
            ("SecurityGroupIds", Expr::list(self.security_group_ids.iter().cloned())),
            ("Subnets", Expr::list(self.subnets.iter().cloned())),
        ])
    }

    /// Function-style `VpcConfig` (`SubnetIds`, `SecurityGroupIds`).
    #[must_use]
    pub fn function_config(&self) -> Expr {
        Expr::map([
            ("SecurityGroupIds", Expr::list(self.security_group_ids.iter().cloned())),
            ("SubnetIds", Expr::list(self.subnets.iter().cloned())),
        ])
    }

    /// The placement as a JSON string assembled at deploy time:
    /// `{"Subnets":[...],"SecurityGroupIds":[...]}`.
    #[must_use]
    pub fn json_string(&self) -> Expr {
        Expr::join(
            "",
            vec![
                Expr::string("{\"Subnets\":[\""),
                Expr::join("\",\"", self.subnets.clone()),
                Expr::string("\"],\"SecurityGroupIds\":[\""),
                Expr::join("\",\"", self.security_group_ids.clone()),
                Expr::string("\"]}"),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builder_with_vpc() -> StackBuilder {
        StackBuilder::new("Test")
            .resource("Vpc", Resource::new(types::VPC).with_property("CidrBlock", "10.0.0.0/16"))
            .unwrap()
    }

    #[test]
    fn test_endpoint_group_https_from_vpc() {
        let mut builder = builder_with_vpc();
        let group = SecurityGroup::endpoint("SmEndpointSG", Expr::reference("Vpc"), Expr::get_att("Vpc", "CidrBlock"), true);
        let id = group.add_to(&mut builder).unwrap();
        assert_eq!(id, Expr::get_att("SmEndpointSG", "GroupId"));

        let json = serde_json::to_value(builder.get("SmEndpointSG").unwrap()).unwrap();
        let ingress = &json["Properties"]["SecurityGroupIngress"][0];
        assert_eq!(ingress["FromPort"], 443);
        assert_eq!(ingress["CidrIp"], json!({"Fn::GetAtt": ["Vpc", "CidrBlock"]}));
        assert_eq!(json["Properties"]["SecurityGroupEgress"][0]["IpProtocol"], "-1");
    }

    #[test]
    fn test_endpoint_group_without_ingress() {
        let group = SecurityGroup::endpoint("Sg", Expr::reference("Vpc"), Expr::get_att("Vpc", "CidrBlock"), false);
        assert!(group.ingress.is_empty());
        assert!(group.allow_all_outbound);
    }

    #[test]
    fn test_open_ingress_rejected() {
        let mut group = SecurityGroup::endpoint("Sg", Expr::reference("Vpc"), Expr::from(ANY_IPV4), true);
        assert_eq!(group.validate().unwrap_err().code(), Some(codes::NETWORK));
        group.ingress[0].source = Expr::from("10.0.0.0/16");
        assert!(group.validate().is_ok());
    }

    #[test]
    fn test_placement_json_string() {
        let placement = VpcPlacement {
            subnets: vec![Expr::reference("A"), Expr::reference("B")],
            security_group_ids: vec![Expr::get_att("Sg", "GroupId")],
        };
        let json = placement.json_string().to_json();
        assert_eq!(json["Fn::Join"][0], "");
        assert_eq!(json["Fn::Join"][1][0], "{\"Subnets\":[\"");
        assert!(placement.json_string().references().contains("Sg"));
        assert_eq!(placement.model_config().to_json()["Subnets"], json!([{"Ref": "A"}, {"Ref": "B"}]));
        assert_eq!(placement.function_config().to_json()["SubnetIds"][1], json!({"Ref": "B"}));
    }
}
