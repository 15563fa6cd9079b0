//! IPv4 CIDR blocks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised when parsing or splitting a CIDR block.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CidrError {
    /// The text is not `a.b.c.d/n`.
    #[error("Malformed CIDR '{0}'")]
    Malformed(String),

    /// The prefix length is above 32.
    #[error("Prefix length {0} is out of range")]
    PrefixOutOfRange(u8),

    /// Host bits are set in the network address.
    #[error("{0} has host bits set")]
    HostBitsSet(String),

    /// A requested subnet is larger than its parent.
    #[error("Cannot split /{parent} into /{requested} blocks")]
    SubnetTooLarge {
        /// Parent prefix length.
        parent: u8,
        /// Requested prefix length.
        requested: u8,
    },
}

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// `10.0.0.0/16`, the block a VPC gets when none is configured.
    pub const DEFAULT_VPC: Self = Self {
        network: Ipv4Addr::new(10, 0, 0, 0),
        prefix: 16,
    };

    /// Creates a CIDR block.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix exceeds 32 or host bits are set.
    pub fn new(network: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError::PrefixOutOfRange(prefix));
        }
        let cidr = Self { network, prefix };
        if u32::from(network) & !cidr.mask() != 0 {
            return Err(CidrError::HostBitsSet(format!("{network}/{prefix}")));
        }
        Ok(cidr)
    }

    /// Returns the network address.
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Returns the prefix length.
    #[must_use]
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Returns the netmask as an integer.
    #[must_use]
    pub fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        }
    }

    /// Returns the number of addresses in the block.
    #[must_use]
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Returns true if the address is inside the block.
    #[must_use]
    pub fn contains_addr(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.network)
    }

    /// Returns true if `other` lies entirely inside this block.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.prefix >= self.prefix && self.contains_addr(other.network)
    }

    /// Returns true if the two blocks share any address.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Returns how many `/new_prefix` blocks fit in this block.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_prefix` is shorter than this block's prefix.
    pub fn subnet_capacity(&self, new_prefix: u8) -> Result<u64, CidrError> {
        self.check_split(new_prefix)?;
        Ok(1u64 << (u32::from(new_prefix) - u32::from(self.prefix)))
    }

    /// Returns the `index`-th `/new_prefix` block, if it fits.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_prefix` is shorter than this block's prefix.
    pub fn nth_subnet(&self, new_prefix: u8, index: u64) -> Result<Option<Self>, CidrError> {
        if index >= self.subnet_capacity(new_prefix)? {
            return Ok(None);
        }
        let step = 1u64 << (32 - u32::from(new_prefix));
        let start = u64::from(u32::from(self.network)) + index * step;
        let addr = Ipv4Addr::from(u32::try_from(start).map_err(|_| CidrError::PrefixOutOfRange(new_prefix))?);
        Self::new(addr, new_prefix).map(Some)
    }

    /// Iterates over every `/new_prefix` block in address order.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_prefix` is shorter than this block's prefix.
    pub fn subnets(&self, new_prefix: u8) -> Result<impl Iterator<Item = Self> + '_, CidrError> {
        let capacity = self.subnet_capacity(new_prefix)?;
        Ok((0..capacity).filter_map(move |index| self.nth_subnet(new_prefix, index).ok().flatten()))
    }

    fn check_split(&self, new_prefix: u8) -> Result<(), CidrError> {
        if new_prefix > 32 {
            return Err(CidrError::PrefixOutOfRange(new_prefix));
        }
        if new_prefix < self.prefix {
            return Err(CidrError::SubnetTooLarge {
                parent: self.prefix,
                requested: new_prefix,
            });
        }
        Ok(())
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| CidrError::Malformed(s.to_string()))?;
        let network = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| CidrError::Malformed(s.to_string()))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|_| CidrError::Malformed(s.to_string()))?;
        Self::new(network, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = CidrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_vpc_block_is_valid() {
        assert_eq!(Ipv4Cidr::DEFAULT_VPC, cidr("10.0.0.0/16"));
        assert_eq!(
            Ipv4Cidr::new(Ipv4Cidr::DEFAULT_VPC.network(), Ipv4Cidr::DEFAULT_VPC.prefix()),
            Ok(Ipv4Cidr::DEFAULT_VPC)
        );
    }

    #[test]
    fn test_parse_and_display() {
        let block = cidr("10.0.0.0/16");
        assert_eq!(block.prefix(), 16);
        assert_eq!(block.size(), 65_536);
        assert_eq!(block.to_string(), "10.0.0.0/16");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!("10.0.0.0".parse::<Ipv4Cidr>(), Err(CidrError::Malformed(_))));
        assert!(matches!("10.0.0.300/16".parse::<Ipv4Cidr>(), Err(CidrError::Malformed(_))));
        assert_eq!("10.0.0.0/33".parse::<Ipv4Cidr>(), Err(CidrError::PrefixOutOfRange(33)));
        assert!(matches!("10.0.1.0/16".parse::<Ipv4Cidr>(), Err(CidrError::HostBitsSet(_))));
    }

    #[test]
    fn test_nth_subnet() {
        let block = cidr("10.0.0.0/16");
        assert_eq!(block.subnet_capacity(24).unwrap(), 256);
        assert_eq!(block.nth_subnet(24, 3).unwrap(), Some(cidr("10.0.3.0/24")));
        assert_eq!(block.nth_subnet(24, 256).unwrap(), None);
        assert!(block.nth_subnet(8, 0).is_err());
    }

    #[test]
    fn test_subnets_in_address_order() {
        let block = cidr("10.0.0.0/22");
        let all: Vec<String> = block.subnets(24).unwrap().map(|c| c.to_string()).collect();
        assert_eq!(all, ["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24", "10.0.3.0/24"]);
        assert_eq!(cidr("10.0.0.0/32").subnets(32).unwrap().count(), 1);
        assert!(block.subnets(16).is_err());
    }

    #[test]
    fn test_contains_and_overlaps() {
        let vpc = cidr("10.0.0.0/16");
        assert!(vpc.contains(&cidr("10.0.2.0/24")));
        assert!(!vpc.contains(&cidr("10.1.0.0/24")));
        assert!(cidr("10.0.2.0/24").overlaps(&vpc));
        assert!(!cidr("10.0.2.0/24").overlaps(&cidr("10.0.3.0/24")));
        assert!(cidr("0.0.0.0/0").contains_addr(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_serde_as_string() {
        let block: Ipv4Cidr = serde_json::from_str("\"172.16.0.0/12\"").unwrap();
        assert_eq!(block, cidr("172.16.0.0/12"));
        assert_eq!(serde_json::to_string(&block).unwrap(), "\"172.16.0.0/12\"");
        assert!(serde_json::from_str::<Ipv4Cidr>("\"nope\"").is_err());
    }
}
