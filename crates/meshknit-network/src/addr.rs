//! Mesh addresses
//!
//! Overlay identities are IPv4 addresses inside the private mesh. `Ip4` is a
//! 32-bit host-order value used as both routing key and key-derivation
//! input; `Cidr` carries a node's configured address plus prefix.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};

/// A mesh address (IPv4, host byte order)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ip4(u32);

impl Ip4 {
    /// Create from a raw host-order value
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw host-order value
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Big-endian wire bytes
    pub fn octets(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Create from wire bytes
    pub fn from_octets(octets: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(octets))
    }
}

impl From<Ipv4Addr> for Ip4 {
    fn from(addr: Ipv4Addr) -> Self {
        Self(u32::from(addr))
    }
}

impl From<Ip4> for Ipv4Addr {
    fn from(addr: Ip4) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl fmt::Display for Ip4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ipv4Addr::from(self.0))
    }
}

impl FromStr for Ip4 {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: Ipv4Addr = s
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;
        Ok(addr.into())
    }
}

/// An address with prefix length, e.g. `10.0.0.5/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: Ip4,
    prefix: u8,
}

impl Cidr {
    pub fn new(addr: Ip4, prefix: u8) -> NetworkResult<Self> {
        if prefix > 32 {
            return Err(NetworkError::InvalidAddress(format!(
                "prefix length {} out of range",
                prefix
            )));
        }
        Ok(Self { addr, prefix })
    }

    pub fn addr(&self) -> Ip4 {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Subnet mask as a host-order value
    pub fn netmask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            !0u32 << (32 - self.prefix)
        }
    }

    /// Network base address
    pub fn network(&self) -> Ip4 {
        Ip4(self.addr.0 & self.netmask())
    }

    /// Broadcast address of the subnet
    pub fn broadcast(&self) -> Ip4 {
        Ip4(self.addr.0 | !self.netmask())
    }

    /// Whether another mesh address falls inside this subnet
    pub fn contains(&self, other: Ip4) -> bool {
        (other.0 & self.netmask()) == (self.addr.0 & self.netmask())
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| NetworkError::InvalidAddress(format!("missing prefix in '{}'", s)))?;
        let addr: Ip4 = addr.parse()?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| NetworkError::InvalidAddress(format!("bad prefix in '{}'", s)))?;
        Cidr::new(addr, prefix)
    }
}
