//! Networking utilities for tether.
//!
//! This library provides:
//! - CIDR parsing and membership for IPv4 and IPv6
//! - Named topologies (`name=CIDR`) used for connection affinity
//! - A topology router that maps a remote address to its affinity bucket

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Name of the bucket used when no topology matches.
pub const DEFAULT_TOPOLOGY: &str = "";

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Malformed topology list entry.
    #[error("invalid topology entry: {0:?} (expected name=CIDR)")]
    InvalidTopology(String),
}

// ============================================================================
// CIDR
// ============================================================================

/// An IPv4 or IPv6 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    /// Network address with host bits cleared.
    address: IpAddr,

    /// Prefix length (e.g. 24 for /24).
    prefix_len: u8,
}

impl Cidr {
    /// Create a network, masking host bits out of `address`.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g. "10.0.0.0/8", "2001:db8::/32").
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.trim().split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Network address.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address is within this network.
    ///
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) match IPv4 networks, since
    /// dual-stack sockets report peers that way.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match (self.address, addr) {
            (IpAddr::V4(_), IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => return false,
            },
            _ => addr,
        };

        match (self.address, addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(addr, self.prefix_len) == self.address
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(mask_ipv4(v4, prefix_len)),
        IpAddr::V6(v6) => IpAddr::V6(mask_ipv6(v6, prefix_len)),
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from((bits & mask).to_be_bytes())
}

/// Mask an IPv6 address to a prefix length.
fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

// ============================================================================
// Topology
// ============================================================================

/// A named group of backend addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub name: String,
    pub cidr: Cidr,
}

impl Topology {
    pub fn new(name: impl Into<String>, cidr: Cidr) -> Self {
        Self {
            name: name.into(),
            cidr,
        }
    }
}

/// Maps addresses to topology names.
///
/// The list is immutable once built. Lookups scan it in order and the first
/// matching entry wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyRouter {
    topologies: Vec<Topology>,
}

impl TopologyRouter {
    /// A router with topology-awareness disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(topologies: Vec<Topology>) -> Self {
        Self { topologies }
    }

    /// Parse `name1=192.168.0.0/24,name2=192.168.1.0/24`.
    ///
    /// Empty segments are skipped, so an empty string yields a disabled router.
    pub fn parse(list: &str) -> Result<Self, NetworkError> {
        let mut topologies = Vec::new();

        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let Some((name, cidr)) = entry.split_once('=') else {
                return Err(NetworkError::InvalidTopology(entry.to_string()));
            };
            if name.is_empty() || cidr.contains('=') {
                return Err(NetworkError::InvalidTopology(entry.to_string()));
            }

            topologies.push(Topology::new(name, Cidr::parse(cidr)?));
        }

        Ok(Self { topologies })
    }

    /// Topology-awareness is on when at least one topology is configured.
    pub fn is_enabled(&self) -> bool {
        !self.topologies.is_empty()
    }

    pub fn topologies(&self) -> &[Topology] {
        &self.topologies
    }

    /// Name of the first topology containing `ip`, or [`DEFAULT_TOPOLOGY`].
    pub fn resolve_ip(&self, ip: IpAddr) -> &str {
        self.topologies
            .iter()
            .find(|t| t.cidr.contains(ip))
            .map(|t| t.name.as_str())
            .unwrap_or(DEFAULT_TOPOLOGY)
    }

    /// Name of the topology a remote socket address belongs to.
    pub fn resolve(&self, addr: SocketAddr) -> &str {
        self.resolve_ip(addr.ip())
    }

    /// The proxy's own affinity bucket, derived from its own IP.
    pub fn self_topology(&self, own_ip: Option<IpAddr>) -> &str {
        match own_ip {
            Some(ip) => self.resolve_ip(ip),
            None => DEFAULT_TOPOLOGY,
        }
    }
}
