//! Core types for elvisp

use crate::key::PublicKey;
use crate::{Error, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Stable client identity: the client's cjdns public key
pub type ClientId = PublicKey;

/// Address family of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn max_prefix(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

/// Numeric value of an address within its family
pub fn addr_to_u128(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

/// Inverse of [`addr_to_u128`]; the value must fit the family
pub fn u128_to_addr(value: u128, family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// Inclusive address range handed out with a fixed prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: IpAddr,
    pub end: IpAddr,
    pub prefix: u8,
}

impl AddressRange {
    pub fn new(start: IpAddr, end: IpAddr, prefix: u8) -> Result<Self> {
        let family = Family::of(&start);
        if family != Family::of(&end) {
            return Err(Error::InvalidConfig(format!(
                "range {} - {} mixes address families",
                start, end
            )));
        }
        if addr_to_u128(&start) > addr_to_u128(&end) {
            return Err(Error::InvalidConfig(format!(
                "range start {} is above range end {}",
                start, end
            )));
        }
        if prefix > family.max_prefix() {
            return Err(Error::InvalidConfig(format!(
                "prefix /{} is too long for {}",
                prefix, family
            )));
        }
        if addr_to_u128(&end) - addr_to_u128(&start) == u128::MAX {
            return Err(Error::InvalidConfig(
                "ranges spanning the whole IPv6 space are not supported".to_string(),
            ));
        }
        Ok(Self { start, end, prefix })
    }

    /// Range covering a whole CIDR network. `prefix` defaults to the
    /// network's own length.
    pub fn from_cidr(cidr: &str, prefix: Option<u8>) -> Result<Self> {
        let net: IpNetwork = cidr
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("invalid CIDR {}: {}", cidr, e)))?;
        let family = Family::of(&net.network());
        let host_bits = (family.max_prefix() - net.prefix()) as u32;
        let first = addr_to_u128(&net.network());
        let last = if host_bits >= 128 {
            u128::MAX
        } else {
            first | ((1u128 << host_bits) - 1)
        };
        Self::new(
            net.network(),
            u128_to_addr(last, family),
            prefix.unwrap_or(net.prefix()),
        )
    }

    pub fn family(&self) -> Family {
        Family::of(&self.start)
    }

    /// Number of addresses in the range (never zero)
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u128 {
        addr_to_u128(&self.end) - addr_to_u128(&self.start) + 1
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.offset_of(addr).is_some()
    }

    /// Offset of `addr` from the range start, if inside the range
    pub fn offset_of(&self, addr: &IpAddr) -> Option<u128> {
        if Family::of(addr) != self.family() {
            return None;
        }
        let value = addr_to_u128(addr);
        let start = addr_to_u128(&self.start);
        if value < start || value > addr_to_u128(&self.end) {
            return None;
        }
        Some(value - start)
    }

    pub fn nth(&self, offset: u128) -> IpAddr {
        u128_to_addr(addr_to_u128(&self.start) + offset, self.family())
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.family() == other.family()
            && addr_to_u128(&self.start) <= addr_to_u128(&other.end)
            && addr_to_u128(&other.start) <= addr_to_u128(&self.end)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} /{}", self.start, self.end, self.prefix)
    }
}

/// A client's address assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub client_id: ClientId,
    pub address: IpAddr,
    pub prefix: u8,
    pub created_at: i64,
    pub last_renewed_at: i64,
}

impl Allocation {
    pub fn new(client_id: ClientId, address: IpAddr, prefix: u8) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            client_id,
            address,
            prefix,
            created_at: now,
            last_renewed_at: now,
        }
    }

    pub fn renew(&mut self) {
        self.last_renewed_at = chrono::Utc::now().timestamp().max(self.last_renewed_at);
    }

    /// Whether the allocation has gone unrenewed for longer than `ttl_secs`
    pub fn is_expired(&self, now: i64, ttl_secs: u64) -> bool {
        now.saturating_sub(self.last_renewed_at) > ttl_secs as i64
    }

    pub fn binding(&self) -> TunnelBinding {
        TunnelBinding {
            public_key: self.client_id,
            address: self.address,
            prefix: self.prefix,
        }
    }
}

/// Shared-secret credential presented by a client
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub password: String,
    pub public_key: ClientId,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// What the mesh daemon holds for one allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelBinding {
    pub public_key: PublicKey,
    pub address: IpAddr,
    pub prefix: u8,
}

impl fmt::Display for TunnelBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} -> {}", self.address, self.prefix, self.public_key)
    }
}

/// A tunnel as reported by the daemon, with the daemon's own handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTunnel {
    pub handle: u64,
    pub binding: TunnelBinding,
}
