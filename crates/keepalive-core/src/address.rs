//! Peer address validation.
//!
//! Addresses are IP literals with an optional prefix length, e.g. `10.0.0.1`,
//! `10.0.0.1/24` or `2001:db8::1/64`. The prefix length defaults to 0 and is
//! bounded by the address family (32 for IPv4, 128 for IPv6).

use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Invalid address format: {0}")]
    InvalidFormat(String),
    #[error("Invalid IP address: {0}")]
    InvalidIp(String),
    #[error("Invalid prefix length: {0}")]
    InvalidPrefixLength(String),
    #[error("Prefix length {length} out of range for {address}")]
    PrefixLengthOutOfRange { address: IpAddr, length: u8 },
}

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Longest prefix length valid for this family.
    pub fn max_prefix_len(&self) -> u8 {
        match self {
            Self::V4 => 32,
            Self::V6 => 128,
        }
    }
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("IPv4"),
            Self::V6 => f.write_str("IPv6"),
        }
    }
}

/// A validated IP address with its prefix length.
///
/// IPv4-mapped IPv6 literals (`::ffff:a.b.c.d`) are normalized to IPv4.
///
/// # Examples
/// ```
/// use keepalive_core::{AddressFamily, PeerAddress};
///
/// let addr: PeerAddress = "10.0.0.1/24".parse().unwrap();
/// assert_eq!(addr.prefix_len(), 24);
/// assert_eq!(addr.family(), AddressFamily::V4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    ip: IpAddr,
    prefix_len: u8,
}

impl PeerAddress {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn family(&self) -> AddressFamily {
        match self.ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let ip_part = parts.next().unwrap_or_default();
        let len_part = parts.next();
        if parts.next().is_some() {
            return Err(AddressError::InvalidFormat(s.to_string()));
        }

        let ip = IpAddr::from_str(ip_part)
            .map_err(|_| AddressError::InvalidIp(ip_part.to_string()))?
            .to_canonical();

        // "10.0.0.1/" is treated like a bare address
        let prefix_len = match len_part {
            None | Some("") => 0,
            Some(len) => len
                .parse::<u8>()
                .map_err(|_| AddressError::InvalidPrefixLength(len.to_string()))?,
        };

        let addr = Self { ip, prefix_len };
        if prefix_len > addr.family().max_prefix_len() {
            return Err(AddressError::PrefixLengthOutOfRange {
                address: ip,
                length: prefix_len,
            });
        }

        Ok(addr)
    }
}
