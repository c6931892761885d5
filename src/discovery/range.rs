//! IPv4 address ranges in CIDR notation.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Smallest prefix length accepted for a sweep (a /16 is 65,534 hosts).
pub const MIN_PREFIX_LEN: u8 = 16;

/// Errors raised while parsing or constructing a range.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RangeError {
    /// The network part is not a dotted-quad IPv4 address.
    #[error("invalid address in range '{input}'")]
    InvalidAddress {
        /// Text that failed to parse.
        input: String,
    },
    /// The prefix length is not a number between 0 and 32.
    #[error("invalid prefix length in range '{input}'")]
    InvalidPrefix {
        /// Text that failed to parse.
        input: String,
    },
    /// The range is wider than a sweep is allowed to cover.
    #[error("range /{prefix_len} is too large; use /{MIN_PREFIX_LEN} or narrower")]
    TooLarge {
        /// Requested prefix length.
        prefix_len: u8,
    },
}

/// An inclusive block of IPv4 addresses such as `192.168.1.0/24`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct AddressRange {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl AddressRange {
    /// Builds a range, clearing any host bits set in `address`.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::InvalidPrefix`] for prefixes above 32 and
    /// [`RangeError::TooLarge`] for prefixes below [`MIN_PREFIX_LEN`].
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, RangeError> {
        if prefix_len > 32 {
            return Err(RangeError::InvalidPrefix {
                input: format!("{address}/{prefix_len}"),
            });
        }
        if prefix_len < MIN_PREFIX_LEN {
            return Err(RangeError::TooLarge { prefix_len });
        }
        let network = Ipv4Addr::from(u32::from(address) & mask(prefix_len));
        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// A single-address range.
    #[must_use]
    pub const fn single(address: Ipv4Addr) -> Self {
        Self {
            network: address,
            prefix_len: 32,
        }
    }

    /// Network address of the range.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length of the range.
    #[must_use]
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns `true` when `address` falls inside the range.
    #[must_use]
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & mask(self.prefix_len) == u32::from(self.network)
    }

    /// Host addresses to probe, in ascending order.
    ///
    /// Network and broadcast addresses are excluded except for /31 and /32,
    /// where every address is a host.
    #[must_use]
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        let first = u32::from(self.network);
        let last = first | !mask(self.prefix_len);
        if self.prefix_len >= 31 {
            return (first..=last).map(Ipv4Addr::from).collect();
        }
        (first.saturating_add(1)..last).map(Ipv4Addr::from).collect()
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for AddressRange {
    type Err = RangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let (address_text, prefix_text) = trimmed.split_once('/').unwrap_or((trimmed, "32"));
        let address =
            Ipv4Addr::from_str(address_text.trim()).map_err(|_| RangeError::InvalidAddress {
                input: trimmed.to_owned(),
            })?;
        let prefix_len =
            u8::from_str(prefix_text.trim()).map_err(|_| RangeError::InvalidPrefix {
                input: trimmed.to_owned(),
            })?;
        Self::new(address, prefix_len)
    }
}

const fn mask(prefix_len: u8) -> u32 {
    match u32::MAX.checked_shl(32 - prefix_len as u32) {
        Some(value) => value,
        None => 0,
    }
}
