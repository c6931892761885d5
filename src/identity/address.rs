//! Hardware (MAC) addresses and their organizational prefixes.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Raised when text is not a six-octet hardware address or three-octet prefix.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("'{input}' is not a valid {expected}")]
pub struct AddressFormatError {
    /// Text that failed to parse.
    pub input: String,
    /// What the text was expected to be.
    pub expected: &'static str,
}

/// First three octets of a hardware address, identifying the manufacturer.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OrganizationalPrefix([u8; 3]);

impl OrganizationalPrefix {
    /// Builds a prefix from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 3]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for OrganizationalPrefix {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(formatter, "{a:02X}:{b:02X}:{c:02X}")
    }
}

impl FromStr for OrganizationalPrefix {
    type Err = AddressFormatError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parse_octets::<3>(input)
            .map(Self)
            .ok_or_else(|| AddressFormatError {
                input: input.trim().to_owned(),
                expected: "organizational prefix",
            })
    }
}

/// A six-octet hardware address.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    /// Builds an address from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The manufacturer prefix (first three octets).
    #[must_use]
    pub const fn prefix(&self) -> OrganizationalPrefix {
        let [a, b, c, ..] = self.0;
        OrganizationalPrefix([a, b, c])
    }

    /// Returns `true` for `00:00:00:00:00:00`.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|octet| *octet == 0)
    }

    /// Filesystem-safe rendering, e.g. `AA-BB-CC-DD-EE-FF`.
    #[must_use]
    pub fn file_stem(&self) -> String {
        self.to_string().replace(':', "-")
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, f] = self.0;
        write!(
            formatter,
            "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{f:02X}"
        )
    }
}

impl FromStr for HardwareAddress {
    type Err = AddressFormatError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        parse_octets::<6>(input)
            .map(Self)
            .ok_or_else(|| AddressFormatError {
                input: input.trim().to_owned(),
                expected: "hardware address",
            })
    }
}

/// Parses `N` hex octets separated by `:` or `-` (one separator style per
/// input).
fn parse_octets<const N: usize>(input: &str) -> Option<[u8; N]> {
    let trimmed = input.trim();
    let separator = if trimmed.contains('-') { '-' } else { ':' };
    let mut octets = [0_u8; N];
    let mut parts = trimmed.split(separator);
    for slot in &mut octets {
        let part = parts.next()?;
        if part.len() != 2 || !part.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}
