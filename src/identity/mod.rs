//! Hardware-address resolution and device authorization.
//!
//! A reachable host is only eligible for bring-up once its hardware address
//! has been read from the neighbor table and matched against the operator's
//! allow-list or the built-in manufacturer table.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

mod address;
mod neighbor;
mod vendors;

pub use address::{AddressFormatError, HardwareAddress, OrganizationalPrefix};
pub use neighbor::{NeighborError, NeighborTable, PROC_ARP_PATH, ProcNeighborTable};
pub use vendors::{KNOWN_MANUFACTURERS, KnownManufacturer, known_vendor};

/// One operator-supplied allow-list entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllowEntry {
    /// Any device whose address starts with this prefix.
    Prefix(OrganizationalPrefix),
    /// Exactly this device.
    Exact(HardwareAddress),
}

impl AllowEntry {
    fn matches(&self, address: HardwareAddress) -> bool {
        match self {
            Self::Prefix(prefix) => address.prefix() == *prefix,
            Self::Exact(exact) => address == *exact,
        }
    }
}

impl fmt::Display for AllowEntry {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefix(prefix) => write!(formatter, "{prefix}"),
            Self::Exact(address) => write!(formatter, "{address}"),
        }
    }
}

impl FromStr for AllowEntry {
    type Err = AddressFormatError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if let Ok(address) = input.parse::<HardwareAddress>() {
            return Ok(Self::Exact(address));
        }
        input
            .parse::<OrganizationalPrefix>()
            .map(Self::Prefix)
            .map_err(|_| AddressFormatError {
                input: input.trim().to_owned(),
                expected: "organizational prefix or hardware address",
            })
    }
}

/// Why a verdict came out the way it did.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VerdictReason {
    /// Matched an operator allow-list entry.
    AllowListed,
    /// Matched the built-in manufacturer table.
    KnownManufacturer {
        /// Vendor owning the prefix.
        vendor: &'static str,
    },
    /// Validation is disabled; every well-formed address is accepted.
    ValidationDisabled,
    /// Well-formed but matched nothing.
    NotInAllowList,
    /// The resolved text is not a hardware address.
    InvalidFormat {
        /// Parse failure description.
        message: String,
    },
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllowListed => formatter.write_str("allow-listed"),
            Self::KnownManufacturer { vendor } => write!(formatter, "known manufacturer {vendor}"),
            Self::ValidationDisabled => formatter.write_str("validation disabled"),
            Self::NotInAllowList => formatter.write_str("not in allow-list"),
            Self::InvalidFormat { message } => write!(formatter, "format error: {message}"),
        }
    }
}

/// Outcome of authorizing one resolved hardware address.
///
/// Verdicts are created only by [`AuthorizationPolicy::authorize`] and are
/// read-only afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Verdict {
    hardware_address: String,
    parsed: Option<HardwareAddress>,
    authorized: bool,
    reason: VerdictReason,
}

impl Verdict {
    /// Hardware address in canonical form, or the raw text when it did not
    /// parse.
    #[must_use]
    pub fn hardware_address(&self) -> &str {
        &self.hardware_address
    }

    /// Parsed address, absent for format failures.
    #[must_use]
    pub const fn parsed_address(&self) -> Option<HardwareAddress> {
        self.parsed
    }

    /// Manufacturer prefix, absent for format failures.
    #[must_use]
    pub fn organizational_prefix(&self) -> Option<OrganizationalPrefix> {
        self.parsed.map(|address| address.prefix())
    }

    /// Whether the device may be orchestrated.
    #[must_use]
    pub const fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// Why the verdict was reached.
    #[must_use]
    pub const fn reason(&self) -> &VerdictReason {
        &self.reason
    }
}

/// Allow-list plus the validation escape hatch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthorizationPolicy {
    allowed: Vec<AllowEntry>,
    validation_disabled: bool,
}

impl AuthorizationPolicy {
    /// Creates a policy from operator allow-list entries.
    #[must_use]
    pub fn new(allowed: Vec<AllowEntry>) -> Self {
        Self {
            allowed,
            validation_disabled: false,
        }
    }

    /// Accepts every well-formed address. Intended for lab use only.
    #[must_use]
    pub const fn with_validation_disabled(mut self, disabled: bool) -> Self {
        self.validation_disabled = disabled;
        self
    }

    /// Whether the escape hatch is active.
    #[must_use]
    pub const fn validation_disabled(&self) -> bool {
        self.validation_disabled
    }

    /// Operator allow-list entries.
    #[must_use]
    pub fn allowed(&self) -> &[AllowEntry] {
        &self.allowed
    }

    /// Derives the verdict for resolved hardware-address text.
    ///
    /// Malformed text is always rejected, even with validation disabled,
    /// because the journal is keyed by the parsed address.
    #[must_use]
    pub fn authorize(&self, raw: &str) -> Verdict {
        let address = match raw.parse::<HardwareAddress>() {
            Ok(address) if !address.is_zero() => address,
            Ok(_) => {
                return Self::rejected(raw, String::from("all-zero hardware address"));
            }
            Err(err) => return Self::rejected(raw, err.to_string()),
        };

        let reason = if self.validation_disabled {
            tracing::warn!(
                hardware_address = %address,
                "hardware address validation is disabled; authorizing without checks"
            );
            VerdictReason::ValidationDisabled
        } else if self.allowed.iter().any(|entry| entry.matches(address)) {
            VerdictReason::AllowListed
        } else if let Some(vendor) = known_vendor(address.prefix()) {
            VerdictReason::KnownManufacturer { vendor }
        } else {
            VerdictReason::NotInAllowList
        };

        Verdict {
            hardware_address: address.to_string(),
            parsed: Some(address),
            authorized: reason != VerdictReason::NotInAllowList,
            reason,
        }
    }

    fn rejected(raw: &str, message: String) -> Verdict {
        Verdict {
            hardware_address: raw.trim().to_owned(),
            parsed: None,
            authorized: false,
            reason: VerdictReason::InvalidFormat { message },
        }
    }
}

/// Resolves hardware addresses and applies the authorization policy.
#[derive(Clone, Debug)]
pub struct IdentityResolver<N> {
    table: N,
    policy: AuthorizationPolicy,
}

impl<N: NeighborTable> IdentityResolver<N> {
    /// Creates a resolver over `table`.
    #[must_use]
    pub const fn new(table: N, policy: AuthorizationPolicy) -> Self {
        Self { table, policy }
    }

    /// Policy in force.
    #[must_use]
    pub const fn policy(&self) -> &AuthorizationPolicy {
        &self.policy
    }

    /// Looks `address` up in the neighbor table.
    ///
    /// Resolution fails softly: an unreadable table or a missing entry both
    /// yield `None`.
    pub fn resolve(&self, address: Ipv4Addr) -> Option<String> {
        match self.table.lookup(address) {
            Ok(Some(hardware)) => Some(hardware),
            Ok(None) => {
                tracing::debug!(%address, "no neighbor entry; skipping host");
                None
            }
            Err(err) => {
                tracing::warn!(%address, error = %err, "neighbor lookup failed");
                None
            }
        }
    }

    /// Authorizes resolved hardware-address text.
    #[must_use]
    pub fn authorize(&self, hardware_address: &str) -> Verdict {
        let verdict = self.policy.authorize(hardware_address);
        if verdict.is_authorized() {
            tracing::info!(
                hardware_address = verdict.hardware_address(),
                reason = %verdict.reason(),
                "device authorized"
            );
        } else {
            tracing::info!(
                hardware_address = verdict.hardware_address(),
                reason = %verdict.reason(),
                "device excluded"
            );
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticNeighborTable;
    use rstest::rstest;

    fn policy(entries: &[&str]) -> AuthorizationPolicy {
        let allowed = entries
            .iter()
            .map(|entry| entry.parse().expect("entry parses"))
            .collect();
        AuthorizationPolicy::new(allowed)
    }

    #[rstest]
    #[case("02:11:22:33:44:55")]
    #[case("02-11-22-aa-bb-cc")]
    fn allow_listed_prefix_authorizes(#[case] raw: &str) {
        let verdict = policy(&["02:11:22"]).authorize(raw);
        assert!(verdict.is_authorized());
        assert_eq!(verdict.reason(), &VerdictReason::AllowListed);
        assert_eq!(
            verdict.organizational_prefix().map(|p| p.to_string()).as_deref(),
            Some("02:11:22")
        );
    }

    #[test]
    fn exact_entry_matches_only_that_device() {
        let policy = policy(&["02:11:22:33:44:55"]);
        assert!(policy.authorize("02:11:22:33:44:55").is_authorized());
        assert!(!policy.authorize("02:11:22:33:44:56").is_authorized());
    }

    #[test]
    fn builtin_manufacturer_authorizes() {
        let verdict = AuthorizationPolicy::default().authorize("00:1e:42:01:02:03");
        assert!(verdict.is_authorized());
        assert_eq!(
            verdict.reason(),
            &VerdictReason::KnownManufacturer { vendor: "Teltonika" }
        );
    }

    #[test]
    fn unknown_prefix_is_not_in_allow_list() {
        let verdict = policy(&["02:11:22"]).authorize("0a:0b:0c:0d:0e:0f");
        assert!(!verdict.is_authorized());
        assert_eq!(verdict.reason(), &VerdictReason::NotInAllowList);
        assert_eq!(verdict.reason().to_string(), "not in allow-list");
    }

    #[rstest]
    #[case("garbage")]
    #[case("00:00:00:00:00:00")]
    #[case("02:11:22:33:44")]
    fn malformed_addresses_are_format_errors(#[case] raw: &str) {
        let verdict = AuthorizationPolicy::default()
            .with_validation_disabled(true)
            .authorize(raw);
        assert!(!verdict.is_authorized());
        assert!(matches!(verdict.reason(), VerdictReason::InvalidFormat { .. }));
        assert_eq!(verdict.parsed_address(), None);
    }

    #[test]
    fn disabled_validation_authorizes_anything_well_formed() {
        let verdict = AuthorizationPolicy::default()
            .with_validation_disabled(true)
            .authorize("0a:0b:0c:0d:0e:0f");
        assert!(verdict.is_authorized());
        assert_eq!(verdict.reason(), &VerdictReason::ValidationDisabled);
    }

    #[test]
    fn allow_entry_rejects_junk() {
        assert!("zz:zz:zz".parse::<AllowEntry>().is_err());
        assert!(matches!(
            "aa:bb:cc".parse::<AllowEntry>(),
            Ok(AllowEntry::Prefix(_))
        ));
    }

    #[test]
    fn resolver_reads_the_neighbor_table() {
        let target = Ipv4Addr::new(192, 168, 1, 1);
        let table = StaticNeighborTable::default().with_entry(target, "00:1e:42:aa:bb:cc");
        let resolver = IdentityResolver::new(table, AuthorizationPolicy::default());

        assert_eq!(resolver.resolve(target).as_deref(), Some("00:1e:42:aa:bb:cc"));
        assert_eq!(resolver.resolve(Ipv4Addr::new(192, 168, 1, 2)), None);
    }
}
