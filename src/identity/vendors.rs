//! Built-in table of appliance manufacturers whose devices are always
//! eligible for bring-up.

use super::address::OrganizationalPrefix;

/// A manufacturer prefix and the vendor name reported in verdicts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KnownManufacturer {
    /// Organizational prefix assigned to the vendor.
    pub prefix: OrganizationalPrefix,
    /// Vendor name used in logs.
    pub vendor: &'static str,
}

/// Prefixes of the router families this tool targets.
pub const KNOWN_MANUFACTURERS: &[KnownManufacturer] = &[
    KnownManufacturer {
        prefix: OrganizationalPrefix::new([0x00, 0x1E, 0x42]),
        vendor: "Teltonika",
    },
    KnownManufacturer {
        prefix: OrganizationalPrefix::new([0x94, 0x83, 0xC4]),
        vendor: "GL.iNet",
    },
    KnownManufacturer {
        prefix: OrganizationalPrefix::new([0xE4, 0x95, 0x6E]),
        vendor: "GL.iNet",
    },
];

/// Looks up the vendor for `prefix` in [`KNOWN_MANUFACTURERS`].
#[must_use]
pub fn known_vendor(prefix: OrganizationalPrefix) -> Option<&'static str> {
    KNOWN_MANUFACTURERS
        .iter()
        .find(|entry| entry.prefix == prefix)
        .map(|entry| entry.vendor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_builtin_vendor() {
        let prefix: OrganizationalPrefix = "94:83:c4".parse().expect("prefix parses");
        assert_eq!(known_vendor(prefix), Some("GL.iNet"));
    }

    #[test]
    fn unknown_prefix_has_no_vendor() {
        let prefix: OrganizationalPrefix = "02:00:00".parse().expect("prefix parses");
        assert_eq!(known_vendor(prefix), None);
    }
}
