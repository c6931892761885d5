//! Rendering role configurations as UCI batch input.

use std::collections::BTreeMap;

use super::{InterfaceAssignment, InterfaceProtocol, RoleConfiguration};

/// UCI package holding interface sections.
const PACKAGE: &str = "network";

/// Logical sections replaced by every role change.
pub(super) const MANAGED_SECTIONS: [&str; 2] = ["wan", "lan"];

/// Full option set for one configuration, keyed `network.<section>[.<option>]`.
pub(super) fn entries(configuration: &RoleConfiguration) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for assignment in [&configuration.uplink, &configuration.downlink] {
        let section = format!("{PACKAGE}.{}", assignment.section);
        for (option, value) in options(assignment) {
            entries.insert(format!("{section}.{option}"), value);
        }
        entries.insert(section, String::from("interface"));
    }
    entries
}

/// One `uci batch` invocation that deletes both managed sections, sets every
/// option, and commits once.
pub(super) fn render_batch(configuration: &RoleConfiguration) -> String {
    let mut script = String::from("uci -q batch <<'EOF'\n");
    for section in MANAGED_SECTIONS {
        script.push_str(&format!("delete {PACKAGE}.{section}\n"));
    }
    for assignment in [&configuration.uplink, &configuration.downlink] {
        let section = format!("{PACKAGE}.{}", assignment.section);
        script.push_str(&format!("set {section}=interface\n"));
        for (option, value) in options(assignment) {
            script.push_str(&format!("set {section}.{option}={}\n", quote(&value)));
        }
    }
    script.push_str(&format!("commit {PACKAGE}\nEOF"));
    script
}

fn options(assignment: &InterfaceAssignment) -> Vec<(&'static str, String)> {
    let mut options = vec![("device", assignment.binding.clone())];
    match &assignment.protocol {
        InterfaceProtocol::Dhcp => options.push(("proto", String::from("dhcp"))),
        InterfaceProtocol::Static {
            address,
            netmask,
            gateway,
        } => {
            options.push(("proto", String::from("static")));
            options.push(("ipaddr", address.to_string()));
            options.push(("netmask", netmask.to_string()));
            if let Some(gateway) = gateway {
                options.push(("gateway", gateway.to_string()));
            }
        }
        InterfaceProtocol::Cellular { apn } => {
            options.push(("proto", String::from("qmi")));
            options.push(("apn", apn.clone()));
            options.push(("pdptype", String::from("ipv4")));
        }
    }
    options
}

/// Single-quotes a UCI value.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
