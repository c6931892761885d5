//! Forward/Reverse network roles and the configurator that applies them.
//!
//! A role is a complete assignment for exactly two logical interfaces: the
//! uplink (`wan`) and the downlink (`lan`). Both assignments are built in
//! memory when the configurator is constructed. Applying a role replaces
//! both sections in one committed batch and then reloads networking in place;
//! there is no partial merge and no direct Forward-to-Reverse patch.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shell_escape::unix::escape;
use thiserror::Error;

use crate::session::{RemoteSession, SessionError};
use crate::stage::StageOutcome;

mod uci;

/// Which physical port carries the uplink.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Uplink on the WAN port, downlink on the LAN port.
    #[default]
    Forward,
    /// Uplink on the LAN port (or cellular modem), downlink on the WAN port.
    Reverse,
}

impl Role {
    /// Lower-case role name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Raised for an unrecognised role name.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown role '{0}' (expected 'forward' or 'reverse')")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(Self::Forward),
            "reverse" => Ok(Self::Reverse),
            other => Err(UnknownRole(other.to_owned())),
        }
    }
}

/// Addressing for one interface.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InterfaceProtocol {
    /// Address obtained dynamically.
    Dhcp,
    /// Fixed address.
    Static {
        /// Interface address.
        address: Ipv4Addr,
        /// Subnet mask.
        netmask: Ipv4Addr,
        /// Default gateway, if any.
        gateway: Option<Ipv4Addr>,
    },
    /// Cellular data session through a QMI modem.
    Cellular {
        /// Access point name.
        apn: String,
    },
}

/// One logical interface bound to a physical port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InterfaceAssignment {
    /// UCI section name (`wan` or `lan`).
    pub section: &'static str,
    /// Physical device the section binds to.
    pub binding: String,
    /// Addressing mode.
    pub protocol: InterfaceProtocol,
}

/// Complete two-interface assignment for one role.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoleConfiguration {
    /// Role this configuration implements.
    pub role: Role,
    /// Interface facing the internet.
    pub uplink: InterfaceAssignment,
    /// Interface facing local clients.
    pub downlink: InterfaceAssignment,
}

impl RoleConfiguration {
    /// Every option this configuration writes, keyed
    /// `network.<section>[.<option>]`. After a successful apply the device's
    /// managed sections hold exactly these entries.
    #[must_use]
    pub fn entries(&self) -> BTreeMap<String, String> {
        uci::entries(self)
    }

    /// Device command that replaces both managed sections and commits once.
    #[must_use]
    pub fn batch_command(&self) -> String {
        uci::render_batch(self)
    }
}

/// Physical ports and addressing the role templates are built from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoleSettings {
    /// Port labelled WAN.
    pub wan_binding: String,
    /// Port labelled LAN.
    pub lan_binding: String,
    /// Downlink address.
    pub lan_address: Ipv4Addr,
    /// Downlink mask.
    pub lan_netmask: Ipv4Addr,
    /// Downlink gateway.
    pub lan_gateway: Option<Ipv4Addr>,
    /// When set, the Reverse uplink is cellular.
    pub cellular_apn: Option<String>,
    /// Modem control device used for cellular uplinks.
    pub modem_binding: String,
}

impl Default for RoleSettings {
    fn default() -> Self {
        Self {
            wan_binding: String::from("eth0"),
            lan_binding: String::from("eth1"),
            lan_address: Ipv4Addr::new(192, 168, 1, 1),
            lan_netmask: Ipv4Addr::new(255, 255, 255, 0),
            lan_gateway: None,
            cellular_apn: None,
            modem_binding: String::from("/dev/cdc-wdm0"),
        }
    }
}

/// Errors raised while building role templates.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RoleError {
    /// A port name is blank.
    #[error("{field} must not be empty")]
    EmptyBinding {
        /// Offending setting.
        field: &'static str,
    },
    /// Both roles would put the uplink on the same port.
    #[error("forward and reverse roles both use {binding} for the uplink")]
    SharedUplink {
        /// Port used by both uplinks.
        binding: String,
    },
}

/// Prebuilt configurations for both roles.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoleTemplates {
    forward: RoleConfiguration,
    reverse: RoleConfiguration,
}

impl RoleTemplates {
    /// Builds both role configurations.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::EmptyBinding`] for blank port names and
    /// [`RoleError::SharedUplink`] when both uplinks land on one port.
    pub fn new(settings: &RoleSettings) -> Result<Self, RoleError> {
        for (field, value) in [
            ("wan_binding", &settings.wan_binding),
            ("lan_binding", &settings.lan_binding),
            ("modem_binding", &settings.modem_binding),
        ] {
            if value.trim().is_empty() {
                return Err(RoleError::EmptyBinding { field });
            }
        }

        let downlink = |binding: &str| InterfaceAssignment {
            section: "lan",
            binding: binding.to_owned(),
            protocol: InterfaceProtocol::Static {
                address: settings.lan_address,
                netmask: settings.lan_netmask,
                gateway: settings.lan_gateway,
            },
        };

        let forward = RoleConfiguration {
            role: Role::Forward,
            uplink: InterfaceAssignment {
                section: "wan",
                binding: settings.wan_binding.clone(),
                protocol: InterfaceProtocol::Dhcp,
            },
            downlink: downlink(&settings.lan_binding),
        };
        let reverse_uplink = match &settings.cellular_apn {
            Some(apn) => InterfaceAssignment {
                section: "wan",
                binding: settings.modem_binding.clone(),
                protocol: InterfaceProtocol::Cellular { apn: apn.clone() },
            },
            None => InterfaceAssignment {
                section: "wan",
                binding: settings.lan_binding.clone(),
                protocol: InterfaceProtocol::Dhcp,
            },
        };
        let reverse = RoleConfiguration {
            role: Role::Reverse,
            uplink: reverse_uplink,
            downlink: downlink(&settings.wan_binding),
        };

        if forward.uplink.binding == reverse.uplink.binding {
            return Err(RoleError::SharedUplink {
                binding: forward.uplink.binding,
            });
        }
        Ok(Self { forward, reverse })
    }

    /// Configuration for `role`.
    #[must_use]
    pub const fn configuration(&self, role: Role) -> &RoleConfiguration {
        match role {
            Role::Forward => &self.forward,
            Role::Reverse => &self.reverse,
        }
    }
}

/// Device-side commands and timings used when applying and verifying roles.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoleCommands {
    /// Reloads networking in place.
    pub reload_command: String,
    /// Host pinged through the uplink to prove the role settled.
    pub probe_host: String,
    /// Wait for a single verification reply.
    pub verify_timeout: Duration,
    /// Timeout for the batch and reload commands.
    pub command_timeout: Duration,
}

impl Default for RoleCommands {
    fn default() -> Self {
        Self {
            reload_command: String::from("/etc/init.d/network reload"),
            probe_host: String::from("1.1.1.1"),
            verify_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Applies and verifies network roles over a session.
#[derive(Clone, Debug)]
pub struct NetworkRoleConfigurator {
    templates: RoleTemplates,
    commands: RoleCommands,
}

impl NetworkRoleConfigurator {
    /// Creates a configurator.
    #[must_use]
    pub const fn new(templates: RoleTemplates, commands: RoleCommands) -> Self {
        Self {
            templates,
            commands,
        }
    }

    /// Configuration for `role`.
    #[must_use]
    pub const fn configuration(&self, role: Role) -> &RoleConfiguration {
        self.templates.configuration(role)
    }

    /// Pushes the full configuration for `role`, commits it, and reloads
    /// networking. The session may drop during the reload; callers must
    /// reconnect before using it again.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] for transport faults before the reload is
    /// issued. A dropped channel during the reload itself is expected and
    /// not an error.
    pub async fn apply<S: RemoteSession>(
        &self,
        session: &mut S,
        role: Role,
    ) -> Result<StageOutcome, SessionError> {
        let configuration = self.configuration(role);
        tracing::info!(
            %role,
            uplink = %configuration.uplink.binding,
            downlink = %configuration.downlink.binding,
            "applying network role"
        );

        let batch = session
            .run(&configuration.batch_command(), self.commands.command_timeout)
            .await?;
        if !batch.is_success() {
            return Ok(StageOutcome::failed(format!(
                "uci batch for {role} role exited with {:?}: {}",
                batch.code,
                batch.stderr.trim()
            )));
        }

        match session
            .run(&self.commands.reload_command, self.commands.command_timeout)
            .await
        {
            Ok(output) if output.is_success() => {}
            Ok(output) => {
                return Ok(StageOutcome::failed(format!(
                    "network reload exited with {:?}: {}",
                    output.code,
                    output.stderr.trim()
                )));
            }
            Err(err @ (SessionError::Channel { .. } | SessionError::Timeout { .. })) => {
                tracing::debug!(error = %err, "session dropped during network reload");
            }
            Err(err) => return Err(err),
        }
        Ok(StageOutcome::succeeded(format!("{role} role committed")))
    }

    /// Checks that the uplink for `role` reaches the probe host.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] for transport faults.
    pub async fn verify<S: RemoteSession>(
        &self,
        session: &mut S,
        role: Role,
    ) -> Result<StageOutcome, SessionError> {
        let command = self.verify_command(role);
        let output = session
            .run(&command, self.commands.verify_timeout + Duration::from_secs(5))
            .await?;
        if output.is_success() {
            Ok(StageOutcome::succeeded(format!("{role} uplink reaches {}", self.commands.probe_host)))
        } else {
            Ok(StageOutcome::failed(format!(
                "{role} uplink cannot reach {}",
                self.commands.probe_host
            )))
        }
    }

    /// Device command used by [`Self::verify`].
    #[must_use]
    pub fn verify_command(&self, role: Role) -> String {
        let uplink = &self.configuration(role).uplink;
        let wait = self.commands.verify_timeout.as_secs().max(1);
        let host = escape(self.commands.probe_host.as_str().into());
        match uplink.protocol {
            InterfaceProtocol::Cellular { .. } => format!("ping -c 1 -W {wait} {host}"),
            InterfaceProtocol::Dhcp | InterfaceProtocol::Static { .. } => {
                let binding = escape(uplink.binding.as_str().into());
                format!("ping -c 1 -W {wait} -I {binding} {host}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedDevice;
    use rstest::{fixture, rstest};

    #[fixture]
    fn configurator() -> NetworkRoleConfigurator {
        let templates = RoleTemplates::new(&RoleSettings::default()).expect("templates build");
        NetworkRoleConfigurator::new(templates, RoleCommands::default())
    }

    fn device() -> ScriptedDevice {
        ScriptedDevice::new(Ipv4Addr::new(192, 168, 1, 1))
    }

    #[test]
    fn forward_uses_wan_port_for_dhcp_uplink() {
        let templates = RoleTemplates::new(&RoleSettings::default()).expect("templates build");
        let forward = templates.configuration(Role::Forward);
        assert_eq!(forward.uplink.binding, "eth0");
        assert_eq!(forward.uplink.protocol, InterfaceProtocol::Dhcp);
        assert_eq!(forward.downlink.binding, "eth1");
        assert_eq!(
            forward.downlink.protocol,
            InterfaceProtocol::Static {
                address: Ipv4Addr::new(192, 168, 1, 1),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: None,
            }
        );
    }

    #[test]
    fn reverse_swaps_ports() {
        let templates = RoleTemplates::new(&RoleSettings::default()).expect("templates build");
        let reverse = templates.configuration(Role::Reverse);
        assert_eq!(reverse.uplink.binding, "eth1");
        assert_eq!(reverse.downlink.binding, "eth0");
    }

    #[test]
    fn cellular_reverse_uplink_uses_modem() {
        let settings = RoleSettings {
            cellular_apn: Some(String::from("internet")),
            ..RoleSettings::default()
        };
        let templates = RoleTemplates::new(&settings).expect("templates build");
        let entries = templates.configuration(Role::Reverse).entries();
        assert_eq!(entries.get("network.wan.proto").map(String::as_str), Some("qmi"));
        assert_eq!(
            entries.get("network.wan.device").map(String::as_str),
            Some("/dev/cdc-wdm0")
        );
        assert_eq!(entries.get("network.wan.apn").map(String::as_str), Some("internet"));
    }

    #[test]
    fn shared_uplink_is_rejected() {
        let settings = RoleSettings {
            wan_binding: String::from("eth0"),
            lan_binding: String::from("eth0"),
            ..RoleSettings::default()
        };
        assert_eq!(
            RoleTemplates::new(&settings),
            Err(RoleError::SharedUplink {
                binding: String::from("eth0")
            })
        );
    }

    #[test]
    fn blank_bindings_are_rejected() {
        let settings = RoleSettings {
            lan_binding: String::from(" "),
            ..RoleSettings::default()
        };
        assert_eq!(
            RoleTemplates::new(&settings),
            Err(RoleError::EmptyBinding {
                field: "lan_binding"
            })
        );
    }

    #[rstest]
    fn batch_replaces_both_sections_and_commits_once(configurator: NetworkRoleConfigurator) {
        let batch = configurator.configuration(Role::Forward).batch_command();
        let lines: Vec<&str> = batch.lines().collect();
        assert_eq!(lines.first(), Some(&"uci -q batch <<'EOF'"));
        assert_eq!(lines.get(1), Some(&"delete network.wan"));
        assert_eq!(lines.get(2), Some(&"delete network.lan"));
        assert!(lines.contains(&"set network.wan.proto='dhcp'"));
        assert!(lines.contains(&"set network.lan.ipaddr='192.168.1.1'"));
        assert_eq!(lines.iter().filter(|line| line.starts_with("commit")).count(), 1);
        assert_eq!(lines.last(), Some(&"EOF"));
    }

    #[rstest]
    #[tokio::test]
    async fn switching_roles_is_a_full_replacement(configurator: NetworkRoleConfigurator) {
        let device = device();
        device.seed_config("network.wan.metric", "10");
        let mut session = device.session();

        let forward = configurator
            .apply(&mut session, Role::Forward)
            .await
            .expect("forward applies");
        assert!(forward.success);
        assert_eq!(
            device.config_snapshot(),
            configurator.configuration(Role::Forward).entries()
        );

        let reverse = configurator
            .apply(&mut session, Role::Reverse)
            .await
            .expect("reverse applies");
        assert!(reverse.success);
        assert_eq!(
            device.config_snapshot(),
            configurator.configuration(Role::Reverse).entries()
        );
    }

    #[rstest]
    #[tokio::test]
    async fn reload_channel_drop_is_expected(configurator: NetworkRoleConfigurator) {
        let device = device();
        device.drop_channel_next("/etc/init.d/network reload", 1);
        let mut session = device.session();

        let outcome = configurator
            .apply(&mut session, Role::Forward)
            .await
            .expect("apply tolerates reload drop");
        assert!(outcome.success);
    }

    #[rstest]
    #[tokio::test]
    async fn failed_batch_fails_without_reload(configurator: NetworkRoleConfigurator) {
        let device = device();
        device.fail_next("uci -q batch", 1);
        let mut session = device.session();

        let outcome = configurator
            .apply(&mut session, Role::Forward)
            .await
            .expect("apply runs");
        assert!(!outcome.success);
        assert_eq!(device.count_matching("network reload"), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn verify_pings_through_the_uplink(configurator: NetworkRoleConfigurator) {
        let device = device();
        device.fail_next("-I eth1", 1);
        let mut session = device.session();

        let forward = configurator
            .verify(&mut session, Role::Forward)
            .await
            .expect("verify runs");
        let reverse = configurator
            .verify(&mut session, Role::Reverse)
            .await
            .expect("verify runs");

        assert!(forward.success);
        assert!(!reverse.success);
        assert_eq!(
            device.commands(),
            vec![
                "ping -c 1 -W 5 -I eth0 1.1.1.1",
                "ping -c 1 -W 5 -I eth1 1.1.1.1"
            ]
        );
    }
}
