//! Configuration loading via `ortho-config`.
//!
//! Two structures share `bringup.toml`: [`BringupConfig`] (`BRINGUP_*`)
//! covers discovery, transport, journaling, and retry bounds, and
//! [`NetworkConfig`] (`BRINGUP_NET_*`) covers the role templates and
//! connectivity checks. Every conversion validates eagerly so a bad value
//! stops the process before any device is contacted.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::context::{RunMode, RunSettings};
use crate::discovery::{AddressRange, ProbeMethod};
use crate::identity::{AllowEntry, AuthorizationPolicy};
use crate::recovery::RecoveryPolicy;
use crate::role::{Role, RoleCommands, RoleError, RoleSettings, RoleTemplates};
use crate::session::Credentials;
use crate::stage::{CatalogDefaults, CatalogError, StageCatalog};

/// Name of the configuration file searched for by discovery.
pub const CONFIG_FILE_NAME: &str = "bringup.toml";

/// Discovery, transport, and retry settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BRINGUP",
    discovery(
        app_name = "bringup",
        env_var = "BRINGUP_CONFIG_PATH",
        config_file_name = "bringup.toml",
        dotfile_name = ".bringup.toml",
        project_file_name = "bringup.toml"
    )
)]
pub struct BringupConfig {
    /// Address range swept for devices, in CIDR notation.
    #[ortho_config(default = "192.168.1.0/24".to_owned())]
    pub scan_range: String,
    /// Remote login.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Remote password. When set, logins go through `sshpass`.
    pub ssh_password: Option<String>,
    /// Private key for remote logins. Supports tilde expansion.
    pub ssh_identity_file: Option<String>,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `sshpass` executable.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Timeout for establishing a session.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Default timeout for one stage command.
    #[ortho_config(default = 300)]
    pub command_timeout_secs: u64,
    /// Bound on connection attempts and transport retries.
    #[ortho_config(default = 3)]
    pub connect_attempts: u32,
    /// Reachability probe: `tcp` or `ping`.
    #[ortho_config(default = "tcp".to_owned())]
    pub probe_method: String,
    /// Port used by the TCP probe.
    #[ortho_config(default = 22)]
    pub probe_port: u16,
    /// Probes in flight during a sweep.
    #[ortho_config(default = 50)]
    pub probe_concurrency: usize,
    /// Per-probe timeout in milliseconds.
    #[ortho_config(default = 3000)]
    pub probe_timeout_ms: u64,
    /// Comma-separated organizational prefixes or full hardware addresses.
    pub allowed_prefixes: Option<String>,
    /// Authorize every device. Lab use only.
    #[ortho_config(default = false)]
    pub disable_mac_validation: bool,
    /// Directory holding checkpoint journals. Supports tilde expansion.
    #[ortho_config(default = "journals".to_owned())]
    pub journal_dir: String,
    /// Pause between cycles in continuous mode.
    #[ortho_config(default = 60)]
    pub scan_interval_secs: u64,
    /// Attempt bound for stages with a recovery action.
    #[ortho_config(default = 3)]
    pub recovery_attempts: u32,
    /// Pause after each recovery action.
    #[ortho_config(default = 10)]
    pub recovery_cooldown_secs: u64,
    /// Ceiling on waiting for a device after a network change.
    #[ortho_config(default = 180)]
    pub reachability_timeout_secs: u64,
    /// Delay between reachability probes while waiting.
    #[ortho_config(default = 5)]
    pub reachability_poll_secs: u64,
    /// TOML file overriding built-in stage scripts.
    pub stage_catalog: Option<String>,
    /// Comma-separated stage list replacing the preset pipeline.
    pub stages: Option<String>,
}

/// Role templates and connectivity check settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BRINGUP_NET",
    discovery(
        app_name = "bringup",
        env_var = "BRINGUP_CONFIG_PATH",
        config_file_name = "bringup.toml",
        dotfile_name = ".bringup.toml",
        project_file_name = "bringup.toml"
    )
)]
pub struct NetworkConfig {
    /// Port that carries the uplink in the forward role.
    #[ortho_config(default = "eth0".to_owned())]
    pub wan_binding: String,
    /// Port that carries the uplink in the reverse role.
    #[ortho_config(default = "eth1".to_owned())]
    pub lan_binding: String,
    /// Static downlink address.
    #[ortho_config(default = "192.168.1.1".to_owned())]
    pub lan_address: String,
    /// Static downlink netmask.
    #[ortho_config(default = "255.255.255.0".to_owned())]
    pub lan_netmask: String,
    /// Optional downlink gateway.
    pub lan_gateway: Option<String>,
    /// When set, the reverse uplink is cellular with this APN.
    pub cellular_apn: Option<String>,
    /// Modem control device for the cellular uplink.
    #[ortho_config(default = "/dev/cdc-wdm0".to_owned())]
    pub modem_binding: String,
    /// Host pinged by connectivity checks.
    #[ortho_config(default = "1.1.1.1".to_owned())]
    pub probe_host: String,
    /// Reply wait for the uplink verification ping.
    #[ortho_config(default = 5)]
    pub verify_timeout_secs: u64,
    /// Device command that reloads networking in place.
    #[ortho_config(default = "/etc/init.d/network reload".to_owned())]
    pub reload_command: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, value: &dyn std::fmt::Display, reason: &dyn std::fmt::Display) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {} '{value}': {reason}; fix {} or {} in {CONFIG_FILE_NAME}",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn require(&self, value: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(self.missing());
        }
        Ok(())
    }

    fn require_optional(&self, value: Option<&str>) -> Result<(), ConfigError> {
        value.map_or(Ok(()), |present| self.require(present))
    }

    fn positive<T>(&self, value: T) -> Result<(), ConfigError>
    where
        T: Copy + Default + PartialEq + std::fmt::Display,
    {
        if value == T::default() {
            return Err(self.invalid(&value, &"must be greater than zero"));
        }
        Ok(())
    }

    fn parse<T>(&self, value: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        value
            .trim()
            .parse()
            .map_err(|err| self.invalid(&value.trim(), &err))
    }
}

const SCAN_RANGE: FieldMetadata =
    FieldMetadata::new("scan range", "BRINGUP_SCAN_RANGE", "scan_range");
const SSH_USER: FieldMetadata = FieldMetadata::new("SSH user", "BRINGUP_SSH_USER", "ssh_user");
const SSH_PASSWORD: FieldMetadata =
    FieldMetadata::new("SSH password", "BRINGUP_SSH_PASSWORD", "ssh_password");
const SSH_IDENTITY_FILE: FieldMetadata = FieldMetadata::new(
    "SSH identity file",
    "BRINGUP_SSH_IDENTITY_FILE",
    "ssh_identity_file",
);
const SSH_BIN: FieldMetadata = FieldMetadata::new("ssh executable", "BRINGUP_SSH_BIN", "ssh_bin");
const SSHPASS_BIN: FieldMetadata =
    FieldMetadata::new("sshpass executable", "BRINGUP_SSHPASS_BIN", "sshpass_bin");
const CONNECT_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "connect timeout",
    "BRINGUP_CONNECT_TIMEOUT_SECS",
    "connect_timeout_secs",
);
const COMMAND_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "command timeout",
    "BRINGUP_COMMAND_TIMEOUT_SECS",
    "command_timeout_secs",
);
const CONNECT_ATTEMPTS: FieldMetadata = FieldMetadata::new(
    "connect attempt bound",
    "BRINGUP_CONNECT_ATTEMPTS",
    "connect_attempts",
);
const PROBE_METHOD: FieldMetadata =
    FieldMetadata::new("probe method", "BRINGUP_PROBE_METHOD", "probe_method");
const PROBE_CONCURRENCY: FieldMetadata = FieldMetadata::new(
    "probe concurrency",
    "BRINGUP_PROBE_CONCURRENCY",
    "probe_concurrency",
);
const PROBE_TIMEOUT: FieldMetadata =
    FieldMetadata::new("probe timeout", "BRINGUP_PROBE_TIMEOUT_MS", "probe_timeout_ms");
const ALLOWED_PREFIXES: FieldMetadata = FieldMetadata::new(
    "allow-list entry",
    "BRINGUP_ALLOWED_PREFIXES",
    "allowed_prefixes",
);
const JOURNAL_DIR: FieldMetadata =
    FieldMetadata::new("journal directory", "BRINGUP_JOURNAL_DIR", "journal_dir");
const RECOVERY_ATTEMPTS: FieldMetadata = FieldMetadata::new(
    "recovery attempt bound",
    "BRINGUP_RECOVERY_ATTEMPTS",
    "recovery_attempts",
);
const REACHABILITY_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "reachability timeout",
    "BRINGUP_REACHABILITY_TIMEOUT_SECS",
    "reachability_timeout_secs",
);
const REACHABILITY_POLL: FieldMetadata = FieldMetadata::new(
    "reachability poll interval",
    "BRINGUP_REACHABILITY_POLL_SECS",
    "reachability_poll_secs",
);
const STAGE_CATALOG: FieldMetadata =
    FieldMetadata::new("stage catalog", "BRINGUP_STAGE_CATALOG", "stage_catalog");
const STAGES: FieldMetadata = FieldMetadata::new("stage list", "BRINGUP_STAGES", "stages");

const WAN_BINDING: FieldMetadata =
    FieldMetadata::new("WAN port", "BRINGUP_NET_WAN_BINDING", "wan_binding");
const LAN_BINDING: FieldMetadata =
    FieldMetadata::new("LAN port", "BRINGUP_NET_LAN_BINDING", "lan_binding");
const LAN_ADDRESS: FieldMetadata =
    FieldMetadata::new("LAN address", "BRINGUP_NET_LAN_ADDRESS", "lan_address");
const LAN_NETMASK: FieldMetadata =
    FieldMetadata::new("LAN netmask", "BRINGUP_NET_LAN_NETMASK", "lan_netmask");
const LAN_GATEWAY: FieldMetadata =
    FieldMetadata::new("LAN gateway", "BRINGUP_NET_LAN_GATEWAY", "lan_gateway");
const CELLULAR_APN: FieldMetadata =
    FieldMetadata::new("cellular APN", "BRINGUP_NET_CELLULAR_APN", "cellular_apn");
const MODEM_BINDING: FieldMetadata =
    FieldMetadata::new("modem device", "BRINGUP_NET_MODEM_BINDING", "modem_binding");
const PROBE_HOST: FieldMetadata =
    FieldMetadata::new("probe host", "BRINGUP_NET_PROBE_HOST", "probe_host");
const VERIFY_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "verification timeout",
    "BRINGUP_NET_VERIFY_TIMEOUT_SECS",
    "verify_timeout_secs",
);
const RELOAD_COMMAND: FieldMetadata =
    FieldMetadata::new("reload command", "BRINGUP_NET_RELOAD_COMMAND", "reload_command");

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

fn policy(metadata: &FieldMetadata, attempts: u32, cooldown: Duration) -> Result<RecoveryPolicy, ConfigError> {
    RecoveryPolicy::new(attempts, cooldown).map_err(|err| metadata.invalid(&attempts, &err))
}

impl BringupConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("bringup")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs every conversion once so faults surface at start-up.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan_range()?;
        self.credentials()?;
        SSH_BIN.require(&self.ssh_bin)?;
        if self.ssh_password.is_some() {
            SSHPASS_BIN.require(&self.sshpass_bin)?;
        }
        CONNECT_TIMEOUT.positive(self.connect_timeout_secs)?;
        COMMAND_TIMEOUT.positive(self.command_timeout_secs)?;
        self.probe_method()?;
        PROBE_CONCURRENCY.positive(self.probe_concurrency)?;
        PROBE_TIMEOUT.positive(self.probe_timeout_ms)?;
        self.authorization_policy()?;
        JOURNAL_DIR.require(&self.journal_dir)?;
        self.recovery_policy()?;
        self.transport_policy()?;
        REACHABILITY_TIMEOUT.positive(self.reachability_timeout_secs)?;
        REACHABILITY_POLL.positive(self.reachability_poll_secs)?;
        STAGE_CATALOG.require_optional(self.stage_catalog.as_deref())?;
        self.stage_names()?;
        Ok(())
    }

    /// Parsed scan range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for malformed or oversized ranges.
    pub fn scan_range(&self) -> Result<AddressRange, ConfigError> {
        SCAN_RANGE.require(&self.scan_range)?;
        SCAN_RANGE.parse(&self.scan_range)
    }

    /// Login used for every session.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for blank values.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        SSH_USER.require(&self.ssh_user)?;
        SSH_PASSWORD.require_optional(self.ssh_password.as_deref())?;
        SSH_IDENTITY_FILE.require_optional(self.ssh_identity_file.as_deref())?;
        Ok(Credentials::new(self.ssh_user.trim())
            .with_password(self.ssh_password.clone())
            .with_identity_file(
                self.ssh_identity_file
                    .as_deref()
                    .map(|path| Utf8PathBuf::from(expand_tilde(path.trim()))),
            )
            .with_port(self.ssh_port))
    }

    /// Parsed probe strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown names.
    pub fn probe_method(&self) -> Result<ProbeMethod, ConfigError> {
        PROBE_METHOD.parse(&self.probe_method)
    }

    /// Per-probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Authorization policy built from the allow-list and escape hatch.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparsable entry.
    pub fn authorization_policy(&self) -> Result<AuthorizationPolicy, ConfigError> {
        let allowed = split_list(self.allowed_prefixes.as_deref().unwrap_or_default())
            .map(|entry| ALLOWED_PREFIXES.parse::<AllowEntry>(entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AuthorizationPolicy::new(allowed).with_validation_disabled(self.disable_mac_validation))
    }

    /// Journal directory with a leading `~/` expanded.
    #[must_use]
    pub fn journal_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(self.journal_dir.trim()))
    }

    /// Policy for stages that carry a recovery action.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero attempt bound.
    pub fn recovery_policy(&self) -> Result<RecoveryPolicy, ConfigError> {
        policy(
            &RECOVERY_ATTEMPTS,
            self.recovery_attempts,
            Duration::from_secs(self.recovery_cooldown_secs),
        )
    }

    /// Policy for connection attempts and transport retries.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero attempt bound.
    pub fn transport_policy(&self) -> Result<RecoveryPolicy, ConfigError> {
        policy(
            &CONNECT_ATTEMPTS,
            self.connect_attempts,
            Duration::from_secs(self.reachability_poll_secs),
        )
    }

    /// Explicit stage list, when configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the list is present but
    /// names no stage.
    pub fn stage_names(&self) -> Result<Option<Vec<String>>, ConfigError> {
        let Some(raw) = self.stages.as_deref() else {
            return Ok(None);
        };
        let names: Vec<String> = split_list(raw).map(str::to_owned).collect();
        if names.is_empty() {
            return Err(STAGES.missing());
        }
        Ok(Some(names))
    }

    /// Built-in catalog with any configured overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Catalog`] when the override file is unreadable
    /// or invalid.
    pub fn stage_catalog(&self, network: &NetworkConfig) -> Result<StageCatalog, ConfigError> {
        let catalog = StageCatalog::builtin(&CatalogDefaults {
            probe_host: network.probe_host.trim().to_owned(),
            reload_command: network.reload_command.trim().to_owned(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        });
        let Some(path) = self.stage_catalog.as_deref() else {
            return Ok(catalog);
        };
        let expanded = Utf8PathBuf::from(expand_tilde(path.trim()));
        Ok(catalog.load_overrides(&expanded)?)
    }

    /// Run settings for `role` in `mode`.
    #[must_use]
    pub const fn run_settings(&self, role: Role, mode: RunMode) -> RunSettings {
        RunSettings {
            role,
            mode,
            cycle_cooldown: Duration::from_secs(self.scan_interval_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reachability_timeout: Duration::from_secs(self.reachability_timeout_secs),
            reachability_poll: Duration::from_secs(self.reachability_poll_secs),
        }
    }
}

impl NetworkConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("bringup")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs every conversion once so faults surface at start-up.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.templates()?;
        PROBE_HOST.require(&self.probe_host)?;
        VERIFY_TIMEOUT.positive(self.verify_timeout_secs)?;
        RELOAD_COMMAND.require(&self.reload_command)?;
        Ok(())
    }

    /// Parsed interface settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for blank ports or unparsable addresses.
    pub fn role_settings(&self) -> Result<RoleSettings, ConfigError> {
        WAN_BINDING.require(&self.wan_binding)?;
        LAN_BINDING.require(&self.lan_binding)?;
        MODEM_BINDING.require(&self.modem_binding)?;
        CELLULAR_APN.require_optional(self.cellular_apn.as_deref())?;
        Ok(RoleSettings {
            wan_binding: self.wan_binding.trim().to_owned(),
            lan_binding: self.lan_binding.trim().to_owned(),
            lan_address: LAN_ADDRESS.parse::<Ipv4Addr>(&self.lan_address)?,
            lan_netmask: LAN_NETMASK.parse::<Ipv4Addr>(&self.lan_netmask)?,
            lan_gateway: self
                .lan_gateway
                .as_deref()
                .map(|gateway| LAN_GATEWAY.parse::<Ipv4Addr>(gateway))
                .transpose()?,
            cellular_apn: self.cellular_apn.as_deref().map(|apn| apn.trim().to_owned()),
            modem_binding: self.modem_binding.trim().to_owned(),
        })
    }

    /// Both role templates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Role`] when both uplinks share a port.
    pub fn templates(&self) -> Result<RoleTemplates, ConfigError> {
        Ok(RoleTemplates::new(&self.role_settings()?)?)
    }

    /// Device commands for the role stage.
    #[must_use]
    pub fn role_commands(&self, command_timeout: Duration) -> RoleCommands {
        RoleCommands {
            reload_command: self.reload_command.trim().to_owned(),
            probe_host: self.probe_host.trim().to_owned(),
            verify_timeout: Duration::from_secs(self.verify_timeout_secs),
            command_timeout,
        }
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// Paths are returned unchanged when `HOME` is unset.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// The role templates are inconsistent.
    #[error("invalid network roles: {0}; fix BRINGUP_NET_WAN_BINDING / BRINGUP_NET_LAN_BINDING in bringup.toml")]
    Role(#[from] RoleError),
    /// The stage catalog override is unusable.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
