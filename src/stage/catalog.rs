//! Stage registry: built-in definitions plus operator overrides.
//!
//! Overrides are read from a TOML file of the form:
//!
//! ```toml
//! [stages.package-install]
//! estimated_secs = 120
//! timeout_secs = 600
//! steps = [
//!     { run = "opkg update", timeout_secs = 300 },
//!     { run = "rm -f /tmp/opkg-lists/*", required = false },
//!     { wait_secs = 5 },
//! ]
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Deserialize;
use shell_escape::unix::escape;
use thiserror::Error;

use super::{
    CommandPolicy, StageBody, StageCommand, StageDefinition, StageId, StageScript, StageStep,
};

/// Values the built-in scripts are rendered from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CatalogDefaults {
    /// Host pinged by the connectivity check.
    pub probe_host: String,
    /// Device command that reloads networking in place.
    pub reload_command: String,
    /// Per-command timeout for built-in commands.
    pub command_timeout: Duration,
}

impl Default for CatalogDefaults {
    fn default() -> Self {
        Self {
            probe_host: String::from("1.1.1.1"),
            reload_command: String::from("/etc/init.d/network reload"),
            command_timeout: Duration::from_secs(300),
        }
    }
}

/// Errors raised while loading stage overrides.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CatalogError {
    /// The override file could not be read.
    #[error("failed to read stage catalog {path}: {message}")]
    Io {
        /// Override file.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The override file is not valid TOML for the catalog schema.
    #[error("failed to parse stage catalog {path}: {message}")]
    Parse {
        /// Override file.
        path: Utf8PathBuf,
        /// Parser message.
        message: String,
    },
    /// An override names a stage that does not exist.
    #[error("stage catalog {path} names unknown stage '{name}'")]
    UnknownStage {
        /// Override file.
        path: Utf8PathBuf,
        /// Unrecognised name.
        name: String,
    },
    /// Steps were supplied for a stage that is not a command list.
    #[error("stage catalog {path} cannot replace the steps of {stage}; it is not a scripted stage")]
    NotScripted {
        /// Override file.
        path: Utf8PathBuf,
        /// Stage concerned.
        stage: StageId,
    },
    /// A stage was given no steps, a zero timeout, or a duration over
    /// [`MAX_DURATION_SECS`].
    #[error("stage catalog {path} defines {stage} with {problem}")]
    Invalid {
        /// Override file.
        path: Utf8PathBuf,
        /// Stage concerned.
        stage: StageId,
        /// What is wrong.
        problem: &'static str,
    },
}

/// Longest duration, in seconds, an override may set for a stage or step.
pub const MAX_DURATION_SECS: u64 = 86_400;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    stages: BTreeMap<String, StageSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageSpec {
    estimated_secs: Option<u64>,
    timeout_secs: Option<u64>,
    steps: Option<Vec<StepSpec>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StepSpec {
    Run {
        run: String,
        #[serde(default = "required_by_default")]
        required: bool,
        timeout_secs: Option<u64>,
    },
    Wait {
        wait_secs: u64,
    },
}

const fn required_by_default() -> bool {
    true
}

/// All stage definitions available to pipelines.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StageCatalog {
    definitions: BTreeMap<StageId, StageDefinition>,
    command_timeout: Duration,
}

impl StageCatalog {
    /// The built-in catalog for OpenWrt-family appliances.
    #[must_use]
    pub fn builtin(defaults: &CatalogDefaults) -> Self {
        let timeout = defaults.command_timeout;
        let probe_host = escape(defaults.probe_host.as_str().into());
        let required = |command: &str| StageStep::Run(StageCommand::required(command, timeout));
        let best_effort =
            |command: &str| StageStep::Run(StageCommand::best_effort(command, timeout));
        let install = |package: &str| {
            required(&format!(
                "opkg list-installed | grep -q '^{package} ' || opkg install {package}"
            ))
        };

        let scripted = |id, estimated_secs, timeout_secs, steps: Vec<StageStep>| StageDefinition {
            id,
            estimated_duration: Duration::from_secs(estimated_secs),
            timeout: Duration::from_secs(timeout_secs),
            body: StageBody::Script(StageScript::new(steps)),
            recovery: None,
            reconnect_after: false,
        };

        let definitions = [
            scripted(StageId::SystemPrep, 20, 300, vec![
                required(
                    "uci set system.@system[0].zonename='UTC' && \
                     uci set system.@system[0].timezone='UTC0' && uci commit system",
                ),
                required("mkdir -p /etc/bringup"),
                best_effort("rm -f /tmp/bringup.lock"),
                best_effort("/etc/init.d/sysntpd restart"),
            ]),
            StageDefinition {
                id: StageId::NetworkRole,
                estimated_duration: Duration::from_secs(60),
                timeout: Duration::from_secs(300),
                body: StageBody::RoleConfiguration,
                recovery: Some(StageId::NetworkReload),
                reconnect_after: true,
            },
            StageDefinition {
                recovery: Some(StageId::NetworkReload),
                ..scripted(StageId::InternetCheck, 15, 120, vec![required(&format!(
                    "ping -c 3 -W 5 {probe_host}"
                ))])
            },
            scripted(StageId::PackageInstall, 180, 1200, vec![
                required("opkg update"),
                install("ca-bundle"),
                install("curl"),
                install("kmod-tun"),
            ]),
            scripted(StageId::ContainerRuntime, 240, 1200, vec![
                install("dockerd"),
                install("docker"),
                required("/etc/init.d/dockerd enable"),
                best_effort("/etc/init.d/dockerd start"),
                required("docker info >/dev/null"),
            ]),
            scripted(StageId::ServiceDeploy, 120, 900, vec![
                required(
                    "docker network inspect bringup >/dev/null 2>&1 || \
                     docker network create bringup",
                ),
                best_effort("docker rm -f bringup-agent"),
                required(
                    "docker run -d --name bringup-agent --restart unless-stopped \
                     --network bringup bringup/agent:stable",
                ),
            ]),
            scripted(StageId::MeshJoin, 60, 600, vec![
                install("tailscale"),
                required("/etc/init.d/tailscale enable"),
                best_effort("/etc/init.d/tailscale start"),
                required("tailscale status >/dev/null 2>&1 || tailscale up --timeout=60s"),
            ]),
            scripted(StageId::Validate, 20, 180, vec![
                required("uci -q get network.wan.proto >/dev/null"),
                required("nslookup openwrt.org >/dev/null"),
                best_effort("docker ps --filter name=bringup-agent --format '{{.Names}}'"),
                best_effort("tailscale status"),
            ]),
            StageDefinition {
                reconnect_after: true,
                ..scripted(StageId::NetworkReload, 15, 120, vec![required(
                    &defaults.reload_command,
                )])
            },
        ];

        Self {
            definitions: definitions
                .into_iter()
                .map(|definition| (definition.id, definition))
                .collect(),
            command_timeout: timeout,
        }
    }

    /// A catalog with no definitions; pair with [`Self::with_definition`].
    #[must_use]
    pub fn empty(command_timeout: Duration) -> Self {
        Self {
            definitions: BTreeMap::new(),
            command_timeout,
        }
    }

    /// Adds or replaces one definition.
    #[must_use]
    pub fn with_definition(mut self, definition: StageDefinition) -> Self {
        self.definitions.insert(definition.id, definition);
        self
    }

    /// Looks up a definition.
    #[must_use]
    pub fn definition(&self, id: StageId) -> Option<&StageDefinition> {
        self.definitions.get(&id)
    }

    /// Definitions in identifier order.
    pub fn definitions(&self) -> impl Iterator<Item = &StageDefinition> {
        self.definitions.values()
    }

    /// Reads overrides from `path` and applies them.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the file cannot be read or names an
    /// invalid override.
    pub fn load_overrides(self, path: &Utf8Path) -> Result<Self, CatalogError> {
        let contents = read_catalog(path)?;
        self.apply_overrides(path, &contents)
    }

    /// Applies overrides from TOML text; `path` is used in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] for parse failures, unknown stages, step
    /// lists on non-scripted stages, empty step lists, zero timeouts, or
    /// durations over [`MAX_DURATION_SECS`].
    pub fn apply_overrides(mut self, path: &Utf8Path, contents: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(contents).map_err(|err| CatalogError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        for (name, spec) in file.stages {
            let id = name.parse::<StageId>().map_err(|_| CatalogError::UnknownStage {
                path: path.to_path_buf(),
                name: name.clone(),
            })?;
            let command_timeout = self.command_timeout;
            let Some(definition) = self.definitions.get_mut(&id) else {
                return Err(CatalogError::UnknownStage {
                    path: path.to_path_buf(),
                    name,
                });
            };
            let invalid = |problem| CatalogError::Invalid {
                path: path.to_path_buf(),
                stage: id,
                problem,
            };

            let too_long = spec
                .estimated_secs
                .into_iter()
                .chain(spec.timeout_secs)
                .chain(spec.steps.iter().flatten().filter_map(StepSpec::duration_secs))
                .any(|secs| secs > MAX_DURATION_SECS);
            if too_long {
                return Err(invalid("a duration longer than one day"));
            }

            if let Some(secs) = spec.estimated_secs {
                definition.estimated_duration = Duration::from_secs(secs);
            }
            if let Some(secs) = spec.timeout_secs {
                if secs == 0 {
                    return Err(invalid("a zero timeout"));
                }
                definition.timeout = Duration::from_secs(secs);
            }
            if let Some(steps) = spec.steps {
                if !matches!(definition.body, StageBody::Script(_)) {
                    return Err(CatalogError::NotScripted {
                        path: path.to_path_buf(),
                        stage: id,
                    });
                }
                if steps.is_empty() {
                    return Err(invalid("no steps"));
                }
                definition.body = StageBody::Script(StageScript::new(
                    steps
                        .into_iter()
                        .map(|step| step.into_step(command_timeout))
                        .collect(),
                ));
            }
            tracing::debug!(stage = %id, "applied stage override");
        }
        Ok(self)
    }
}

impl StepSpec {
    const fn duration_secs(&self) -> Option<u64> {
        match self {
            Self::Run { timeout_secs, .. } => *timeout_secs,
            Self::Wait { wait_secs } => Some(*wait_secs),
        }
    }

    fn into_step(self, default_timeout: Duration) -> StageStep {
        match self {
            Self::Run {
                run,
                required,
                timeout_secs,
            } => StageStep::Run(StageCommand {
                command: run,
                policy: if required {
                    CommandPolicy::Required
                } else {
                    CommandPolicy::BestEffort
                },
                timeout: timeout_secs.map_or(default_timeout, Duration::from_secs),
            }),
            Self::Wait { wait_secs } => StageStep::Wait(Duration::from_secs(wait_secs)),
        }
    }
}

fn read_catalog(path: &Utf8Path) -> Result<String, CatalogError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| CatalogError::Io {
        path: path.to_path_buf(),
        message: String::from("path is missing a file name"),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| CatalogError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;
    dir.read_to_string(file_name)
        .map_err(|err| CatalogError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn catalog() -> StageCatalog {
        StageCatalog::builtin(&CatalogDefaults::default())
    }

    fn path() -> &'static Utf8Path {
        Utf8Path::new("stages.toml")
    }

    fn script(catalog: &StageCatalog, id: StageId) -> Vec<StageStep> {
        match catalog.definition(id).map(|definition| &definition.body) {
            Some(StageBody::Script(script)) => script.steps().to_vec(),
            other => panic!("{id} is not scripted: {other:?}"),
        }
    }

    #[rstest]
    fn builtin_defines_every_stage(catalog: StageCatalog) {
        for id in StageId::ALL {
            assert!(catalog.definition(id).is_some(), "{id} missing");
        }
    }

    #[rstest]
    fn connectivity_stages_recover_with_network_reload(catalog: StageCatalog) {
        for id in [StageId::NetworkRole, StageId::InternetCheck] {
            let recovery = catalog.definition(id).and_then(|d| d.recovery);
            assert_eq!(recovery, Some(StageId::NetworkReload));
        }
        let reload = catalog.definition(StageId::NetworkReload);
        assert!(reload.is_some_and(|d| d.reconnect_after));
    }

    #[test]
    fn builtin_uses_configured_reload_and_probe_host() {
        let defaults = CatalogDefaults {
            probe_host: String::from("9.9.9.9"),
            reload_command: String::from("service network restart"),
            ..CatalogDefaults::default()
        };
        let catalog = StageCatalog::builtin(&defaults);

        let check = script(&catalog, StageId::InternetCheck);
        assert!(matches!(
            check.as_slice(),
            [StageStep::Run(command)] if command.command == "ping -c 3 -W 5 9.9.9.9"
        ));
        let reload = script(&catalog, StageId::NetworkReload);
        assert!(matches!(
            reload.as_slice(),
            [StageStep::Run(command)] if command.command == "service network restart"
        ));
    }

    #[rstest]
    fn overrides_replace_steps_and_timings(catalog: StageCatalog) {
        let toml = r#"
            [stages.package-install]
            estimated_secs = 5
            timeout_secs = 60
            steps = [
                { run = "opkg update", timeout_secs = 30 },
                { run = "rm -f /tmp/stale", required = false },
                { wait_secs = 2 },
            ]
        "#;
        let overridden = catalog
            .apply_overrides(path(), toml)
            .expect("overrides apply");

        let definition = overridden
            .definition(StageId::PackageInstall)
            .expect("defined");
        assert_eq!(definition.estimated_duration, Duration::from_secs(5));
        assert_eq!(definition.timeout, Duration::from_secs(60));
        assert_eq!(
            script(&overridden, StageId::PackageInstall),
            vec![
                StageStep::Run(StageCommand::required("opkg update", Duration::from_secs(30))),
                StageStep::Run(StageCommand::best_effort(
                    "rm -f /tmp/stale",
                    Duration::from_secs(300)
                )),
                StageStep::Wait(Duration::from_secs(2)),
            ]
        );
    }

    #[rstest]
    fn unknown_stage_names_are_rejected(catalog: StageCatalog) {
        let result = catalog.apply_overrides(path(), "[stages.reboot]\nsteps = [{ run = \"reboot\" }]");
        assert!(matches!(result, Err(CatalogError::UnknownStage { name, .. }) if name == "reboot"));
    }

    #[rstest]
    fn role_stage_steps_cannot_be_replaced(catalog: StageCatalog) {
        let result =
            catalog.apply_overrides(path(), "[stages.network-role]\nsteps = [{ run = \"true\" }]");
        assert!(matches!(
            result,
            Err(CatalogError::NotScripted { stage: StageId::NetworkRole, .. })
        ));
    }

    #[rstest]
    fn role_stage_timing_can_be_tuned(catalog: StageCatalog) {
        let tuned = catalog
            .apply_overrides(path(), "[stages.network-role]\ntimeout_secs = 600")
            .expect("timing override applies");
        let timeout = tuned.definition(StageId::NetworkRole).map(|d| d.timeout);
        assert_eq!(timeout, Some(Duration::from_secs(600)));
    }

    #[rstest]
    #[case("[stages.validate]\nsteps = []")]
    #[case("[stages.validate]\ntimeout_secs = 0")]
    #[case("[stages.validate]\ntimeout_secs = 18446744073709551615")]
    #[case("[stages.network-role]\ntimeout_secs = 86401")]
    #[case("[stages.validate]\nsteps = [{ run = \"true\", timeout_secs = 18446744073709551615 }]")]
    #[case("[stages.validate]\nsteps = [{ wait_secs = 18446744073709551615 }]")]
    #[case("[stages.validate]\nestimated_secs = 18446744073709551615")]
    fn degenerate_overrides_are_rejected(catalog: StageCatalog, #[case] toml: &str) {
        let result = catalog.apply_overrides(path(), toml);
        assert!(matches!(result, Err(CatalogError::Invalid { .. })), "{result:?}");
    }

    #[rstest]
    fn malformed_toml_is_a_parse_error(catalog: StageCatalog) {
        let result = catalog.apply_overrides(path(), "[stages.validate\n");
        assert!(matches!(result, Err(CatalogError::Parse { .. })));
    }

    #[test]
    fn overrides_load_from_disk() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let file = Utf8PathBuf::from_path_buf(tmp.path().join("stages.toml"))
            .unwrap_or_else(|p| panic!("utf8 path: {}", p.display()));
        std::fs::write(&file, "[stages.mesh-join]\nestimated_secs = 1\n").expect("write");

        let catalog = StageCatalog::builtin(&CatalogDefaults::default())
            .load_overrides(&file)
            .expect("loads");
        let estimate = catalog
            .definition(StageId::MeshJoin)
            .map(|d| d.estimated_duration);
        assert_eq!(estimate, Some(Duration::from_secs(1)));
    }
}
