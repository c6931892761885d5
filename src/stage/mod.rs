//! Stage identifiers, definitions, and pipelines.
//!
//! Stages form a closed set. Every identifier is resolved against the
//! [`StageCatalog`] when a [`Pipeline`] is built, so a pipeline that names an
//! unknown or recovery-only stage is rejected before any device is touched.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod catalog;
mod executor;

pub use catalog::{CatalogDefaults, CatalogError, MAX_DURATION_SECS, StageCatalog};
pub use executor::{ExecutionError, StageExecutor, StageOutcome};

/// Identifier of one stage. Stable across runs; recorded in journals.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    /// Baseline system settings.
    SystemPrep,
    /// Apply the selected network role.
    NetworkRole,
    /// Confirm the device reaches the internet.
    InternetCheck,
    /// Install base packages.
    PackageInstall,
    /// Install and start the container runtime.
    ContainerRuntime,
    /// Deploy the service containers.
    ServiceDeploy,
    /// Join the mesh VPN.
    MeshJoin,
    /// Final health checks.
    Validate,
    /// Reload the network subsystem. Recovery action only.
    NetworkReload,
}

impl StageId {
    /// Every identifier, in default pipeline order with recovery stages last.
    pub const ALL: [Self; 9] = [
        Self::SystemPrep,
        Self::NetworkRole,
        Self::InternetCheck,
        Self::PackageInstall,
        Self::ContainerRuntime,
        Self::ServiceDeploy,
        Self::MeshJoin,
        Self::Validate,
        Self::NetworkReload,
    ];

    /// Kebab-case name used in configuration, logs, and journals.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SystemPrep => "system-prep",
            Self::NetworkRole => "network-role",
            Self::InternetCheck => "internet-check",
            Self::PackageInstall => "package-install",
            Self::ContainerRuntime => "container-runtime",
            Self::ServiceDeploy => "service-deploy",
            Self::MeshJoin => "mesh-join",
            Self::Validate => "validate",
            Self::NetworkReload => "network-reload",
        }
    }

    /// Recovery-only stages may not appear in a pipeline.
    #[must_use]
    pub const fn is_recovery_only(self) -> bool {
        matches!(self, Self::NetworkReload)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Raised for a name that is not a stage identifier.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown stage '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for StageId {
    type Err = UnknownStage;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let name = input.trim();
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == name)
            .ok_or_else(|| UnknownStage(name.to_owned()))
    }
}

/// Whether a failing command fails its stage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CommandPolicy {
    /// Non-zero exit fails the stage immediately.
    #[default]
    Required,
    /// Non-zero exit is logged and the stage continues.
    BestEffort,
}

/// One remote command inside a stage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StageCommand {
    /// Shell text executed on the device.
    pub command: String,
    /// Failure handling.
    pub policy: CommandPolicy,
    /// Upper bound on this command's run time.
    pub timeout: Duration,
}

impl StageCommand {
    /// A required command.
    #[must_use]
    pub fn required(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            policy: CommandPolicy::Required,
            timeout,
        }
    }

    /// A best-effort command.
    #[must_use]
    pub fn best_effort(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            policy: CommandPolicy::BestEffort,
            timeout,
        }
    }
}

/// A step of a scripted stage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StageStep {
    /// Run a remote command.
    Run(StageCommand),
    /// Pause locally.
    Wait(Duration),
}

/// Ordered steps executed against one session.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StageScript {
    steps: Vec<StageStep>,
}

impl StageScript {
    /// Creates a script from steps.
    #[must_use]
    pub const fn new(steps: Vec<StageStep>) -> Self {
        Self { steps }
    }

    /// Steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[StageStep] {
        &self.steps
    }

    /// Remote commands only, in order.
    pub fn commands(&self) -> impl Iterator<Item = &StageCommand> {
        self.steps.iter().filter_map(|step| match step {
            StageStep::Run(command) => Some(command),
            StageStep::Wait(_) => None,
        })
    }
}

/// What a stage does when it runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StageBody {
    /// Opaque command list.
    Script(StageScript),
    /// Apply and verify the run's network role.
    RoleConfiguration,
}

/// Static description of one stage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StageDefinition {
    /// Stage identifier.
    pub id: StageId,
    /// Expected run time, for operator display.
    pub estimated_duration: Duration,
    /// Aggregate limit on the stage.
    pub timeout: Duration,
    /// Work performed.
    pub body: StageBody,
    /// Remediation run between attempts. `None` means stage faults are final.
    pub recovery: Option<StageId>,
    /// The stage restarts networking, so the session must be reopened.
    pub reconnect_after: bool,
}

/// Named pipeline presets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PipelineKind {
    /// Complete bring-up.
    #[default]
    Full,
    /// Role configuration and connectivity only.
    Network,
    /// Health checks only. Always runs, ignoring checkpoints.
    Validate,
}

impl PipelineKind {
    /// Default stage order for the preset.
    #[must_use]
    pub fn default_stages(self) -> Vec<StageId> {
        match self {
            Self::Full => vec![
                StageId::SystemPrep,
                StageId::NetworkRole,
                StageId::InternetCheck,
                StageId::PackageInstall,
                StageId::ContainerRuntime,
                StageId::ServiceDeploy,
                StageId::MeshJoin,
                StageId::Validate,
            ],
            Self::Network => vec![StageId::NetworkRole, StageId::InternetCheck],
            Self::Validate => vec![StageId::InternetCheck, StageId::Validate],
        }
    }

    /// Whether completed stages are skipped.
    #[must_use]
    pub const fn is_checkpoint_gated(self) -> bool {
        !matches!(self, Self::Validate)
    }

    /// Preset name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Network => "network",
            Self::Validate => "validate",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Raised for an unrecognised pipeline preset name.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown pipeline '{0}' (expected 'full', 'network' or 'validate')")]
pub struct UnknownPipeline(pub String);

impl FromStr for PipelineKind {
    type Err = UnknownPipeline;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "network" => Ok(Self::Network),
            "validate" => Ok(Self::Validate),
            other => Err(UnknownPipeline(other.to_owned())),
        }
    }
}

/// Errors raised while building a pipeline.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PipelineError {
    /// A name did not resolve to a stage.
    #[error(transparent)]
    Unknown(#[from] UnknownStage),
    /// The pipeline is empty.
    #[error("pipeline must contain at least one stage")]
    Empty,
    /// A stage appears twice.
    #[error("stage {0} appears more than once")]
    Duplicate(StageId),
    /// A recovery-only stage was placed in the pipeline.
    #[error("stage {0} is a recovery action and cannot run in a pipeline")]
    RecoveryOnly(StageId),
    /// The catalog has no definition for a stage.
    #[error("stage {0} is not defined in the stage catalog")]
    Undefined(StageId),
    /// A stage names a recovery action the catalog does not define.
    #[error("stage {stage} uses recovery action {recovery}, which is not defined")]
    MissingRecovery {
        /// Stage referencing the action.
        stage: StageId,
        /// Missing action.
        recovery: StageId,
    },
}

/// The ordered stage list selected for a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pipeline {
    kind: PipelineKind,
    stages: Vec<StageId>,
}

impl Pipeline {
    /// Builds the preset pipeline for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when the catalog cannot satisfy the preset.
    pub fn for_kind(kind: PipelineKind, catalog: &StageCatalog) -> Result<Self, PipelineError> {
        Self::build(kind, kind.default_stages(), catalog)
    }

    /// Builds a pipeline from stage names, keeping the preset's gating rules.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for unknown names and invalid orders.
    pub fn from_names<I, S>(
        kind: PipelineKind,
        names: I,
        catalog: &StageCatalog,
    ) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stages = names
            .into_iter()
            .map(|name| name.as_ref().parse::<StageId>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::build(kind, stages, catalog)
    }

    /// Validates `stages` against `catalog`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for an empty list, duplicates, recovery-only
    /// stages, or stages and recovery actions missing from the catalog.
    pub fn build(
        kind: PipelineKind,
        stages: Vec<StageId>,
        catalog: &StageCatalog,
    ) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        for (index, id) in stages.iter().enumerate() {
            if id.is_recovery_only() {
                return Err(PipelineError::RecoveryOnly(*id));
            }
            if stages.iter().take(index).any(|earlier| earlier == id) {
                return Err(PipelineError::Duplicate(*id));
            }
            let Some(definition) = catalog.definition(*id) else {
                return Err(PipelineError::Undefined(*id));
            };
            if let Some(recovery) = definition.recovery
                && catalog.definition(recovery).is_none()
            {
                return Err(PipelineError::MissingRecovery {
                    stage: *id,
                    recovery,
                });
            }
        }
        Ok(Self { kind, stages })
    }

    /// Preset the pipeline was built from.
    #[must_use]
    pub const fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Stage identifiers in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageId] {
        &self.stages
    }

    /// Whether completed stages are skipped.
    #[must_use]
    pub const fn is_checkpoint_gated(&self) -> bool {
        self.kind.is_checkpoint_gated()
    }

    /// `(ordinal, id)` pairs, ordinals starting at 1.
    pub fn ordinals(&self) -> impl Iterator<Item = (usize, StageId)> + '_ {
        self.stages.iter().copied().enumerate().map(|(index, id)| (index + 1, id))
    }
}
