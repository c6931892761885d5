//! Runs scripted stages against a session.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;

use crate::context::{Cancelled, OrchestratorContext};
use crate::process::CommandOutput;
use crate::session::{RemoteSession, SessionError};

use super::{CommandPolicy, StageBody, StageCatalog, StageCommand, StageId, StageStep};

/// Result of one stage run. A failed outcome is a stage fault.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StageOutcome {
    /// Whether every required command succeeded.
    pub success: bool,
    /// Summary for logs and the journal.
    pub message: String,
}

impl StageOutcome {
    /// A successful outcome.
    #[must_use]
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Faults that stop a stage without producing an outcome.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecutionError {
    /// Transport fault from the session.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Shutdown was requested between steps.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
    /// The catalog has no definition for the stage.
    #[error("stage {stage} is not defined")]
    Undefined {
        /// Requested stage.
        stage: StageId,
    },
    /// The stage is not a command list.
    #[error("stage {stage} is not a scripted stage")]
    NotScripted {
        /// Requested stage.
        stage: StageId,
    },
}

/// Executes scripted stages from a catalog.
#[derive(Clone, Debug)]
pub struct StageExecutor {
    catalog: Arc<StageCatalog>,
}

impl StageExecutor {
    /// Creates an executor over `catalog`.
    #[must_use]
    pub const fn new(catalog: Arc<StageCatalog>) -> Self {
        Self { catalog }
    }

    /// Catalog the executor resolves stages from.
    #[must_use]
    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    /// Runs `stage` step by step against `session`.
    ///
    /// A required command that exits non-zero fails the stage immediately;
    /// later steps do not run. Best-effort failures are logged and skipped.
    /// The stage's aggregate timeout caps every command and wait.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Session`] for transport faults,
    /// [`ExecutionError::Cancelled`] when shutdown is requested between
    /// steps, and the lookup variants when `stage` cannot be run here.
    pub async fn execute<S: RemoteSession>(
        &self,
        ctx: &OrchestratorContext,
        stage: StageId,
        session: &mut S,
    ) -> Result<StageOutcome, ExecutionError> {
        let definition = self
            .catalog
            .definition(stage)
            .ok_or(ExecutionError::Undefined { stage })?;
        let StageBody::Script(script) = &definition.body else {
            return Err(ExecutionError::NotScripted { stage });
        };

        let limit_secs = definition.timeout.as_secs();
        let Some(deadline) = Instant::now().checked_add(definition.timeout) else {
            return Ok(StageOutcome::failed(format!(
                "stage timeout of {limit_secs}s is out of range"
            )));
        };
        let mut ran = 0_usize;

        for step in script.steps() {
            ctx.ensure_active()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(StageOutcome::failed(format!(
                    "stage exceeded its {limit_secs}s limit"
                )));
            }

            let command = match step {
                StageStep::Wait(pause) => {
                    ctx.sleep((*pause).min(remaining)).await?;
                    continue;
                }
                StageStep::Run(command) => command,
            };

            let capped = command.timeout > remaining;
            tracing::debug!(%stage, command = %command.command, "running stage command");
            let output = match session.run(&command.command, command.timeout.min(remaining)).await
            {
                Ok(output) => output,
                Err(SessionError::Timeout { .. }) if capped => {
                    return Ok(StageOutcome::failed(format!(
                        "stage exceeded its {limit_secs}s limit while running `{}`",
                        command.command
                    )));
                }
                Err(err) => return Err(err.into()),
            };
            ran += 1;

            if output.is_success() {
                continue;
            }
            match command.policy {
                CommandPolicy::Required => {
                    return Ok(StageOutcome::failed(describe_failure(command, &output)));
                }
                CommandPolicy::BestEffort => {
                    tracing::warn!(
                        %stage,
                        command = %command.command,
                        status = ?output.code,
                        "best-effort command failed; continuing"
                    );
                }
            }
        }

        Ok(StageOutcome::succeeded(format!("{ran} commands completed")))
    }
}

fn describe_failure(command: &StageCommand, output: &CommandOutput) -> String {
    let status = output
        .code
        .map_or_else(|| String::from("unknown status"), |code| format!("status {code}"));
    let detail = output.stderr.trim();
    if detail.is_empty() {
        format!("`{}` exited with {status}", command.command)
    } else {
        format!("`{}` exited with {status}: {detail}", command.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use crate::context::RunSettings;
    use crate::stage::{StageDefinition, StageScript};
    use crate::test_support::ScriptedDevice;
    use tokio_util::sync::CancellationToken;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn executor(steps: Vec<StageStep>) -> StageExecutor {
        let catalog = StageCatalog::empty(TIMEOUT).with_definition(StageDefinition {
            id: StageId::PackageInstall,
            estimated_duration: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            body: StageBody::Script(StageScript::new(steps)),
            recovery: None,
            reconnect_after: false,
        });
        StageExecutor::new(Arc::new(catalog))
    }

    fn context() -> OrchestratorContext {
        OrchestratorContext::new(CancellationToken::new(), RunSettings::default())
    }

    fn run(command: &str) -> StageStep {
        StageStep::Run(StageCommand::required(command, TIMEOUT))
    }

    fn best_effort(command: &str) -> StageStep {
        StageStep::Run(StageCommand::best_effort(command, TIMEOUT))
    }

    #[tokio::test]
    async fn runs_every_command_in_order() {
        let device = ScriptedDevice::new(Ipv4Addr::new(192, 168, 1, 1));
        let mut session = device.session();
        let executor = executor(vec![run("opkg update"), run("opkg install curl")]);

        let outcome = executor
            .execute(&context(), StageId::PackageInstall, &mut session)
            .await
            .expect("stage runs");

        assert!(outcome.success, "{outcome:?}");
        assert_eq!(device.commands(), vec!["opkg update", "opkg install curl"]);
    }

    #[tokio::test]
    async fn required_failure_stops_the_stage() {
        let device = ScriptedDevice::new(Ipv4Addr::new(192, 168, 1, 1));
        device.fail_next("opkg update", 1);
        let mut session = device.session();
        let executor = executor(vec![run("opkg update"), run("opkg install curl")]);

        let outcome = executor
            .execute(&context(), StageId::PackageInstall, &mut session)
            .await
            .expect("stage runs");

        assert!(!outcome.success);
        assert!(outcome.message.contains("opkg update"), "{}", outcome.message);
        assert_eq!(device.count_matching("opkg install"), 0);
    }

    #[tokio::test]
    async fn best_effort_failure_is_tolerated() {
        let device = ScriptedDevice::new(Ipv4Addr::new(192, 168, 1, 1));
        device.always_fail("rm -f");
        let mut session = device.session();
        let executor = executor(vec![best_effort("rm -f /tmp/lock"), run("opkg update")]);

        let outcome = executor
            .execute(&context(), StageId::PackageInstall, &mut session)
            .await
            .expect("stage runs");

        assert!(outcome.success);
        assert_eq!(device.count_matching("opkg update"), 1);
    }

    #[tokio::test]
    async fn unrepresentable_timeout_fails_without_running() {
        let device = ScriptedDevice::new(Ipv4Addr::new(192, 168, 1, 1));
        let mut session = device.session();
        let catalog = StageCatalog::empty(TIMEOUT).with_definition(StageDefinition {
            id: StageId::Validate,
            estimated_duration: Duration::from_secs(1),
            timeout: Duration::MAX,
            body: StageBody::Script(StageScript::new(vec![run("nslookup example.com")])),
            recovery: None,
            reconnect_after: false,
        });

        let outcome = StageExecutor::new(Arc::new(catalog))
            .execute(&context(), StageId::Validate, &mut session)
            .await
            .expect("stage runs");

        assert!(!outcome.success);
        assert!(outcome.message.contains("out of range"), "{}", outcome.message);
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn transport_faults_propagate() {
        let device = ScriptedDevice::new(Ipv4Addr::new(192, 168, 1, 1));
        device.drop_channel_next("opkg update", 1);
        let mut session = device.session();
        let executor = executor(vec![run("opkg update")]);

        let result = executor
            .execute(&context(), StageId::PackageInstall, &mut session)
            .await;

        assert!(matches!(
            result,
            Err(ExecutionError::Session(SessionError::Channel { .. }))
        ));
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_steps() {
        let token = CancellationToken::new();
        let ctx = OrchestratorContext::new(token.clone(), RunSettings::default());
        token.cancel();
        let device = ScriptedDevice::new(Ipv4Addr::new(192, 168, 1, 1));
        let mut session = device.session();

        let result = executor(vec![run("opkg update")])
            .execute(&ctx, StageId::PackageInstall, &mut session)
            .await;

        assert_eq!(result, Err(ExecutionError::Cancelled(Cancelled)));
        assert!(device.commands().is_empty());
    }

    #[tokio::test]
    async fn waits_are_local() {
        let device = ScriptedDevice::new(Ipv4Addr::new(192, 168, 1, 1));
        let mut session = device.session();
        let executor = executor(vec![StageStep::Wait(Duration::from_millis(5)), run("true")]);

        let outcome = executor
            .execute(&context(), StageId::PackageInstall, &mut session)
            .await
            .expect("stage runs");

        assert!(outcome.success);
        assert_eq!(device.commands(), vec!["true"]);
    }

    #[tokio::test]
    async fn role_stage_is_not_scripted() {
        let device = ScriptedDevice::new(Ipv4Addr::new(192, 168, 1, 1));
        let mut session = device.session();
        let executor = StageExecutor::new(Arc::new(StageCatalog::builtin(
            &crate::stage::CatalogDefaults::default(),
        )));

        let result = executor
            .execute(&context(), StageId::NetworkRole, &mut session)
            .await;
        assert_eq!(
            result,
            Err(ExecutionError::NotScripted {
                stage: StageId::NetworkRole
            })
        );
    }
}
