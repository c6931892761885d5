//! One pipeline stage as a [`Recoverable`] unit of work.
//!
//! Stages with a recovery action treat stage faults as retryable and run the
//! action between attempts. Stages without one are retried only for
//! transport faults, reconnecting between attempts; a stage fault is final.

use thiserror::Error;

use crate::context::OrchestratorContext;
use crate::discovery::ReachabilityProbe;
use crate::journal::{CheckpointJournal, JournalError};
use crate::recovery::{Attempt, Recoverable};
use crate::role::NetworkRoleConfigurator;
use crate::session::Connector;
use crate::stage::{ExecutionError, StageBody, StageDefinition, StageExecutor, StageOutcome};

use super::link::{DeviceLink, LinkError};

/// Conditions that stop a stage without another attempt.
#[derive(Debug, Error)]
pub(super) enum StageAbort {
    #[error("shutdown requested")]
    Cancelled,
    #[error(transparent)]
    Journal(#[from] JournalError),
}

type AttemptResult = Result<Attempt<StageOutcome>, StageAbort>;

fn link_fault(err: LinkError) -> AttemptResult {
    match err {
        LinkError::Cancelled => Err(StageAbort::Cancelled),
        other => Ok(Attempt::Retry(other.to_string())),
    }
}

pub(super) struct StageAttempt<'a, 'l, C: Connector, P> {
    pub(super) definition: &'a StageDefinition,
    pub(super) executor: &'a StageExecutor,
    pub(super) configurator: &'a NetworkRoleConfigurator,
    pub(super) link: &'a mut DeviceLink<'l, C, P>,
    pub(super) journal: &'a mut CheckpointJournal,
}

impl<C, P> StageAttempt<'_, '_, C, P>
where
    C: Connector,
    P: ReachabilityProbe,
{
    const fn stage_fault(&self, reason: String) -> Attempt<StageOutcome> {
        if self.definition.recovery.is_some() {
            Attempt::Retry(reason)
        } else {
            Attempt::GiveUp(reason)
        }
    }

    async fn run_script(&mut self, ctx: &OrchestratorContext) -> AttemptResult {
        let stage = self.definition.id;
        let session = match self.link.open(ctx).await {
            Ok(session) => session,
            Err(err) => return link_fault(err),
        };
        match self.executor.execute(ctx, stage, session).await {
            Ok(outcome) if outcome.success => {
                if self.definition.reconnect_after
                    && let Err(err) = self.link.reestablish(ctx).await
                {
                    return link_fault(err);
                }
                Ok(Attempt::Succeeded(outcome))
            }
            Ok(outcome) => Ok(self.stage_fault(outcome.message)),
            Err(ExecutionError::Session(err)) => {
                self.link.close().await;
                Ok(Attempt::Retry(err.to_string()))
            }
            Err(ExecutionError::Cancelled(_)) => Err(StageAbort::Cancelled),
            Err(err) => Ok(Attempt::GiveUp(err.to_string())),
        }
    }

    /// Runs one role attempt under the stage's aggregate timeout.
    async fn configure_role(&mut self, ctx: &OrchestratorContext) -> AttemptResult {
        let limit = self.definition.timeout;
        if let Ok(result) = tokio::time::timeout(limit, self.apply_and_verify_role(ctx)).await {
            return result;
        }
        // The attempt may have stopped mid-command; start the next one clean.
        self.link.close().await;
        Ok(Attempt::Retry(format!(
            "stage exceeded its {}s limit",
            limit.as_secs()
        )))
    }

    /// Applies the role, waits for the device to come back on its new
    /// addressing, then verifies the uplink.
    async fn apply_and_verify_role(&mut self, ctx: &OrchestratorContext) -> AttemptResult {
        let role = ctx.settings().role;
        let session = match self.link.open(ctx).await {
            Ok(session) => session,
            Err(err) => return link_fault(err),
        };
        let applied = match self.configurator.apply(session, role).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.link.close().await;
                return Ok(Attempt::Retry(err.to_string()));
            }
        };
        if !applied.success {
            return Ok(self.stage_fault(applied.message));
        }

        if let Err(err) = self.link.reestablish(ctx).await {
            return match err {
                LinkError::Cancelled => Err(StageAbort::Cancelled),
                other => Ok(Attempt::Retry(format!(
                    "device did not return after {role} role change: {other}"
                ))),
            };
        }
        let session = match self.link.open(ctx).await {
            Ok(session) => session,
            Err(err) => return link_fault(err),
        };
        match self.configurator.verify(session, role).await {
            Ok(verified) if verified.success => Ok(Attempt::Succeeded(StageOutcome::succeeded(
                format!("{}; {}", applied.message, verified.message),
            ))),
            Ok(verified) => Ok(self.stage_fault(verified.message)),
            Err(err) => {
                self.link.close().await;
                Ok(Attempt::Retry(err.to_string()))
            }
        }
    }
}

impl<C, P> Recoverable for StageAttempt<'_, '_, C, P>
where
    C: Connector,
    P: ReachabilityProbe,
{
    type Output = StageOutcome;
    type Error = StageAbort;

    async fn attempt(&mut self, ctx: &OrchestratorContext, attempt: u32) -> AttemptResult {
        ctx.ensure_active().map_err(|_| StageAbort::Cancelled)?;
        let result = match self.definition.body {
            StageBody::Script(_) => self.run_script(ctx).await?,
            StageBody::RoleConfiguration => self.configure_role(ctx).await?,
        };
        if let Attempt::Retry(reason) | Attempt::GiveUp(reason) = &result {
            self.journal.append(format!(
                "{} attempt {attempt} failed: {reason}",
                self.definition.id
            ))?;
        }
        Ok(result)
    }

    async fn remediate(&mut self, ctx: &OrchestratorContext, attempt: u32) -> Result<(), StageAbort> {
        let stage = self.definition.id;
        let Some(recovery) = self.definition.recovery else {
            // Transport retry: the next attempt reconnects.
            self.link.close().await;
            return Ok(());
        };

        tracing::info!(%stage, %recovery, attempt, "running recovery action");
        self.journal
            .append(format!("{stage} attempt {attempt}: running {recovery}"))?;

        let session = match self.link.open(ctx).await {
            Ok(session) => session,
            Err(LinkError::Cancelled) => return Err(StageAbort::Cancelled),
            Err(err) => {
                tracing::warn!(%recovery, error = %err, "device unreachable for recovery action");
                return Ok(());
            }
        };
        let mut reconnect = self
            .executor
            .catalog()
            .definition(recovery)
            .is_some_and(|definition| definition.reconnect_after);
        match self.executor.execute(ctx, recovery, session).await {
            Ok(outcome) if outcome.success => {}
            Ok(outcome) => {
                tracing::warn!(%recovery, reason = %outcome.message, "recovery action failed");
            }
            Err(ExecutionError::Cancelled(_)) => return Err(StageAbort::Cancelled),
            Err(err) => {
                // A reload commonly severs the channel it was issued on.
                tracing::debug!(%recovery, error = %err, "recovery action interrupted");
                reconnect = true;
            }
        }

        if reconnect {
            match self.link.reestablish(ctx).await {
                Ok(()) => {}
                Err(LinkError::Cancelled) => return Err(StageAbort::Cancelled),
                Err(err) => {
                    tracing::warn!(%recovery, error = %err, "device did not return after recovery");
                }
            }
        }
        Ok(())
    }
}
