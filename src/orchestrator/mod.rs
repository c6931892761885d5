//! Cycle control.
//!
//! One cycle discovers and authorizes a device, opens its checkpoint
//! journal, connects, and walks the pipeline: completed stages are skipped,
//! every other stage runs under a [`RecoveryPolicy`], and the outcome is
//! recorded in the journal. Continuous mode repeats cycles after a cooldown
//! until shutdown is requested.

use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use chrono::Utc;
use tracing::Instrument;

use crate::context::{OrchestratorContext, RunMode};
use crate::discovery::{AddressRange, NetworkScanner, ReachabilityProbe};
use crate::identity::{HardwareAddress, IdentityResolver, NeighborTable};
use crate::journal::{CheckpointJournal, JournalError};
use crate::recovery::{RecoveryError, RecoveryPolicy};
use crate::role::NetworkRoleConfigurator;
use crate::session::{Connector, Credentials};
use crate::stage::{Pipeline, StageExecutor};

mod link;
mod report;
mod stages;

pub use link::LinkError;
pub use report::{CycleOutcome, CycleReport, DiscoveredDevice, DiscoveryReport};

use link::DeviceLink;
use stages::{StageAbort, StageAttempt};

/// Everything a cycle needs besides the discovery and transport components.
#[derive(Clone, Debug)]
pub struct CyclePlan {
    /// Range swept for devices.
    pub range: AddressRange,
    /// Login used for every session.
    pub credentials: Credentials,
    /// Stages to run, in order.
    pub pipeline: Pipeline,
    /// Runs scripted stages.
    pub executor: StageExecutor,
    /// Runs the role stage.
    pub configurator: NetworkRoleConfigurator,
    /// Bound for stages that carry a recovery action.
    pub recovery: RecoveryPolicy,
    /// Bound for connection attempts and transport retries of other stages.
    pub transport: RecoveryPolicy,
    /// Directory holding checkpoint journals.
    pub journal_dir: Utf8PathBuf,
    /// Start a new journal for the first cycle instead of resuming.
    pub fresh_journal: bool,
}

/// Drives bring-up cycles against one device at a time.
#[derive(Debug)]
pub struct Orchestrator<P, N, C> {
    scanner: NetworkScanner<P>,
    resolver: IdentityResolver<N>,
    connector: C,
    plan: CyclePlan,
    cycles: u64,
}

impl<P, N, C> Orchestrator<P, N, C>
where
    P: ReachabilityProbe + 'static,
    N: NeighborTable,
    C: Connector,
{
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(
        scanner: NetworkScanner<P>,
        resolver: IdentityResolver<N>,
        connector: C,
        plan: CyclePlan,
    ) -> Self {
        Self {
            scanner,
            resolver,
            connector,
            plan,
            cycles: 0,
        }
    }

    /// Cycles started so far.
    #[must_use]
    pub const fn cycles(&self) -> u64 {
        self.cycles
    }

    /// The plan cycles follow.
    #[must_use]
    pub const fn plan(&self) -> &CyclePlan {
        &self.plan
    }

    /// Sweeps the range and authorizes every host that answers. Opens no
    /// sessions.
    pub async fn discover(&self, ctx: &OrchestratorContext) -> DiscoveryReport {
        let mut sweep = self.scanner.scan(&self.plan.range, ctx);
        let mut devices = Vec::new();
        while let Some(candidate) = sweep.next().await {
            let hardware_address = self.resolver.resolve(candidate.address);
            let verdict = hardware_address
                .as_deref()
                .map(|raw| self.resolver.authorize(raw));
            devices.push(DiscoveredDevice {
                candidate: candidate.with_hardware_address(hardware_address),
                verdict,
            });
        }
        devices.sort_by_key(|device| device.candidate.address);
        DiscoveryReport { devices }
    }

    /// Runs cycles according to the run mode and returns the last report.
    ///
    /// Single-cycle mode returns after one cycle. Continuous mode never stops
    /// on a failed cycle; it cools down and starts a fresh one until shutdown
    /// is requested.
    pub async fn run(&mut self, ctx: &OrchestratorContext) -> CycleReport {
        loop {
            let report = self.run_cycle(ctx).await;
            if ctx.settings().mode == RunMode::Once || report.outcome == CycleOutcome::Cancelled {
                return report;
            }

            let cooldown = ctx.settings().cycle_cooldown;
            tracing::info!(
                cycle = report.number,
                outcome = %report.outcome,
                cooldown_secs = cooldown.as_secs(),
                "cycle finished; cooling down"
            );
            if ctx.sleep(cooldown).await.is_err() {
                return report;
            }
        }
    }

    /// Runs one cycle from discovery to outcome.
    pub async fn run_cycle(&mut self, ctx: &OrchestratorContext) -> CycleReport {
        self.cycles += 1;
        let number = self.cycles;
        let fresh = std::mem::take(&mut self.plan.fresh_journal);
        let span = tracing::info_span!(parent: ctx.span(), "cycle", number);
        let cycle_ctx = ctx.with_span(span.clone());

        let report = self
            .execute_cycle(&cycle_ctx, number, fresh)
            .instrument(span.clone())
            .await;
        span.in_scope(|| match &report.outcome {
            CycleOutcome::Succeeded => tracing::info!(
                completed = report.completed.len(),
                skipped = report.skipped.len(),
                "cycle succeeded"
            ),
            CycleOutcome::Cancelled => tracing::warn!("cycle cancelled"),
            outcome => tracing::error!(outcome = %outcome, "cycle did not succeed"),
        });
        report
    }

    async fn execute_cycle(
        &self,
        ctx: &OrchestratorContext,
        number: u64,
        fresh: bool,
    ) -> CycleReport {
        let mut report = CycleReport::new(number);
        let discovery = self.discover(ctx).await;
        if ctx.is_cancelled() {
            report.outcome = CycleOutcome::Cancelled;
            return report;
        }

        report.authorized_devices = discovery.authorized_count();
        let Some((address, device)) = discovery.authorized().next() else {
            tracing::warn!(
                range = %self.plan.range,
                reachable = discovery.devices.len(),
                "no authorized device found"
            );
            return report;
        };
        if report.authorized_devices > 1 {
            tracing::warn!(
                authorized = report.authorized_devices,
                chosen = %address,
                "several authorized devices answered; orchestrating the lowest address"
            );
        }
        report.address = Some(address);
        report.device = Some(device);

        let mut journal =
            match CheckpointJournal::open(&self.plan.journal_dir, device, Utc::now(), fresh) {
                Ok(journal) => journal,
                Err(err) => {
                    report.outcome = CycleOutcome::Failed {
                        stage: None,
                        reason: err.to_string(),
                    };
                    return report;
                }
            };
        report.journal = Some(journal.path().to_path_buf());

        report.outcome = match self
            .drive(ctx, &mut journal, &mut report, address, device)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => CycleOutcome::Failed {
                stage: report.stage_reached,
                reason: err.to_string(),
            },
        };
        if let Err(err) = journal.record_cycle(number, report.outcome.label(), report.stage_reached)
        {
            tracing::error!(error = %err, "failed to record cycle outcome");
        }
        report
    }

    async fn drive(
        &self,
        ctx: &OrchestratorContext,
        journal: &mut CheckpointJournal,
        report: &mut CycleReport,
        address: Ipv4Addr,
        device: HardwareAddress,
    ) -> Result<CycleOutcome, JournalError> {
        journal.append(format!(
            "cycle {} authorized {device} at {address}",
            report.number
        ))?;

        let mut link = DeviceLink::new(
            &self.connector,
            self.scanner.probe(),
            &self.plan.credentials,
            address,
            self.plan.transport,
            self.scanner.probe_timeout(),
        );
        if let Err(err) = link.open(ctx).await {
            journal.append(format!("connect failed: {err}"))?;
            return Ok(match err {
                LinkError::Cancelled => CycleOutcome::Cancelled,
                other => CycleOutcome::Failed {
                    stage: None,
                    reason: other.to_string(),
                },
            });
        }

        let outcome = self.run_pipeline(ctx, journal, report, &mut link).await;
        link.close().await;
        outcome
    }

    async fn run_pipeline(
        &self,
        ctx: &OrchestratorContext,
        journal: &mut CheckpointJournal,
        report: &mut CycleReport,
        link: &mut DeviceLink<'_, C, P>,
    ) -> Result<CycleOutcome, JournalError> {
        let pipeline = &self.plan.pipeline;
        let gated = pipeline.is_checkpoint_gated();
        let total = pipeline.stages().len();

        for (ordinal, stage) in pipeline.ordinals() {
            if ctx.is_cancelled() {
                return Ok(CycleOutcome::Cancelled);
            }
            if gated && journal.has_completed(stage) {
                tracing::info!(%stage, ordinal, total, "already complete; skipping");
                report.skipped.push(stage);
                continue;
            }
            let Some(definition) = self.plan.executor.catalog().definition(stage) else {
                return Ok(CycleOutcome::Failed {
                    stage: Some(stage),
                    reason: format!("stage {stage} is not defined"),
                });
            };

            report.stage_reached = Some(stage);
            tracing::info!(
                %stage,
                ordinal,
                total,
                estimated_secs = definition.estimated_duration.as_secs(),
                "starting stage"
            );
            journal.mark_started(stage)?;

            let policy = if definition.recovery.is_some() {
                self.plan.recovery
            } else {
                self.plan.transport
            };
            let mut work = StageAttempt {
                definition,
                executor: &self.plan.executor,
                configurator: &self.plan.configurator,
                link: &mut *link,
                journal: &mut *journal,
            };
            match policy.run(ctx, stage.as_str(), &mut work).await {
                Ok(outcome) => {
                    journal.mark_completed(stage)?;
                    report.completed.push(stage);
                    tracing::info!(%stage, summary = %outcome.message, "stage complete");
                }
                Err(RecoveryError::Cancelled | RecoveryError::Aborted(StageAbort::Cancelled)) => {
                    journal.append(format!("{stage} interrupted by shutdown"))?;
                    return Ok(CycleOutcome::Cancelled);
                }
                Err(RecoveryError::Aborted(StageAbort::Journal(err))) => return Err(err),
                Err(err) => {
                    let reason = err.to_string();
                    tracing::error!(%stage, %reason, "stage failed");
                    journal.mark_failed(stage, &reason)?;
                    return Ok(CycleOutcome::Failed {
                        stage: Some(stage),
                        reason,
                    });
                }
            }
        }
        Ok(CycleOutcome::Succeeded)
    }
}
