//! Binary entry point for the `bringup` CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bringup::config::{BringupConfig, ConfigError, NetworkConfig};
use bringup::context::{OrchestratorContext, RunMode};
use bringup::discovery::{NetworkScanner, ScanError, SystemProbe};
use bringup::identity::{IdentityResolver, ProcNeighborTable};
use bringup::orchestrator::{CycleOutcome, CyclePlan, CycleReport, DiscoveryReport, Orchestrator};
use bringup::role::{NetworkRoleConfigurator, Role};
use bringup::session::SshConnector;
use bringup::stage::{Pipeline, PipelineError, PipelineKind, StageCatalog, StageExecutor};

mod cli;

use cli::{Cli, Command, PipelineArg, PipelineArgs, RoleArg, RunCommand, ScanCommand, StagesCommand};

/// Exit status after a shutdown request interrupted a single-cycle run.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("discovery setup failed: {0}")]
    Scan(#[from] ScanError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

type BringupOrchestrator = Orchestrator<SystemProbe, ProcNeighborTable, SshConnector>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let token = CancellationToken::new();
    spawn_shutdown_listener(token.clone());

    let exit_code = match dispatch(cli.command, token).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::warn!("shutdown requested; stopping at the next safe point");
        token.cancel();
    });
}

async fn wait_for_shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable; listening for Ctrl-C only");
            if let Err(ctrl_c_err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %ctrl_c_err, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to listen for Ctrl-C");
                terminate.recv().await;
            }
        }
        _ = terminate.recv() => {}
    }
}

async fn dispatch(command: Command, token: CancellationToken) -> Result<i32, CliError> {
    match command {
        Command::Run(args) => run_command(args, token).await,
        Command::Scan(args) => scan_command(args, token).await,
        Command::Stages(args) => stages_command(&args),
    }
}

async fn run_command(args: RunCommand, token: CancellationToken) -> Result<i32, CliError> {
    let (config, network) = load_config(args.range)?;
    let mode = if args.continuous {
        RunMode::Continuous
    } else {
        RunMode::Once
    };
    let ctx = OrchestratorContext::new(token, config.run_settings(role(args.role), mode));
    let mut orchestrator = assemble(&config, &network, &args.pipeline, args.fresh_journal)?;

    tracing::info!(
        range = %orchestrator.plan().range,
        pipeline = orchestrator.plan().pipeline.kind().as_str(),
        stages = orchestrator.plan().pipeline.stages().len(),
        role = %ctx.settings().role,
        continuous = args.continuous,
        "starting bring-up"
    );
    let report = orchestrator.run(&ctx).await;
    write_cycle_report(io::stdout().lock(), &report)?;
    Ok(exit_code(mode, &report.outcome))
}

async fn scan_command(args: ScanCommand, token: CancellationToken) -> Result<i32, CliError> {
    let (config, network) = load_config(args.range)?;
    let ctx = OrchestratorContext::new(token, config.run_settings(Role::Forward, RunMode::Once));
    let orchestrator = assemble(&config, &network, &default_pipeline_args(), false)?;

    let report = orchestrator.discover(&ctx).await;
    write_discovery_report(io::stdout().lock(), &report)?;
    Ok(0)
}

fn stages_command(args: &StagesCommand) -> Result<i32, CliError> {
    let (config, network) = load_config(None)?;
    let catalog = config.stage_catalog(&network)?;
    let pipeline = resolve_pipeline(&config, &args.pipeline, &catalog)?;
    write_pipeline(io::stdout().lock(), &pipeline, &catalog)?;
    Ok(0)
}

fn load_config(range: Option<String>) -> Result<(BringupConfig, NetworkConfig), CliError> {
    let mut config = BringupConfig::load_without_cli_args()?;
    if let Some(override_range) = range {
        config.scan_range = override_range;
    }
    let network = NetworkConfig::load_without_cli_args()?;
    config.validate()?;
    network.validate()?;
    Ok((config, network))
}

const fn default_pipeline_args() -> PipelineArgs {
    PipelineArgs {
        pipeline: PipelineArg::Full,
        stages: Vec::new(),
    }
}

fn resolve_pipeline(
    config: &BringupConfig,
    args: &PipelineArgs,
    catalog: &StageCatalog,
) -> Result<Pipeline, CliError> {
    let kind = pipeline_kind(args.pipeline);
    let names = if args.stages.is_empty() {
        config.stage_names()?
    } else {
        Some(args.stages.clone())
    };
    let pipeline = match names {
        Some(explicit) => Pipeline::from_names(kind, &explicit, catalog)?,
        None => Pipeline::for_kind(kind, catalog)?,
    };
    Ok(pipeline)
}

fn assemble(
    config: &BringupConfig,
    network: &NetworkConfig,
    pipeline_args: &PipelineArgs,
    fresh_journal: bool,
) -> Result<BringupOrchestrator, CliError> {
    let catalog = config.stage_catalog(network)?;
    let pipeline = resolve_pipeline(config, pipeline_args, &catalog)?;
    let plan = CyclePlan {
        range: config.scan_range()?,
        credentials: config.credentials()?,
        pipeline,
        executor: StageExecutor::new(Arc::new(catalog)),
        configurator: NetworkRoleConfigurator::new(
            network.templates()?,
            network.role_commands(Duration::from_secs(config.command_timeout_secs)),
        ),
        recovery: config.recovery_policy()?,
        transport: config.transport_policy()?,
        journal_dir: config.journal_dir(),
        fresh_journal,
    };

    let scanner = NetworkScanner::new(
        SystemProbe::for_method(config.probe_method()?, config.probe_port),
        config.probe_concurrency,
        config.probe_timeout(),
    )?;
    let resolver =
        IdentityResolver::new(ProcNeighborTable::default(), config.authorization_policy()?);
    let connector = SshConnector::with_process_runner(&config.ssh_bin, &config.sshpass_bin);
    Ok(Orchestrator::new(scanner, resolver, connector, plan))
}

const fn role(arg: RoleArg) -> Role {
    match arg {
        RoleArg::Forward => Role::Forward,
        RoleArg::Reverse => Role::Reverse,
    }
}

const fn pipeline_kind(arg: PipelineArg) -> PipelineKind {
    match arg {
        PipelineArg::Full => PipelineKind::Full,
        PipelineArg::Network => PipelineKind::Network,
        PipelineArg::Validate => PipelineKind::Validate,
    }
}

/// Success exits 0. A shutdown request exits 130 in single-cycle mode and 0
/// in continuous mode; every other outcome exits 1.
const fn exit_code(mode: RunMode, outcome: &CycleOutcome) -> i32 {
    match (outcome, mode) {
        (CycleOutcome::Succeeded, _) | (CycleOutcome::Cancelled, RunMode::Continuous) => 0,
        (CycleOutcome::Cancelled, RunMode::Once) => EXIT_INTERRUPTED,
        _ => 1,
    }
}

fn join_stages<T: std::fmt::Display>(stages: &[T]) -> String {
    if stages.is_empty() {
        return String::from("-");
    }
    stages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_cycle_report(mut out: impl Write, report: &CycleReport) -> io::Result<()> {
    writeln!(out, "cycle {}: {}", report.number, report.outcome)?;
    writeln!(out, "authorized devices: {}", report.authorized_devices)?;
    if let (Some(device), Some(address)) = (report.device, report.address) {
        writeln!(out, "device: {device} at {address}")?;
    }
    writeln!(out, "completed: {}", join_stages(&report.completed))?;
    writeln!(out, "skipped: {}", join_stages(&report.skipped))?;
    if let Some(journal) = &report.journal {
        writeln!(out, "journal: {journal}")?;
    }
    Ok(())
}

fn write_discovery_report(mut out: impl Write, report: &DiscoveryReport) -> io::Result<()> {
    for device in &report.devices {
        let hardware = device
            .candidate
            .hardware_address
            .as_deref()
            .unwrap_or("-");
        let verdict = match &device.verdict {
            None => String::from("unresolved"),
            Some(verdict) if verdict.is_authorized() => format!("authorized ({})", verdict.reason()),
            Some(verdict) => format!("rejected ({})", verdict.reason()),
        };
        writeln!(out, "{}\t{hardware}\t{verdict}", device.candidate.address)?;
    }
    writeln!(
        out,
        "{} authorized of {} reachable",
        report.authorized_count(),
        report.devices.len()
    )
}

fn write_pipeline(mut out: impl Write, pipeline: &Pipeline, catalog: &StageCatalog) -> io::Result<()> {
    let gating = if pipeline.is_checkpoint_gated() {
        "resumable"
    } else {
        "always runs every stage"
    };
    writeln!(out, "pipeline {} ({gating})", pipeline.kind().as_str())?;
    for (ordinal, stage) in pipeline.ordinals() {
        let Some(definition) = catalog.definition(stage) else {
            continue;
        };
        write!(
            out,
            "{ordinal}. {stage} ~{}s",
            definition.estimated_duration.as_secs()
        )?;
        if let Some(recovery) = definition.recovery {
            write!(out, " (recovery: {recovery})")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
