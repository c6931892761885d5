//! Command-line interface definitions for the `bringup` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page. It
//! must not depend on the library crate.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `bringup` binary.
#[derive(Debug, Parser)]
#[command(
    name = "bringup",
    about = "Discover, authorize, and provision network appliances over SSH",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    /// Operation to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Discover a device and walk it through the provisioning pipeline.
    #[command(name = "run")]
    Run(RunCommand),
    /// Report reachable and authorized devices without opening sessions.
    #[command(name = "scan")]
    Scan(ScanCommand),
    /// Print the resolved pipeline with ordinals and estimates.
    #[command(name = "stages")]
    Stages(StagesCommand),
}

/// Network role applied by the role stage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum RoleArg {
    /// Uplink on the WAN port, downlink on the LAN port.
    #[default]
    Forward,
    /// Uplink on the LAN port (or cellular), downlink on the WAN port.
    Reverse,
}

/// Preset stage lists.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum PipelineArg {
    /// Every provisioning stage.
    #[default]
    Full,
    /// Role change and connectivity check only.
    Network,
    /// Connectivity and service checks; always runs every stage.
    Validate,
}

/// Pipeline selection shared by `run` and `stages`.
#[derive(Clone, Debug, Args)]
pub(crate) struct PipelineArgs {
    /// Preset pipeline.
    #[arg(long, value_enum, default_value_t = PipelineArg::Full)]
    pub(crate) pipeline: PipelineArg,
    /// Explicit comma-separated stage list; overrides `BRINGUP_STAGES`.
    #[arg(long, value_name = "STAGES", value_delimiter = ',')]
    pub(crate) stages: Vec<String>,
}

/// Arguments for `bringup run`.
#[derive(Debug, Args)]
pub(crate) struct RunCommand {
    /// Network role for the role stage.
    #[arg(long, value_enum, default_value_t = RoleArg::Forward)]
    pub(crate) role: RoleArg,
    /// Keep cycling until interrupted instead of stopping after one cycle.
    #[arg(long)]
    pub(crate) continuous: bool,
    /// Address range to sweep; overrides `BRINGUP_SCAN_RANGE`.
    #[arg(long, value_name = "CIDR")]
    pub(crate) range: Option<String>,
    /// Start a new checkpoint journal instead of resuming the newest one.
    #[arg(long)]
    pub(crate) fresh_journal: bool,
    /// Stage selection.
    #[command(flatten)]
    pub(crate) pipeline: PipelineArgs,
}

/// Arguments for `bringup scan`.
#[derive(Debug, Args)]
pub(crate) struct ScanCommand {
    /// Address range to sweep; overrides `BRINGUP_SCAN_RANGE`.
    #[arg(long, value_name = "CIDR")]
    pub(crate) range: Option<String>,
}

/// Arguments for `bringup stages`.
#[derive(Debug, Args)]
pub(crate) struct StagesCommand {
    /// Stage selection.
    #[command(flatten)]
    pub(crate) pipeline: PipelineArgs,
}
