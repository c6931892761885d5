//! Shared harness for pipeline behaviour tests.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bringup::context::{OrchestratorContext, RunMode, RunSettings};
use bringup::discovery::NetworkScanner;
use bringup::identity::{AuthorizationPolicy, IdentityResolver};
use bringup::journal::{JournalRecord, StageStatus};
use bringup::orchestrator::{CyclePlan, CycleReport, Orchestrator};
use bringup::recovery::RecoveryPolicy;
use bringup::role::{NetworkRoleConfigurator, Role, RoleCommands, RoleSettings, RoleTemplates};
use bringup::session::Credentials;
use bringup::stage::{CatalogDefaults, Pipeline, PipelineKind, StageCatalog, StageExecutor, StageId};
use bringup::test_support::{ScriptedConnector, ScriptedDevice, StaticNeighborTable, StaticProbe};
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const DEVICE_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
pub const TELTONIKA_MAC: &str = "00:1e:42:12:34:56";
pub const UNKNOWN_MAC: &str = "02:aa:bb:cc:dd:ee";

pub type TestOrchestrator = Orchestrator<StaticProbe, StaticNeighborTable, ScriptedConnector>;

/// One scripted device plus a journal directory that outlives individual
/// orchestrators, so tests can model process restarts.
pub struct Bench {
    pub device: ScriptedDevice,
    pub journal_dir: TempDir,
    pub hardware_address: &'static str,
    pub recovery_attempts: u32,
    pub stage_overrides: &'static str,
    pub probe_answers: Option<usize>,
}

impl Bench {
    pub fn new() -> Self {
        Self {
            device: ScriptedDevice::new(DEVICE_ADDRESS),
            journal_dir: TempDir::new().expect("temp dir"),
            hardware_address: TELTONIKA_MAC,
            recovery_attempts: 3,
            stage_overrides: "",
            probe_answers: None,
        }
    }

    pub fn journal_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.journal_dir.path().to_path_buf()).expect("utf-8 temp dir")
    }

    /// Builds a fresh orchestrator, as a new process would.
    pub fn orchestrator(&self, kind: PipelineKind, stages: &[&str], fresh: bool) -> TestOrchestrator {
        let catalog = StageCatalog::builtin(&CatalogDefaults::default())
            .apply_overrides(Utf8Path::new("stages.toml"), self.stage_overrides)
            .expect("stage overrides apply");
        let pipeline = if stages.is_empty() {
            Pipeline::for_kind(kind, &catalog)
        } else {
            Pipeline::from_names(kind, stages, &catalog)
        }
        .expect("pipeline builds");
        let templates = RoleTemplates::new(&RoleSettings::default()).expect("templates build");

        let plan = CyclePlan {
            range: "192.168.1.0/29".parse().expect("range parses"),
            credentials: Credentials::new("root"),
            pipeline,
            executor: StageExecutor::new(Arc::new(catalog)),
            configurator: NetworkRoleConfigurator::new(templates, RoleCommands::default()),
            recovery: RecoveryPolicy::new(self.recovery_attempts, Duration::from_millis(1))
                .expect("valid recovery policy"),
            transport: RecoveryPolicy::new(2, Duration::from_millis(1))
                .expect("valid transport policy"),
            journal_dir: self.journal_path(),
            fresh_journal: fresh,
        };
        let probe = self.probe_answers.map_or_else(
            || StaticProbe::reachable([DEVICE_ADDRESS]),
            |budget| StaticProbe::reachable([DEVICE_ADDRESS]).answering_at_most(budget),
        );
        let scanner = NetworkScanner::new(
            probe,
            4,
            Duration::from_millis(100),
        )
        .expect("scanner builds");
        let resolver = IdentityResolver::new(
            StaticNeighborTable::default().with_entry(DEVICE_ADDRESS, self.hardware_address),
            AuthorizationPolicy::new(Vec::new()),
        );
        Orchestrator::new(
            scanner,
            resolver,
            ScriptedConnector::new(self.device.clone()),
            plan,
        )
    }
}

pub fn context(role: Role) -> OrchestratorContext {
    context_with_reachability(role, Duration::from_millis(200))
}

pub fn context_with_reachability(role: Role, reachability_timeout: Duration) -> OrchestratorContext {
    OrchestratorContext::new(
        CancellationToken::new(),
        RunSettings {
            role,
            mode: RunMode::Once,
            cycle_cooldown: Duration::from_millis(5),
            connect_timeout: Duration::from_millis(100),
            reachability_timeout,
            reachability_poll: Duration::from_millis(5),
        },
    )
}

pub fn journal_records(report: &CycleReport) -> Vec<JournalRecord> {
    let path = report.journal.as_ref().expect("cycle opened a journal");
    std::fs::read_to_string(path)
        .expect("journal readable")
        .lines()
        .map(|line| serde_json::from_str(line).expect("journal line parses"))
        .collect()
}

pub fn stage_markers(records: &[JournalRecord]) -> Vec<(StageId, StageStatus)> {
    records
        .iter()
        .filter_map(|record| match record {
            JournalRecord::Stage { stage, status, .. } => Some((*stage, *status)),
            _ => None,
        })
        .collect()
}

pub fn notes(records: &[JournalRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| match record {
            JournalRecord::Note { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
