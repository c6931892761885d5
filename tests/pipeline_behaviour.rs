//! End-to-end pipeline behaviour against scripted devices.

mod common;

use std::time::{Duration, Instant};

use bringup::journal::{JournalRecord, StageStatus};
use bringup::orchestrator::CycleOutcome;
use bringup::role::{Role, RoleSettings, RoleTemplates};
use bringup::stage::{PipelineKind, StageId};
use rstest::{fixture, rstest};

use common::{
    Bench, UNKNOWN_MAC, context, context_with_reachability, journal_records, notes, stage_markers,
};

const RELOAD: &str = "/etc/init.d/network reload";
const INTERNET_CHECK: &str = "ping -c 3";

#[fixture]
fn bench() -> Bench {
    Bench::new()
}

#[rstest]
#[tokio::test]
async fn connectivity_check_recovers_through_network_reload(bench: Bench) {
    bench.device.fail_next(INTERNET_CHECK, 2);
    let mut orchestrator = bench.orchestrator(PipelineKind::Network, &[], false);

    let report = orchestrator.run_cycle(&context(Role::Forward)).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(bench.device.count_matching(INTERNET_CHECK), 3);
    // One reload from the role change, two from recovery.
    assert_eq!(bench.device.count_matching(RELOAD), 3);

    let records = journal_records(&report);
    let recoveries = notes(&records)
        .iter()
        .filter(|note| note.contains("running network-reload"))
        .count();
    assert_eq!(recoveries, 2);
    assert_eq!(
        stage_markers(&records),
        vec![
            (StageId::NetworkRole, StageStatus::Started),
            (StageId::NetworkRole, StageStatus::Completed),
            (StageId::InternetCheck, StageStatus::Started),
            (StageId::InternetCheck, StageStatus::Completed),
        ]
    );
}

#[rstest]
#[tokio::test]
async fn full_pipeline_completes_every_stage_in_order(bench: Bench) {
    bench.device.fail_next(INTERNET_CHECK, 2);
    let mut orchestrator = bench.orchestrator(PipelineKind::Full, &[], false);

    let report = orchestrator.run_cycle(&context(Role::Forward)).await;

    let expected = vec![
        StageId::SystemPrep,
        StageId::NetworkRole,
        StageId::InternetCheck,
        StageId::PackageInstall,
        StageId::ContainerRuntime,
        StageId::ServiceDeploy,
        StageId::MeshJoin,
        StageId::Validate,
    ];
    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.completed, expected);
    let completions: Vec<StageId> = stage_markers(&journal_records(&report))
        .into_iter()
        .filter(|(_, status)| *status == StageStatus::Completed)
        .map(|(stage, _)| stage)
        .collect();
    assert_eq!(completions, expected);
    let snapshot = bench.device.config_snapshot();
    assert_eq!(
        snapshot.get("network.lan.ipaddr").map(String::as_str),
        Some("192.168.1.1")
    );
}

#[rstest]
#[tokio::test]
async fn exhausted_recovery_fails_the_cycle_at_that_stage(bench: Bench) {
    bench.device.always_fail(INTERNET_CHECK);
    let mut orchestrator = bench.orchestrator(PipelineKind::Network, &[], false);

    let report = orchestrator.run_cycle(&context(Role::Forward)).await;

    assert!(matches!(
        report.outcome,
        CycleOutcome::Failed {
            stage: Some(StageId::InternetCheck),
            ..
        }
    ));
    assert_eq!(bench.device.count_matching(INTERNET_CHECK), 3);
    assert_eq!(bench.device.count_matching(RELOAD), 3);

    let records = journal_records(&report);
    assert_eq!(
        stage_markers(&records).last(),
        Some(&(StageId::InternetCheck, StageStatus::Failed))
    );
    assert!(records.iter().any(|record| matches!(
        record,
        JournalRecord::Cycle { outcome, stage_reached: Some(StageId::InternetCheck), .. }
            if outcome == "failed"
    )));
}

#[rstest]
#[tokio::test]
async fn role_stage_is_bounded_by_its_aggregate_timeout(mut bench: Bench) {
    bench.stage_overrides = "[stages.network-role]\ntimeout_secs = 1";
    // The device answers discovery, then never comes back after the role change.
    bench.probe_answers = Some(1);
    bench.recovery_attempts = 1;
    let mut orchestrator = bench.orchestrator(PipelineKind::Network, &["network-role"], false);

    let started = Instant::now();
    let report = orchestrator
        .run_cycle(&context_with_reachability(Role::Forward, Duration::from_secs(30)))
        .await;

    assert!(
        started.elapsed() < Duration::from_secs(10),
        "stage ran for {:?}",
        started.elapsed()
    );
    assert!(matches!(
        report.outcome,
        CycleOutcome::Failed {
            stage: Some(StageId::NetworkRole),
            ..
        }
    ));
    let records = journal_records(&report);
    assert!(
        notes(&records)
            .iter()
            .any(|note| note.contains("exceeded its 1s limit")),
        "notes: {:?}",
        notes(&records)
    );
}

#[rstest]
#[tokio::test]
async fn unauthorized_devices_are_never_contacted(mut bench: Bench) {
    bench.hardware_address = UNKNOWN_MAC;
    let mut orchestrator = bench.orchestrator(PipelineKind::Full, &[], false);

    let report = orchestrator.run_cycle(&context(Role::Forward)).await;

    assert_eq!(report.outcome, CycleOutcome::NoAuthorizedDevice);
    assert_eq!(report.authorized_devices, 0);
    assert_eq!(bench.device.connect_count(), 0);
    assert!(report.journal.is_none());
}

#[rstest]
#[tokio::test]
async fn restart_resumes_after_the_last_completed_stage(bench: Bench) {
    bench.device.fail_next("opkg update", 1);
    let stages = ["system-prep", "package-install"];

    let first = bench
        .orchestrator(PipelineKind::Full, &stages, false)
        .run_cycle(&context(Role::Forward))
        .await;
    assert!(matches!(
        first.outcome,
        CycleOutcome::Failed {
            stage: Some(StageId::PackageInstall),
            ..
        }
    ));

    let second = bench
        .orchestrator(PipelineKind::Full, &stages, false)
        .run_cycle(&context(Role::Forward))
        .await;

    assert_eq!(second.outcome, CycleOutcome::Succeeded);
    assert_eq!(second.skipped, vec![StageId::SystemPrep]);
    assert_eq!(second.completed, vec![StageId::PackageInstall]);
    assert_eq!(second.journal, first.journal);
    assert_eq!(bench.device.count_matching("zonename"), 1);
    assert_eq!(bench.device.count_matching("opkg update"), 2);
}

#[rstest]
#[tokio::test]
async fn fresh_journal_reruns_every_stage_with_the_same_markers(bench: Bench) {
    let stages = ["system-prep", "package-install"];

    let first = bench
        .orchestrator(PipelineKind::Full, &stages, false)
        .run_cycle(&context(Role::Forward))
        .await;
    // Journal names carry millisecond timestamps.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = bench
        .orchestrator(PipelineKind::Full, &stages, true)
        .run_cycle(&context(Role::Forward))
        .await;

    assert_eq!(first.outcome, CycleOutcome::Succeeded);
    assert_eq!(second.outcome, CycleOutcome::Succeeded);
    assert!(second.skipped.is_empty());
    assert_ne!(first.journal, second.journal);
    assert_eq!(
        stage_markers(&journal_records(&first)),
        stage_markers(&journal_records(&second))
    );
    assert_eq!(bench.device.count_matching("zonename"), 2);
}

#[rstest]
#[tokio::test]
async fn validate_pipeline_always_runs_every_stage(bench: Bench) {
    for _ in 0..2 {
        let report = bench
            .orchestrator(PipelineKind::Validate, &[], false)
            .run_cycle(&context(Role::Forward))
            .await;
        assert_eq!(report.outcome, CycleOutcome::Succeeded);
        assert!(report.skipped.is_empty());
    }

    assert_eq!(bench.device.count_matching("nslookup"), 2);
}

#[rstest]
#[tokio::test]
async fn role_change_replaces_the_previous_role(bench: Bench) {
    bench.device.seed_config("network.wan.username", "stale");

    let forward = bench
        .orchestrator(PipelineKind::Network, &["network-role"], true)
        .run_cycle(&context(Role::Forward))
        .await;
    assert_eq!(forward.outcome, CycleOutcome::Succeeded);
    let after_forward = bench.device.config_snapshot();
    assert_eq!(after_forward.get("network.wan.device").map(String::as_str), Some("eth0"));
    assert_eq!(after_forward.get("network.lan.device").map(String::as_str), Some("eth1"));
    assert!(!after_forward.contains_key("network.wan.username"));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let reverse = bench
        .orchestrator(PipelineKind::Network, &["network-role"], true)
        .run_cycle(&context(Role::Reverse))
        .await;
    assert_eq!(reverse.outcome, CycleOutcome::Succeeded);
    let after_reverse = bench.device.config_snapshot();
    assert_eq!(after_reverse.get("network.wan.device").map(String::as_str), Some("eth1"));
    assert_eq!(after_reverse.get("network.lan.device").map(String::as_str), Some("eth0"));
    let templates = RoleTemplates::new(&RoleSettings::default()).expect("templates build");
    assert_eq!(after_reverse, templates.configuration(Role::Reverse).entries());
    assert_eq!(bench.device.count_matching("-I eth1"), 1);
}
