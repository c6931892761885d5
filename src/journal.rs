//! Durable per-device checkpoint journal.
//!
//! Each device run appends JSON records, one per line, to
//! `<journal_dir>/<AA-BB-CC-DD-EE-FF>_<run start>.jsonl`. A stage is complete
//! if and only if a `completed` record for its identifier is present. The
//! file is the only state that survives a restart.

use std::collections::BTreeSet;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{
    ambient_authority,
    fs_utf8::{Dir, OpenOptions},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::HardwareAddress;
use crate::stage::StageId;

const JOURNAL_EXTENSION: &str = ".jsonl";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// Lifecycle marker for a stage.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The stage began executing.
    Started,
    /// The stage's terminal action succeeded.
    Completed,
    /// The stage failed.
    Failed,
}

/// One journal line.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Stage lifecycle marker.
    Stage {
        /// Stage concerned.
        stage: StageId,
        /// Marker type.
        status: StageStatus,
        /// When the marker was written.
        at: DateTime<Utc>,
        /// Failure reason or summary.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Free-text audit line.
    Note {
        /// Operator-readable text.
        text: String,
        /// When the note was written.
        at: DateTime<Utc>,
    },
    /// Cycle summary.
    Cycle {
        /// Cycle number within the orchestrator's lifetime.
        number: u64,
        /// Outcome label.
        outcome: String,
        /// Last stage attempted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage_reached: Option<StageId>,
        /// When the cycle ended.
        at: DateTime<Utc>,
    },
}

/// Errors raised by journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// File system access failed.
    #[error("journal {path}: {source}")]
    Io {
        /// File or directory concerned.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// A record could not be encoded.
    #[error("failed to encode journal record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only checkpoint store for one device run.
#[derive(Debug)]
pub struct CheckpointJournal {
    dir: Dir,
    path: Utf8PathBuf,
    file_name: String,
    completed: BTreeSet<StageId>,
}

impl CheckpointJournal {
    /// Opens the newest journal for `device` in `directory`, or creates one
    /// named after `started_at`. With `fresh` set, a new journal is always
    /// created.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the directory or file cannot be
    /// accessed.
    pub fn open(
        directory: &Utf8Path,
        device: HardwareAddress,
        started_at: DateTime<Utc>,
        fresh: bool,
    ) -> Result<Self, JournalError> {
        let io_error = |source| JournalError::Io {
            path: directory.to_path_buf(),
            source,
        };
        Dir::create_ambient_dir_all(directory, ambient_authority()).map_err(io_error)?;
        let dir = Dir::open_ambient_dir(directory, ambient_authority()).map_err(io_error)?;

        let existing = if fresh {
            None
        } else {
            newest_journal(&dir, device).map_err(io_error)?
        };
        let file_name = existing.unwrap_or_else(|| journal_file_name(device, started_at));
        let path = directory.join(&file_name);

        let mut journal = Self {
            dir,
            path,
            file_name,
            completed: BTreeSet::new(),
        };
        journal.load()?;
        tracing::info!(
            journal = %journal.path,
            completed = journal.completed.len(),
            "checkpoint journal opened"
        );
        Ok(journal)
    }

    /// Location of the journal file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Whether a completion record for `stage` exists.
    #[must_use]
    pub fn has_completed(&self, stage: StageId) -> bool {
        self.completed.contains(&stage)
    }

    /// Stages with completion records, in identifier order.
    pub fn completed(&self) -> impl Iterator<Item = StageId> + '_ {
        self.completed.iter().copied()
    }

    /// Records that `stage` began.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the record cannot be written.
    pub fn mark_started(&mut self, stage: StageId) -> Result<(), JournalError> {
        self.write_stage(stage, StageStatus::Started, None)
    }

    /// Records that `stage` finished successfully. Call only after the
    /// stage's terminal action succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the record cannot be written.
    pub fn mark_completed(&mut self, stage: StageId) -> Result<(), JournalError> {
        self.write_stage(stage, StageStatus::Completed, None)?;
        self.completed.insert(stage);
        Ok(())
    }

    /// Records that `stage` failed with `reason`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the record cannot be written.
    pub fn mark_failed(&mut self, stage: StageId, reason: &str) -> Result<(), JournalError> {
        self.write_stage(stage, StageStatus::Failed, Some(reason.to_owned()))
    }

    /// Appends a free-text audit line.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the record cannot be written.
    pub fn append(&mut self, text: impl Into<String>) -> Result<(), JournalError> {
        self.write(&JournalRecord::Note {
            text: text.into(),
            at: Utc::now(),
        })
    }

    /// Appends a cycle summary.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the record cannot be written.
    pub fn record_cycle(
        &mut self,
        number: u64,
        outcome: &str,
        stage_reached: Option<StageId>,
    ) -> Result<(), JournalError> {
        self.write(&JournalRecord::Cycle {
            number,
            outcome: outcome.to_owned(),
            stage_reached,
            at: Utc::now(),
        })
    }

    /// Reads every intact record back from disk.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the file cannot be read.
    pub fn records(&self) -> Result<Vec<JournalRecord>, JournalError> {
        Ok(parse_records(&self.read_contents()?))
    }

    fn write_stage(
        &mut self,
        stage: StageId,
        status: StageStatus,
        message: Option<String>,
    ) -> Result<(), JournalError> {
        self.write(&JournalRecord::Stage {
            stage,
            status,
            at: Utc::now(),
            message,
        })
    }

    fn write(&mut self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.append_raw(&line)
    }

    fn append_raw(&self, text: &str) -> Result<(), JournalError> {
        let io_error = |source| JournalError::Io {
            path: self.path.clone(),
            source,
        };
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        let mut file = self
            .dir
            .open_with(&self.file_name, &options)
            .map_err(io_error)?;
        file.write_all(text.as_bytes()).map_err(io_error)?;
        file.sync_data().map_err(io_error)
    }

    fn read_contents(&self) -> Result<String, JournalError> {
        match self.dir.read_to_string(&self.file_name) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(source) => Err(JournalError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn load(&mut self) -> Result<(), JournalError> {
        let contents = self.read_contents()?;
        self.completed = parse_records(&contents)
            .into_iter()
            .filter_map(|record| match record {
                JournalRecord::Stage {
                    stage,
                    status: StageStatus::Completed,
                    ..
                } => Some(stage),
                _ => None,
            })
            .collect();
        if !contents.is_empty() && !contents.ends_with('\n') {
            // Terminate the torn line so the next record starts cleanly.
            self.append_raw("\n")?;
        }
        Ok(())
    }
}

/// Deterministic file name for a device run.
#[must_use]
pub fn journal_file_name(device: HardwareAddress, started_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}{JOURNAL_EXTENSION}",
        device.file_stem(),
        started_at.format(TIMESTAMP_FORMAT)
    )
}

fn newest_journal(dir: &Dir, device: HardwareAddress) -> io::Result<Option<String>> {
    let prefix = format!("{}_", device.file_stem());
    let mut newest: Option<String> = None;
    for entry in dir.entries()? {
        let name = entry?.file_name()?;
        if !name.starts_with(&prefix) || !name.ends_with(JOURNAL_EXTENSION) {
            continue;
        }
        if newest.as_ref().is_none_or(|current| name > *current) {
            newest = Some(name);
        }
    }
    Ok(newest)
}

fn parse_records(contents: &str) -> Vec<JournalRecord> {
    let mut lines = contents.lines().enumerate().peekable();
    let mut records = Vec::new();
    while let Some((index, line)) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) if lines.peek().is_none() && !contents.ends_with('\n') => {
                tracing::warn!(line = index + 1, error = %err, "ignoring torn trailing journal line");
            }
            Err(err) => {
                tracing::warn!(line = index + 1, error = %err, "ignoring unreadable journal line");
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Workspace {
        _tmp: TempDir,
        dir: Utf8PathBuf,
    }

    #[fixture]
    fn workspace() -> Workspace {
        let tmp = TempDir::new().expect("tempdir");
        let dir = Utf8PathBuf::from_path_buf(tmp.path().join("journals"))
            .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
        Workspace { _tmp: tmp, dir }
    }

    fn device() -> HardwareAddress {
        "00:1e:42:aa:bb:cc".parse().expect("address parses")
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn file_names_are_deterministic() {
        assert_eq!(
            journal_file_name(device(), at(9)),
            "00-1E-42-AA-BB-CC_20240501T090000000Z.jsonl"
        );
    }

    #[rstest]
    fn completions_survive_reopen(workspace: Workspace) {
        let mut journal =
            CheckpointJournal::open(&workspace.dir, device(), at(9), false).expect("opens");
        journal.mark_started(StageId::SystemPrep).expect("write");
        journal.mark_completed(StageId::SystemPrep).expect("write");
        journal.mark_started(StageId::NetworkRole).expect("write");
        journal
            .mark_failed(StageId::NetworkRole, "verify failed")
            .expect("write");
        let first_path = journal.path().to_path_buf();
        drop(journal);

        let reopened =
            CheckpointJournal::open(&workspace.dir, device(), at(10), false).expect("opens");
        assert_eq!(reopened.path(), first_path);
        assert!(reopened.has_completed(StageId::SystemPrep));
        assert!(!reopened.has_completed(StageId::NetworkRole));
    }

    #[rstest]
    fn started_without_completion_means_rerun(workspace: Workspace) {
        let mut journal =
            CheckpointJournal::open(&workspace.dir, device(), at(9), false).expect("opens");
        journal.mark_started(StageId::PackageInstall).expect("write");
        journal.append("package-install completed soon").expect("write");

        assert!(!journal.has_completed(StageId::PackageInstall));
    }

    #[rstest]
    fn fresh_journal_ignores_history(workspace: Workspace) {
        let mut journal =
            CheckpointJournal::open(&workspace.dir, device(), at(9), false).expect("opens");
        journal.mark_completed(StageId::SystemPrep).expect("write");
        drop(journal);

        let fresh = CheckpointJournal::open(&workspace.dir, device(), at(10), true).expect("opens");
        assert!(!fresh.has_completed(StageId::SystemPrep));
        assert!(fresh.path().as_str().contains("20240501T100000000Z"));
    }

    #[rstest]
    fn newest_journal_wins(workspace: Workspace) {
        let mut older =
            CheckpointJournal::open(&workspace.dir, device(), at(8), true).expect("opens");
        older.mark_completed(StageId::SystemPrep).expect("write");
        let mut newer =
            CheckpointJournal::open(&workspace.dir, device(), at(9), true).expect("opens");
        newer.mark_completed(StageId::Validate).expect("write");

        let reopened =
            CheckpointJournal::open(&workspace.dir, device(), at(12), false).expect("opens");
        assert!(reopened.has_completed(StageId::Validate));
        assert!(!reopened.has_completed(StageId::SystemPrep));
    }

    #[rstest]
    fn other_devices_are_ignored(workspace: Workspace) {
        let other: HardwareAddress = "94:83:c4:00:00:01".parse().expect("address parses");
        let mut journal =
            CheckpointJournal::open(&workspace.dir, other, at(9), false).expect("opens");
        journal.mark_completed(StageId::SystemPrep).expect("write");

        let mine = CheckpointJournal::open(&workspace.dir, device(), at(10), false).expect("opens");
        assert!(!mine.has_completed(StageId::SystemPrep));
    }

    #[rstest]
    fn torn_trailing_line_is_ignored_and_terminated(workspace: Workspace) {
        let mut journal =
            CheckpointJournal::open(&workspace.dir, device(), at(9), false).expect("opens");
        journal.mark_completed(StageId::SystemPrep).expect("write");
        let path = journal.path().to_path_buf();
        drop(journal);

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open for append");
        file.write_all(br#"{"kind":"stage","stage":"network-role","sta"#)
            .expect("write torn line");
        drop(file);

        let mut reopened =
            CheckpointJournal::open(&workspace.dir, device(), at(10), false).expect("opens");
        assert!(reopened.has_completed(StageId::SystemPrep));
        assert!(!reopened.has_completed(StageId::NetworkRole));

        reopened.mark_completed(StageId::NetworkRole).expect("write");
        let records = reopened.records().expect("records read");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn records_use_tagged_json() {
        let record = JournalRecord::Stage {
            stage: StageId::InternetCheck,
            status: StageStatus::Completed,
            at: at(9),
            message: None,
        };
        let json = serde_json::to_string(&record).expect("encodes");
        assert_eq!(
            json,
            r#"{"kind":"stage","stage":"internet-check","status":"completed","at":"2024-05-01T09:00:00Z"}"#
        );
    }
}
