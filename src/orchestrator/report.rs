//! Discovery and cycle reports.

use std::fmt;
use std::net::Ipv4Addr;

use camino::Utf8PathBuf;

use crate::discovery::DeviceCandidate;
use crate::identity::{HardwareAddress, Verdict};
use crate::stage::StageId;

/// A host that answered during discovery, with its verdict when its hardware
/// address resolved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveredDevice {
    /// Reachable host.
    pub candidate: DeviceCandidate,
    /// `None` when the hardware address could not be resolved.
    pub verdict: Option<Verdict>,
}

impl DiscoveredDevice {
    /// Whether the device may be orchestrated.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        self.verdict.as_ref().is_some_and(Verdict::is_authorized)
    }
}

/// Result of one discovery pass, in address order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiscoveryReport {
    /// Every reachable host.
    pub devices: Vec<DiscoveredDevice>,
}

impl DiscoveryReport {
    /// Authorized hosts with their parsed hardware addresses.
    pub fn authorized(&self) -> impl Iterator<Item = (Ipv4Addr, HardwareAddress)> + '_ {
        self.devices.iter().filter_map(|device| {
            let verdict = device.verdict.as_ref()?;
            if !verdict.is_authorized() {
                return None;
            }
            Some((device.candidate.address, verdict.parsed_address()?))
        })
    }

    /// Number of authorized hosts.
    #[must_use]
    pub fn authorized_count(&self) -> usize {
        self.authorized().count()
    }
}

/// How a cycle ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    /// Every stage in the pipeline is complete.
    Succeeded,
    /// The cycle could not proceed.
    Failed {
        /// Stage that failed; `None` when the device could not be reached.
        stage: Option<StageId>,
        /// Failure reason.
        reason: String,
    },
    /// Discovery found no authorized device.
    NoAuthorizedDevice,
    /// Shutdown was requested before the cycle finished.
    Cancelled,
}

impl CycleOutcome {
    /// Whether the cycle succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Short label recorded in journals.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::NoAuthorizedDevice => "no_authorized_device",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed {
                stage: Some(stage),
                reason,
            } => write!(formatter, "failed at {stage}: {reason}"),
            Self::Failed {
                stage: None,
                reason,
            } => write!(formatter, "failed: {reason}"),
            Self::Succeeded => formatter.write_str("succeeded"),
            Self::NoAuthorizedDevice => formatter.write_str("no authorized device found"),
            Self::Cancelled => formatter.write_str("cancelled"),
        }
    }
}

/// Summary of one cycle. Finalized when the cycle ends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CycleReport {
    /// Cycle number within the orchestrator's lifetime, starting at 1.
    pub number: u64,
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Last stage attempted.
    pub stage_reached: Option<StageId>,
    /// Authorized devices seen during discovery.
    pub authorized_devices: usize,
    /// Device orchestrated.
    pub device: Option<HardwareAddress>,
    /// Address of the device orchestrated.
    pub address: Option<Ipv4Addr>,
    /// Stages completed during this cycle, in order.
    pub completed: Vec<StageId>,
    /// Stages skipped because the journal already recorded them.
    pub skipped: Vec<StageId>,
    /// Journal written by this cycle.
    pub journal: Option<Utf8PathBuf>,
}

impl CycleReport {
    pub(super) const fn new(number: u64) -> Self {
        Self {
            number,
            outcome: CycleOutcome::NoAuthorizedDevice,
            stage_reached: None,
            authorized_devices: 0,
            device: None,
            address: None,
            completed: Vec::new(),
            skipped: Vec::new(),
            journal: None,
        }
    }
}
