//! Core library for the `bringup` appliance provisioning tool.
//!
//! The crate sweeps a local address range for network appliances, authorizes
//! them by hardware address, and walks an authorized device through an
//! ordered, resumable pipeline of provisioning stages over SSH. Progress is
//! checkpointed to a per-device journal so an interrupted run resumes where it
//! stopped, and stages that touch networking recover through a bounded
//! reload-and-reconnect loop.

pub mod config;
pub mod context;
pub mod discovery;
pub mod identity;
pub mod journal;
pub mod orchestrator;
pub mod process;
pub mod recovery;
pub mod role;
pub mod session;
pub mod stage;
pub mod test_support;

pub use config::{BringupConfig, ConfigError, NetworkConfig};
pub use context::{OrchestratorContext, RunMode, RunSettings};
pub use discovery::{AddressRange, DeviceCandidate, NetworkScanner, ReachabilityProbe};
pub use identity::{AuthorizationPolicy, HardwareAddress, IdentityResolver, Verdict};
pub use journal::{CheckpointJournal, JournalError};
pub use orchestrator::{CycleOutcome, CyclePlan, CycleReport, DiscoveryReport, Orchestrator};
pub use recovery::{RecoveryPolicy, Recoverable};
pub use role::{NetworkRoleConfigurator, Role};
pub use session::{Connector, Credentials, RemoteSession, SessionError};
pub use stage::{Pipeline, PipelineKind, StageCatalog, StageExecutor, StageId};
