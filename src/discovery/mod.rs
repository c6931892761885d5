//! Concurrent reachability sweeps over an address range.
//!
//! A sweep probes every host in the range with a bounded number of probes in
//! flight and yields reachable hosts as the probes finish. Each sweep is a
//! fresh, finite pass; nothing is remembered between sweeps.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::OrchestratorContext;

mod probe;
mod range;

pub use probe::{
    PingProbe, ProbeFuture, ProbeMethod, ReachabilityProbe, SystemProbe, TcpProbe,
    UnknownProbeMethod,
};
pub use range::{AddressRange, MIN_PREFIX_LEN, RangeError};

/// Default number of probes allowed in flight at once.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 50;

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A host that answered a probe during a sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceCandidate {
    /// Address that answered.
    pub address: Ipv4Addr,
    /// Hardware address as read from the neighbor table, once resolved.
    pub hardware_address: Option<String>,
    /// When the host answered.
    pub reachable_at: DateTime<Utc>,
}

impl DeviceCandidate {
    /// Creates a candidate that answered just now.
    #[must_use]
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            hardware_address: None,
            reachable_at: Utc::now(),
        }
    }

    /// Attaches the resolved hardware address.
    #[must_use]
    pub fn with_hardware_address(mut self, hardware_address: Option<String>) -> Self {
        self.hardware_address = hardware_address;
        self
    }
}

/// Errors raised when constructing a scanner.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScanError {
    /// The worker pool must allow at least one probe.
    #[error("probe concurrency must be greater than zero")]
    ZeroConcurrency,
    /// Probes need a non-zero timeout.
    #[error("probe timeout must be greater than zero")]
    ZeroTimeout,
}

/// Sweeps address ranges with a bounded probe pool.
#[derive(Debug)]
pub struct NetworkScanner<P> {
    probe: Arc<P>,
    concurrency: usize,
    timeout: Duration,
}

impl<P> NetworkScanner<P>
where
    P: ReachabilityProbe + 'static,
{
    /// Creates a scanner.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError`] when `concurrency` or `timeout` is zero.
    pub fn new(probe: P, concurrency: usize, timeout: Duration) -> Result<Self, ScanError> {
        if concurrency == 0 {
            return Err(ScanError::ZeroConcurrency);
        }
        if timeout.is_zero() {
            return Err(ScanError::ZeroTimeout);
        }
        Ok(Self {
            probe: Arc::new(probe),
            concurrency,
            timeout,
        })
    }

    /// The probe used for sweeps; the orchestrator reuses it for
    /// reachability waits.
    #[must_use]
    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Per-probe timeout.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts a sweep of `range`. Probes run as the sweep is polled.
    #[must_use]
    pub fn scan(&self, range: &AddressRange, ctx: &OrchestratorContext) -> Sweep<P> {
        tracing::debug!(%range, concurrency = self.concurrency, "starting sweep");
        Sweep {
            pending: range.hosts().into_iter(),
            in_flight: JoinSet::new(),
            probe: Arc::clone(&self.probe),
            concurrency: self.concurrency,
            timeout: self.timeout,
            cancel: ctx.cancel_token().clone(),
            probed: 0,
            reachable: 0,
        }
    }
}

/// One in-progress sweep. Finite and consumed as it is read.
#[derive(Debug)]
pub struct Sweep<P> {
    pending: std::vec::IntoIter<Ipv4Addr>,
    in_flight: JoinSet<(Ipv4Addr, bool)>,
    probe: Arc<P>,
    concurrency: usize,
    timeout: Duration,
    cancel: CancellationToken,
    probed: usize,
    reachable: usize,
}

impl<P> Sweep<P>
where
    P: ReachabilityProbe + 'static,
{
    /// Waits for the next reachable host. Returns `None` once every host has
    /// been probed or shutdown was requested.
    pub async fn next(&mut self) -> Option<DeviceCandidate> {
        loop {
            if self.cancel.is_cancelled() {
                self.abandon();
                return None;
            }
            self.top_up();

            let cancel = self.cancel.clone();
            let next = tokio::select! {
                () = cancel.cancelled() => None,
                joined = self.in_flight.join_next() => Some(joined),
            };
            let Some(joined) = next else {
                self.abandon();
                return None;
            };

            match joined {
                None => {
                    tracing::debug!(
                        probed = self.probed,
                        reachable = self.reachable,
                        "sweep finished"
                    );
                    return None;
                }
                Some(Ok((address, true))) => {
                    self.probed += 1;
                    self.reachable += 1;
                    return Some(DeviceCandidate::new(address));
                }
                Some(Ok((_, false))) => self.probed += 1,
                Some(Err(err)) => {
                    self.probed += 1;
                    tracing::warn!(error = %err, "probe task failed");
                }
            }
        }
    }

    /// Drains the sweep, returning reachable hosts in address order.
    pub async fn collect(mut self) -> Vec<DeviceCandidate> {
        let mut found = Vec::new();
        while let Some(candidate) = self.next().await {
            found.push(candidate);
        }
        found.sort_by_key(|candidate| candidate.address);
        found
    }

    fn top_up(&mut self) {
        while self.in_flight.len() < self.concurrency {
            let Some(address) = self.pending.next() else {
                break;
            };
            let probe = Arc::clone(&self.probe);
            let limit = self.timeout;
            self.in_flight.spawn(async move {
                let alive = probe.probe(address, limit).await;
                (address, alive)
            });
        }
    }

    fn abandon(&mut self) {
        self.in_flight.abort_all();
        self.pending = Vec::new().into_iter();
    }
}
