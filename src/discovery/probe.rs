//! Reachability probes used by the scanner and the post-reconfiguration wait.

use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::process::{CommandRunner, Invocation, ProcessCommandRunner};

/// Future returned by [`ReachabilityProbe::probe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Answers "is anything alive at this address right now".
///
/// A failed probe is a negative answer, never an error.
pub trait ReachabilityProbe: Send + Sync {
    /// Probes `address`, giving up after `timeout`.
    fn probe(&self, address: Ipv4Addr, timeout: Duration) -> ProbeFuture<'_>;
}

/// Probes by opening a TCP connection.
///
/// A refused connection still proves the host answered, so it counts as
/// reachable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    /// Probes the given TCP port.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self { port }
    }
}

impl ReachabilityProbe for TcpProbe {
    fn probe(&self, address: Ipv4Addr, limit: Duration) -> ProbeFuture<'_> {
        Box::pin(async move {
            match timeout(limit, TcpStream::connect((address, self.port))).await {
                Ok(Ok(_)) => true,
                Ok(Err(err)) => err.kind() == io::ErrorKind::ConnectionRefused,
                Err(_) => false,
            }
        })
    }
}

/// Probes with a single ICMP echo through the system `ping` binary.
#[derive(Clone, Debug)]
pub struct PingProbe<R: CommandRunner> {
    runner: R,
    ping_bin: String,
}

impl<R: CommandRunner> PingProbe<R> {
    /// Creates a probe that runs `ping_bin` through `runner`.
    #[must_use]
    pub fn new(runner: R, ping_bin: impl Into<String>) -> Self {
        Self {
            runner,
            ping_bin: ping_bin.into(),
        }
    }

    fn invocation(&self, address: Ipv4Addr, limit: Duration) -> Invocation {
        let wait_secs = limit.as_secs().max(1);
        Invocation::new(&self.ping_bin, limit + Duration::from_secs(1))
            .args(["-c", "1", "-W"])
            .arg(wait_secs.to_string())
            .arg(address.to_string())
    }
}

impl<R: CommandRunner> ReachabilityProbe for PingProbe<R> {
    fn probe(&self, address: Ipv4Addr, limit: Duration) -> ProbeFuture<'_> {
        Box::pin(async move {
            let invocation = self.invocation(address, limit);
            self.runner
                .run(&invocation)
                .await
                .is_ok_and(|output| output.is_success())
        })
    }
}

/// Probe strategy names accepted in configuration.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ProbeMethod {
    /// TCP connect to the configured port.
    #[default]
    Tcp,
    /// ICMP echo through `ping`.
    Ping,
}

/// Raised for an unrecognised probe method name.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown probe method '{0}' (expected 'tcp' or 'ping')")]
pub struct UnknownProbeMethod(pub String);

impl FromStr for ProbeMethod {
    type Err = UnknownProbeMethod;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "ping" | "icmp" => Ok(Self::Ping),
            other => Err(UnknownProbeMethod(other.to_owned())),
        }
    }
}

/// Probe selected at runtime from configuration.
#[derive(Clone, Debug)]
pub enum SystemProbe {
    /// TCP connect probe.
    Tcp(TcpProbe),
    /// System `ping` probe.
    Ping(PingProbe<ProcessCommandRunner>),
}

impl SystemProbe {
    /// Builds the probe for `method`, using `port` for TCP probing.
    #[must_use]
    pub fn for_method(method: ProbeMethod, port: u16) -> Self {
        match method {
            ProbeMethod::Tcp => Self::Tcp(TcpProbe::new(port)),
            ProbeMethod::Ping => Self::Ping(PingProbe::new(ProcessCommandRunner, "ping")),
        }
    }
}

impl ReachabilityProbe for SystemProbe {
    fn probe(&self, address: Ipv4Addr, limit: Duration) -> ProbeFuture<'_> {
        match self {
            Self::Tcp(probe) => probe.probe(address, limit),
            Self::Ping(probe) => probe.probe(address, limit),
        }
    }
}
