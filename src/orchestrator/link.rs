//! Session lifecycle for the device being orchestrated.
//!
//! The link owns at most one open session. Any transport fault or network
//! restart drops it; the next [`DeviceLink::open`] reconnects through the
//! connect retry policy.

use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::context::OrchestratorContext;
use crate::discovery::ReachabilityProbe;
use crate::recovery::{Attempt, Recoverable, RecoveryError, RecoveryPolicy};
use crate::session::{Connector, Credentials, RemoteSession, SessionError};

/// Why the device could not be reached.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LinkError {
    /// Every connection attempt failed.
    #[error("could not connect to {address} after {attempts} attempts: {message}")]
    Connect {
        /// Device address.
        address: Ipv4Addr,
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        message: String,
    },
    /// The device stopped answering probes.
    #[error("{address} did not answer probes within {waited_secs}s")]
    Unreachable {
        /// Device address.
        address: Ipv4Addr,
        /// Time spent waiting.
        waited_secs: u64,
    },
    /// Shutdown was requested while waiting.
    #[error("shutdown requested")]
    Cancelled,
}

pub(super) struct DeviceLink<'a, C: Connector, P> {
    connector: &'a C,
    probe: &'a P,
    credentials: &'a Credentials,
    address: Ipv4Addr,
    policy: RecoveryPolicy,
    probe_timeout: Duration,
    session: Option<C::Session>,
}

impl<'a, C, P> DeviceLink<'a, C, P>
where
    C: Connector,
    P: ReachabilityProbe,
{
    pub(super) const fn new(
        connector: &'a C,
        probe: &'a P,
        credentials: &'a Credentials,
        address: Ipv4Addr,
        policy: RecoveryPolicy,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            probe,
            credentials,
            address,
            policy,
            probe_timeout,
            session: None,
        }
    }

    /// Returns the open session, connecting first when there is none.
    pub(super) async fn open(
        &mut self,
        ctx: &OrchestratorContext,
    ) -> Result<&mut C::Session, LinkError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => self.connect(ctx).await?,
        };
        Ok(self.session.insert(session))
    }

    /// Closes the session, if any. Close failures are logged only.
    pub(super) async fn close(&mut self) {
        if let Some(mut session) = self.session.take()
            && let Err(err) = session.close().await
        {
            tracing::debug!(address = %self.address, error = %err, "session close failed");
        }
    }

    /// Drops the session, waits for the device to answer again, and
    /// reconnects. Used after anything that restarts device networking.
    pub(super) async fn reestablish(&mut self, ctx: &OrchestratorContext) -> Result<(), LinkError> {
        self.close().await;
        self.wait_reachable(ctx).await?;
        self.open(ctx).await?;
        Ok(())
    }

    async fn wait_reachable(&self, ctx: &OrchestratorContext) -> Result<(), LinkError> {
        let settings = ctx.settings();
        let started = Instant::now();
        loop {
            ctx.ensure_active().map_err(|_| LinkError::Cancelled)?;
            if self.probe.probe(self.address, self.probe_timeout).await {
                tracing::debug!(
                    address = %self.address,
                    waited_ms = started.elapsed().as_millis(),
                    "device reachable"
                );
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= settings.reachability_timeout {
                return Err(LinkError::Unreachable {
                    address: self.address,
                    waited_secs: waited.as_secs(),
                });
            }
            tracing::info!(
                address = %self.address,
                waited_secs = waited.as_secs(),
                limit_secs = settings.reachability_timeout.as_secs(),
                "waiting for device to answer"
            );
            let pause = settings
                .reachability_poll
                .min(settings.reachability_timeout.saturating_sub(waited));
            ctx.sleep(pause).await.map_err(|_| LinkError::Cancelled)?;
        }
    }

    async fn connect(&self, ctx: &OrchestratorContext) -> Result<C::Session, LinkError> {
        let mut work = Connecting {
            connector: self.connector,
            credentials: self.credentials,
            address: self.address,
            timeout: ctx.settings().connect_timeout,
        };
        match self.policy.run(ctx, "connect", &mut work).await {
            Ok(session) => {
                tracing::debug!(address = %self.address, "session established");
                Ok(session)
            }
            Err(RecoveryError::Exhausted {
                attempts,
                last_failure,
                ..
            }) => Err(LinkError::Connect {
                address: self.address,
                attempts,
                message: last_failure,
            }),
            Err(RecoveryError::Failed {
                attempt, reason, ..
            }) => Err(LinkError::Connect {
                address: self.address,
                attempts: attempt,
                message: reason,
            }),
            Err(RecoveryError::Cancelled) => Err(LinkError::Cancelled),
            Err(RecoveryError::Aborted(never)) => match never {},
        }
    }
}

struct Connecting<'a, C> {
    connector: &'a C,
    credentials: &'a Credentials,
    address: Ipv4Addr,
    timeout: Duration,
}

impl<C: Connector> Recoverable for Connecting<'_, C> {
    type Output = C::Session;
    type Error = Infallible;

    async fn attempt(
        &mut self,
        _ctx: &OrchestratorContext,
        _attempt: u32,
    ) -> Result<Attempt<C::Session>, Infallible> {
        let result = self
            .connector
            .connect(self.address, self.credentials, self.timeout)
            .await;
        Ok(match result {
            Ok(session) => Attempt::Succeeded(session),
            // A missing local client will not appear between attempts.
            Err(err @ SessionError::Spawn { .. }) => Attempt::GiveUp(err.to_string()),
            Err(err) => Attempt::Retry(err.to_string()),
        })
    }

    async fn remediate(&mut self, _ctx: &OrchestratorContext, _attempt: u32) -> Result<(), Infallible> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunSettings;
    use crate::process::ProcessError;
    use crate::session::SshConnector;
    use crate::test_support::{ScriptedConnector, ScriptedDevice, ScriptedRunner, StaticProbe};
    use tokio_util::sync::CancellationToken;

    const ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    fn context() -> OrchestratorContext {
        OrchestratorContext::new(
            CancellationToken::new(),
            RunSettings {
                reachability_timeout: Duration::from_millis(50),
                reachability_poll: Duration::from_millis(5),
                ..RunSettings::default()
            },
        )
    }

    fn policy(max_attempts: u32) -> RecoveryPolicy {
        RecoveryPolicy::new(max_attempts, Duration::from_millis(1)).expect("valid policy")
    }

    #[tokio::test]
    async fn open_reuses_the_session() {
        let device = ScriptedDevice::new(ADDRESS);
        let connector = ScriptedConnector::new(device.clone());
        let probe = StaticProbe::reachable([ADDRESS]);
        let credentials = Credentials::new("root");
        let mut link = DeviceLink::new(
            &connector,
            &probe,
            &credentials,
            ADDRESS,
            policy(1),
            Duration::from_secs(1),
        );

        link.open(&context()).await.expect("first open");
        link.open(&context()).await.expect("second open");

        assert_eq!(device.connect_count(), 1);
    }

    #[tokio::test]
    async fn refused_connections_are_retried() {
        let device = ScriptedDevice::new(ADDRESS);
        device.refuse_connections(2);
        let connector = ScriptedConnector::new(device.clone());
        let probe = StaticProbe::reachable([ADDRESS]);
        let credentials = Credentials::new("root");
        let mut link = DeviceLink::new(
            &connector,
            &probe,
            &credentials,
            ADDRESS,
            policy(3),
            Duration::from_secs(1),
        );

        link.open(&context()).await.expect("third attempt connects");
        assert_eq!(device.connect_count(), 1);
    }

    #[tokio::test]
    async fn connect_gives_up_after_the_bound() {
        let device = ScriptedDevice::new(ADDRESS);
        device.refuse_connections(5);
        let connector = ScriptedConnector::new(device);
        let probe = StaticProbe::reachable([ADDRESS]);
        let credentials = Credentials::new("root");
        let mut link = DeviceLink::new(
            &connector,
            &probe,
            &credentials,
            ADDRESS,
            policy(2),
            Duration::from_secs(1),
        );

        let result = link.open(&context()).await.map(|_| ());
        assert!(matches!(result, Err(LinkError::Connect { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn missing_ssh_client_is_not_retried() {
        let runner = ScriptedRunner::new();
        runner.push_error(ProcessError::Spawn {
            program: String::from("ssh"),
            message: String::from("No such file or directory"),
        });
        let connector = SshConnector::new(runner.clone(), "ssh", "sshpass");
        let probe = StaticProbe::reachable([ADDRESS]);
        let credentials = Credentials::new("root");
        let mut link = DeviceLink::new(
            &connector,
            &probe,
            &credentials,
            ADDRESS,
            policy(3),
            Duration::from_secs(1),
        );

        let result = link.open(&context()).await.map(|_| ());
        assert!(
            matches!(result, Err(LinkError::Connect { attempts: 1, .. })),
            "unexpected result: {result:?}"
        );
        assert_eq!(runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn reestablish_reconnects_after_close() {
        let device = ScriptedDevice::new(ADDRESS);
        let connector = ScriptedConnector::new(device.clone());
        let probe = StaticProbe::reachable([ADDRESS]);
        let credentials = Credentials::new("root");
        let mut link = DeviceLink::new(
            &connector,
            &probe,
            &credentials,
            ADDRESS,
            policy(1),
            Duration::from_secs(1),
        );

        link.open(&context()).await.expect("open");
        link.reestablish(&context()).await.expect("reestablish");

        assert_eq!(device.connect_count(), 2);
        assert_eq!(device.close_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_device_times_out() {
        let device = ScriptedDevice::new(ADDRESS);
        let connector = ScriptedConnector::new(device.clone());
        let probe = StaticProbe::default();
        let credentials = Credentials::new("root");
        let mut link = DeviceLink::new(
            &connector,
            &probe,
            &credentials,
            ADDRESS,
            policy(1),
            Duration::from_secs(1),
        );

        let result = link.reestablish(&context()).await;

        assert!(matches!(result, Err(LinkError::Unreachable { .. })));
        assert!(probe.probe_count() >= 2);
        assert_eq!(device.connect_count(), 0);
    }
}
