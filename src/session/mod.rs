//! Remote command channel to a device.
//!
//! A session is an authenticated channel that executes commands one at a
//! time. Sessions never survive a network restart on the device: callers
//! close the handle and connect again after any reconfiguration. Connection
//! failures are returned to the caller, never retried here.

use std::fmt;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::process::CommandOutput;

mod ssh;

pub use ssh::{SshConnector, SshSession};

/// Future returned by session operations.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// Transport faults raised by sessions and connectors.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// The channel could not be established.
    #[error("failed to connect to {address}: {message}")]
    Connect {
        /// Device address.
        address: Ipv4Addr,
        /// Failure description.
        message: String,
    },
    /// A command outlived its timeout.
    #[error("command on {address} timed out after {timeout_secs}s: {command}")]
    Timeout {
        /// Device address.
        address: Ipv4Addr,
        /// Command that was running.
        command: String,
        /// Elapsed timeout in whole seconds.
        timeout_secs: u64,
    },
    /// The local client could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Local program.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The channel dropped while a command was running.
    #[error("channel to {address} dropped: {message}")]
    Channel {
        /// Device address.
        address: Ipv4Addr,
        /// Failure description.
        message: String,
    },
    /// The session was used after `close`.
    #[error("session to {address} is closed")]
    Closed {
        /// Device address.
        address: Ipv4Addr,
    },
}

/// Login material for a device.
#[derive(Clone, Eq, PartialEq)]
pub struct Credentials {
    /// Login user.
    pub user: String,
    /// Password, when password authentication is used.
    pub password: Option<String>,
    /// Private key file, when key authentication is used.
    pub identity_file: Option<Utf8PathBuf>,
    /// Remote port.
    pub port: u16,
}

impl Credentials {
    /// Key- or agent-based credentials for `user` on port 22.
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
            identity_file: None,
            port: 22,
        }
    }

    /// Sets the login password.
    #[must_use]
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Sets the private key file.
    #[must_use]
    pub fn with_identity_file(mut self, identity_file: Option<Utf8PathBuf>) -> Self {
        self.identity_file = identity_file;
        self
    }

    /// Sets the remote port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .field("port", &self.port)
            .finish()
    }
}

/// An open command channel to one device.
pub trait RemoteSession: Send {
    /// Address of the device this session talks to.
    fn address(&self) -> Ipv4Addr;

    /// Runs `command` on the device and waits for it to exit.
    ///
    /// A non-zero exit is returned as output, not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] for transport faults: timeouts, dropped
    /// channels, or use after close.
    fn run<'a>(&'a mut self, command: &'a str, timeout: Duration) -> SessionFuture<'a, CommandOutput>;

    /// Releases the channel. Further `run` calls fail with
    /// [`SessionError::Closed`].
    fn close(&mut self) -> SessionFuture<'_, ()>;
}

/// Opens sessions.
pub trait Connector: Send + Sync {
    /// Session type produced by this connector.
    type Session: RemoteSession;

    /// Establishes a session to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connect`] when the device refuses or does not
    /// answer within `timeout`.
    fn connect<'a>(
        &'a self,
        address: Ipv4Addr,
        credentials: &'a Credentials,
        timeout: Duration,
    ) -> SessionFuture<'a, Self::Session>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials::new("root").with_password(Some(String::from("s3cret")));
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("s3cret"), "password leaked: {debug}");
        assert!(debug.contains("<redacted>"));
    }
}
