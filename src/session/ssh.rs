//! Sessions backed by the system `ssh` client.
//!
//! Every command is its own `ssh` invocation. Password logins go through
//! `sshpass -e` so the secret travels in the environment, never in argv.

use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::process::{CommandOutput, CommandRunner, Invocation, ProcessCommandRunner, ProcessError};

use super::{Connector, Credentials, RemoteSession, SessionError, SessionFuture};

/// Exit status `ssh` reserves for its own failures.
const SSH_FAILURE_CODE: i32 = 255;

/// Extra time allowed on top of a command timeout for the client itself.
const CLIENT_GRACE: Duration = Duration::from_secs(5);

/// Command used to prove a freshly opened channel works.
const CONNECT_CHECK: &str = "true";

/// Connects by running a no-op command through `ssh`.
#[derive(Clone, Debug)]
pub struct SshConnector<R = ProcessCommandRunner> {
    runner: R,
    ssh_bin: String,
    sshpass_bin: String,
}

impl SshConnector<ProcessCommandRunner> {
    /// Connector that spawns real processes.
    #[must_use]
    pub fn with_process_runner(ssh_bin: impl Into<String>, sshpass_bin: impl Into<String>) -> Self {
        Self::new(ProcessCommandRunner, ssh_bin, sshpass_bin)
    }
}

impl<R: CommandRunner + Clone> SshConnector<R> {
    /// Creates a connector using `runner` to launch the client binaries.
    #[must_use]
    pub fn new(runner: R, ssh_bin: impl Into<String>, sshpass_bin: impl Into<String>) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            sshpass_bin: sshpass_bin.into(),
        }
    }
}

impl<R: CommandRunner + Clone + 'static> Connector for SshConnector<R> {
    type Session = SshSession<R>;

    fn connect<'a>(
        &'a self,
        address: Ipv4Addr,
        credentials: &'a Credentials,
        timeout: Duration,
    ) -> SessionFuture<'a, Self::Session> {
        Box::pin(async move {
            let session = SshSession {
                runner: self.runner.clone(),
                ssh_bin: self.ssh_bin.clone(),
                sshpass_bin: self.sshpass_bin.clone(),
                address,
                credentials: credentials.clone(),
                connect_timeout: timeout,
                closed: false,
            };
            let check = session.invocation(CONNECT_CHECK, timeout);
            let output = session
                .runner
                .run(&check)
                .await
                .map_err(|err| match err {
                    ProcessError::Spawn { program, message } => {
                        SessionError::Spawn { program, message }
                    }
                    ProcessError::TimedOut { .. } => SessionError::Connect {
                        address,
                        message: err.to_string(),
                    },
                })?;
            if !output.is_success() {
                return Err(SessionError::Connect {
                    address,
                    message: failure_text(&output),
                });
            }
            tracing::debug!(%address, user = %credentials.user, "ssh session established");
            Ok(session)
        })
    }
}

/// One logical session; each command is a separate `ssh` process.
#[derive(Debug)]
pub struct SshSession<R = ProcessCommandRunner> {
    runner: R,
    ssh_bin: String,
    sshpass_bin: String,
    address: Ipv4Addr,
    credentials: Credentials,
    connect_timeout: Duration,
    closed: bool,
}

impl<R: CommandRunner> SshSession<R> {
    fn invocation(&self, command: &str, timeout: Duration) -> Invocation {
        let limit = timeout + CLIENT_GRACE;
        let ssh_args = self.ssh_args(command);
        match &self.credentials.password {
            Some(password) => Invocation::new(&self.sshpass_bin, limit)
                .arg("-e")
                .arg(&self.ssh_bin)
                .args(ssh_args)
                .env("SSHPASS", password),
            None => Invocation::new(&self.ssh_bin, limit).args(ssh_args),
        }
    }

    fn ssh_args(&self, command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.credentials.port.to_string()),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
            OsString::from("-o"),
            OsString::from("LogLevel=ERROR"),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            )),
        ];

        if self.credentials.password.is_none() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if let Some(identity_file) = &self.credentials.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity_file.as_str()));
        }

        args.push(OsString::from(format!(
            "{}@{}",
            self.credentials.user, self.address
        )));
        args.push(OsString::from(command));
        args
    }
}

impl<R: CommandRunner> RemoteSession for SshSession<R> {
    fn address(&self) -> Ipv4Addr {
        self.address
    }

    fn run<'a>(&'a mut self, command: &'a str, timeout: Duration) -> SessionFuture<'a, CommandOutput> {
        Box::pin(async move {
            if self.closed {
                return Err(SessionError::Closed {
                    address: self.address,
                });
            }
            let invocation = self.invocation(command, timeout);
            let output = self.runner.run(&invocation).await.map_err(|err| match err {
                ProcessError::TimedOut { .. } => SessionError::Timeout {
                    address: self.address,
                    command: command.to_owned(),
                    timeout_secs: timeout.as_secs(),
                },
                ProcessError::Spawn { program, message } => SessionError::Spawn { program, message },
            })?;

            match output.code {
                Some(SSH_FAILURE_CODE) | None => Err(SessionError::Channel {
                    address: self.address,
                    message: failure_text(&output),
                }),
                Some(_) => Ok(output),
            }
        })
    }

    fn close(&mut self) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed {
                self.closed = true;
                tracing::debug!(address = %self.address, "ssh session closed");
            }
            Ok(())
        })
    }
}

fn failure_text(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    let status = output
        .code
        .map_or_else(|| String::from("terminated by signal"), |code| format!("exit status {code}"));
    if stderr.is_empty() {
        status
    } else {
        format!("{status}: {stderr}")
    }
}
