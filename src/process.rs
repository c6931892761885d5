//! Local process execution with per-invocation timeouts.
//!
//! Remote sessions and ping probes shell out to system binaries. The
//! [`CommandRunner`] seam keeps argument construction testable without
//! spawning processes.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Result of running a local process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// A fully described process launch.
#[derive(Clone, Eq, PartialEq)]
pub struct Invocation {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    /// Upper bound on the wall-clock time the process may take.
    pub timeout: Duration,
}

impl Invocation {
    /// Starts an invocation of `program` bounded by `timeout`.
    #[must_use]
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<OsString>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for the child process.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns a shell-like command string for logs and assertions.
    ///
    /// Environment values are never included.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(key, _)| key.as_str()).collect();
        formatter
            .debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Errors raised while launching local processes.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the process outlives its timeout. The child is killed.
    #[error("{program} did not finish within {timeout_secs}s")]
    TimedOut {
        /// Command that timed out.
        program: String,
        /// Timeout that elapsed, in whole seconds.
        timeout_secs: u64,
    },
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, ProcessError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs the invocation, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Spawn`] if the command cannot be started and
    /// [`ProcessError::TimedOut`] if it exceeds the invocation timeout.
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunnerFuture<'a>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunnerFuture<'a> {
        Box::pin(async move {
            let mut command = Command::new(&invocation.program);
            command
                .args(&invocation.args)
                .envs(
                    invocation
                        .env
                        .iter()
                        .map(|(key, value)| (key.as_str(), value.as_str())),
                )
                .stdin(Stdio::null())
                .kill_on_drop(true);

            let output = match timeout(invocation.timeout, command.output()).await {
                Ok(result) => result.map_err(|err| ProcessError::Spawn {
                    program: invocation.program.clone(),
                    message: err.to_string(),
                })?,
                Err(_) => {
                    return Err(ProcessError::TimedOut {
                        program: invocation.program.clone(),
                        timeout_secs: invocation.timeout.as_secs(),
                    });
                }
            };

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_string_omits_environment() {
        let invocation = Invocation::new("sshpass", Duration::from_secs(1))
            .args(["-e", "ssh"])
            .env("SSHPASS", "hunter2");

        assert_eq!(invocation.command_string(), "sshpass -e ssh");
        let debug = format!("{invocation:?}");
        assert!(!debug.contains("hunter2"), "debug leaked secret: {debug}");
        assert!(debug.contains("SSHPASS"), "debug should list env keys: {debug}");
    }

    #[tokio::test]
    async fn process_runner_reports_spawn_failure() {
        let invocation = Invocation::new("/nonexistent/bringup-test-binary", Duration::from_secs(1));
        let result = ProcessCommandRunner.run(&invocation).await;

        assert!(
            matches!(result, Err(ProcessError::Spawn { .. })),
            "unexpected result: {result:?}"
        );
    }

    #[tokio::test]
    async fn process_runner_kills_slow_processes() {
        let invocation = Invocation::new("sleep", Duration::from_millis(50)).arg("5");
        let result = ProcessCommandRunner.run(&invocation).await;

        assert!(
            matches!(result, Err(ProcessError::TimedOut { .. })),
            "unexpected result: {result:?}"
        );
    }
}
