//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here stand in for the network and the device: a scripted
//! command runner for local processes, a scripted device reached through a
//! scripted connector, a static reachability probe, and a static neighbor
//! table. All of them are cheap to clone and share state between clones so
//! tests can keep a handle for assertions after passing one to the code under
//! test.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::discovery::{ProbeFuture, ReachabilityProbe};
use crate::identity::{NeighborError, NeighborTable};
use crate::process::{CommandOutput, CommandRunner, Invocation, ProcessError, RunnerFuture};
use crate::session::{Connector, Credentials, RemoteSession, SessionError, SessionFuture};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

const fn success(stdout: String) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

/// Scripted command runner that returns pre-seeded results in FIFO order.
///
/// Once the queue is empty every invocation succeeds with empty output.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<Result<CommandOutput, ProcessError>>>>,
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl ScriptedRunner {
    /// Creates a runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Queues a successful exit status.
    pub fn push_success(&self) {
        self.push_output(0, "", "");
    }

    /// Queues a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(code, "", "");
    }

    /// Queues an explicit output.
    pub fn push_output(&self, code: i32, stdout: impl Into<String>, stderr: impl Into<String>) {
        lock(&self.responses).push_back(Ok(CommandOutput {
            code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Queues a runner error.
    pub fn push_error(&self, error: ProcessError) {
        lock(&self.responses).push_back(Err(error));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, invocation: &'a Invocation) -> RunnerFuture<'a> {
        lock(&self.invocations).push(invocation.clone());
        let response = lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Ok(success(String::new())));
        Box::pin(async move { response })
    }
}

#[derive(Clone, Debug)]
enum Response {
    Exit(i32),
    Stdout(String),
    DropChannel,
    TimeOut,
}

#[derive(Clone, Debug)]
struct Rule {
    pattern: String,
    remaining: Option<usize>,
    response: Response,
}

#[derive(Debug)]
struct DeviceState {
    address: Ipv4Addr,
    rules: Vec<Rule>,
    commands: Vec<String>,
    config: BTreeMap<String, String>,
    connects: usize,
    closes: usize,
    refused_connects: usize,
}

impl DeviceState {
    fn respond(&mut self, command: &str) -> Response {
        let matched = self.rules.iter_mut().find(|rule| {
            command.contains(rule.pattern.as_str()) && rule.remaining != Some(0)
        });
        let Some(rule) = matched else {
            return Response::Exit(0);
        };
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        rule.response.clone()
    }
}

/// In-memory device that records commands and answers them from rules.
///
/// Rules match by substring, first match wins, and unmatched commands
/// succeed. Successful `uci -q batch` commands are applied to an in-memory
/// configuration store so tests can compare snapshots.
#[derive(Clone, Debug)]
pub struct ScriptedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl ScriptedDevice {
    /// Creates a device at `address` that accepts every command.
    #[must_use]
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                address,
                rules: Vec::new(),
                commands: Vec::new(),
                config: BTreeMap::new(),
                connects: 0,
                closes: 0,
                refused_connects: 0,
            })),
        }
    }

    /// Device address.
    #[must_use]
    pub fn address(&self) -> Ipv4Addr {
        lock(&self.state).address
    }

    /// Opens a session directly, bypassing connector bookkeeping.
    #[must_use]
    pub fn session(&self) -> ScriptedSession {
        ScriptedSession {
            device: self.clone(),
            closed: false,
        }
    }

    fn add_rule(&self, pattern: &str, remaining: Option<usize>, response: Response) {
        lock(&self.state).rules.push(Rule {
            pattern: pattern.to_owned(),
            remaining,
            response,
        });
    }

    /// The next `times` commands containing `pattern` exit with status 1.
    pub fn fail_next(&self, pattern: &str, times: usize) {
        self.add_rule(pattern, Some(times), Response::Exit(1));
    }

    /// Every command containing `pattern` exits with status 1.
    pub fn always_fail(&self, pattern: &str) {
        self.add_rule(pattern, None, Response::Exit(1));
    }

    /// Every command containing `pattern` succeeds with `stdout`.
    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.add_rule(pattern, None, Response::Stdout(stdout.to_owned()));
    }

    /// The next `times` commands containing `pattern` lose the channel.
    pub fn drop_channel_next(&self, pattern: &str, times: usize) {
        self.add_rule(pattern, Some(times), Response::DropChannel);
    }

    /// The next `times` commands containing `pattern` time out.
    pub fn time_out_next(&self, pattern: &str, times: usize) {
        self.add_rule(pattern, Some(times), Response::TimeOut);
    }

    /// The next `times` connection attempts are refused.
    pub fn refuse_connections(&self, times: usize) {
        lock(&self.state).refused_connects = times;
    }

    /// Seeds one configuration entry.
    pub fn seed_config(&self, key: &str, value: &str) {
        lock(&self.state)
            .config
            .insert(key.to_owned(), value.to_owned());
    }

    /// Current configuration store.
    #[must_use]
    pub fn config_snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.state).config.clone()
    }

    /// Every command received, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Number of commands received that contain `pattern`.
    #[must_use]
    pub fn count_matching(&self, pattern: &str) -> usize {
        lock(&self.state)
            .commands
            .iter()
            .filter(|command| command.contains(pattern))
            .count()
    }

    /// Successful connections made through a [`ScriptedConnector`].
    #[must_use]
    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    /// Sessions closed.
    #[must_use]
    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }

    fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, SessionError> {
        let mut state = lock(&self.state);
        state.commands.push(command.to_owned());
        let address = state.address;
        match state.respond(command) {
            Response::Exit(0) => {
                if command.starts_with("uci -q batch") {
                    apply_uci_batch(&mut state.config, command);
                }
                Ok(success(String::new()))
            }
            Response::Exit(code) => Ok(CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: String::from("simulated failure"),
            }),
            Response::Stdout(stdout) => Ok(success(stdout)),
            Response::DropChannel => Err(SessionError::Channel {
                address,
                message: String::from("simulated channel drop"),
            }),
            Response::TimeOut => Err(SessionError::Timeout {
                address,
                command: command.to_owned(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

fn apply_uci_batch(config: &mut BTreeMap<String, String>, batch: &str) {
    for line in batch.lines().skip(1).map(str::trim) {
        if line == "EOF" {
            break;
        }
        if let Some(key) = line.strip_prefix("delete ") {
            let nested = format!("{key}.");
            config.retain(|existing, _| existing != key && !existing.starts_with(&nested));
        } else if let Some(assignment) = line.strip_prefix("set ")
            && let Some((key, value)) = assignment.split_once('=')
        {
            config.insert(key.to_owned(), unquote(value));
        }
    }
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
        .unwrap_or(value)
        .replace(r"'\''", "'")
}

/// Session onto a [`ScriptedDevice`].
#[derive(Debug)]
pub struct ScriptedSession {
    device: ScriptedDevice,
    closed: bool,
}

impl RemoteSession for ScriptedSession {
    fn address(&self) -> Ipv4Addr {
        self.device.address()
    }

    fn run<'a>(&'a mut self, command: &'a str, timeout: Duration) -> SessionFuture<'a, CommandOutput> {
        let result = if self.closed {
            Err(SessionError::Closed {
                address: self.device.address(),
            })
        } else {
            self.device.execute(command, timeout)
        };
        Box::pin(async move { result })
    }

    fn close(&mut self) -> SessionFuture<'_, ()> {
        if !self.closed {
            self.closed = true;
            lock(&self.device.state).closes += 1;
        }
        Box::pin(async { Ok(()) })
    }
}

/// Connector onto a set of [`ScriptedDevice`]s.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    devices: Vec<ScriptedDevice>,
}

impl ScriptedConnector {
    /// Connector that reaches only `device`.
    #[must_use]
    pub fn new(device: ScriptedDevice) -> Self {
        Self {
            devices: vec![device],
        }
    }

    /// Adds another reachable device.
    #[must_use]
    pub fn with_device(mut self, device: ScriptedDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Total successful connections across all devices.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.devices.iter().map(ScriptedDevice::connect_count).sum()
    }
}

impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    fn connect<'a>(
        &'a self,
        address: Ipv4Addr,
        _credentials: &'a Credentials,
        _timeout: Duration,
    ) -> SessionFuture<'a, Self::Session> {
        let result = self
            .devices
            .iter()
            .find(|device| device.address() == address)
            .ok_or_else(|| SessionError::Connect {
                address,
                message: String::from("no route to host"),
            })
            .and_then(|device| {
                let mut state = lock(&device.state);
                if state.refused_connects > 0 {
                    state.refused_connects -= 1;
                    return Err(SessionError::Connect {
                        address,
                        message: String::from("connection refused"),
                    });
                }
                state.connects += 1;
                drop(state);
                Ok(device.session())
            });
        Box::pin(async move { result })
    }
}

/// Probe that reports a fixed set of addresses as reachable.
#[derive(Clone, Debug, Default)]
pub struct StaticProbe {
    reachable: BTreeSet<Ipv4Addr>,
    probes: Arc<AtomicUsize>,
    answers: Arc<AtomicUsize>,
    answer_budget: Option<usize>,
}

impl StaticProbe {
    /// Probe that answers for `addresses` only.
    #[must_use]
    pub fn reachable(addresses: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            reachable: addresses.into_iter().collect(),
            probes: Arc::default(),
            answers: Arc::default(),
            answer_budget: None,
        }
    }

    /// Stops answering after `budget` positive answers, modelling a device
    /// that drops off the network.
    #[must_use]
    pub const fn answering_at_most(mut self, budget: usize) -> Self {
        self.answer_budget = Some(budget);
        self
    }

    /// Number of probes sent.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl ReachabilityProbe for StaticProbe {
    fn probe(&self, address: Ipv4Addr, _timeout: Duration) -> ProbeFuture<'_> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let alive = self.reachable.contains(&address)
            && self
                .answer_budget
                .is_none_or(|budget| self.answers.fetch_add(1, Ordering::SeqCst) < budget);
        Box::pin(async move { alive })
    }
}

/// Neighbor table backed by a fixed map.
#[derive(Clone, Debug, Default)]
pub struct StaticNeighborTable {
    entries: BTreeMap<Ipv4Addr, String>,
}

impl StaticNeighborTable {
    /// Adds an entry.
    #[must_use]
    pub fn with_entry(mut self, address: Ipv4Addr, hardware_address: &str) -> Self {
        self.entries.insert(address, hardware_address.to_owned());
        self
    }
}

impl NeighborTable for StaticNeighborTable {
    fn lookup(&self, address: Ipv4Addr) -> Result<Option<String>, NeighborError> {
        Ok(self.entries.get(&address).cloned())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
