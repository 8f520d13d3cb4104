//! OS processes inside a sandbox.
//!
//! A started process is tracked by a [`ProcessHandle`]. The handle owns a
//! background task that drains the daemon's event stream, forwards output to
//! the caller's handler in arrival order and records the terminal result.
//! [`ProcessHandle::wait`] joins that task; later calls return the cached result.

use crate::config::DEFAULT_USER;
use crate::error::{Result, SandboxError};
use crate::output::{emit, OutputSink, OutputStream};
use crate::transport::{bounded, DataPlane, ServerStream};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Interrupt, as sent by Ctrl-C.
pub const SIGINT: i32 = 2;
/// Unconditional termination.
pub const SIGKILL: i32 = 9;
/// Polite termination request.
pub const SIGTERM: i32 = 15;

const SHELL: &str = "/bin/bash";

/// Options for [`Commands::run`] and [`Commands::start`].
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// In-sandbox user the process runs as.
    pub user: String,
    pub cwd: Option<String>,
    pub envs: HashMap<String, String>,
    /// Keep stdin open so [`ProcessHandle::send_input`] works.
    pub stdin: bool,
    /// Deadline for the process. Enforced by the daemon, and client-side by `run`.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
            cwd: None,
            envs: HashMap::new(),
            stdin: true,
            timeout: None,
            cancel: None,
        }
    }
}

impl ProcessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, open: bool) -> Self {
        self.stdin = open;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Identity for calls that address an existing process by pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// In-sandbox user the daemon checks the call against.
    pub user: String,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
        }
    }
}

impl ProcessOptions {
    pub fn user(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

/// Lifecycle of a process as observed by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Starting,
    Running,
    Exited,
    /// Terminated by a signal.
    Killed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Killed => "killed",
        };
        f.write_str(name)
    }
}

/// Terminal snapshot of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Failure reported by the daemon (e.g. command not found, signal).
    pub error: Option<String>,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// A process tracked inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub tag: Option<String>,
    pub cmd: String,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
    pub cwd: Option<String>,
}

// Daemon wire shapes.

#[derive(Serialize)]
struct ProcessSpec<'a> {
    cmd: &'a str,
    args: Vec<&'a str>,
    envs: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
}

#[derive(Serialize)]
struct StartRequest<'a> {
    process: ProcessSpec<'a>,
    stdin: bool,
}

#[derive(Serialize)]
struct Selector {
    pid: u32,
}

#[derive(Serialize)]
struct ConnectRequest {
    process: Selector,
}

#[derive(Serialize)]
struct InputPayload {
    stdin: String,
}

#[derive(Serialize)]
struct SendInputRequest {
    process: Selector,
    input: InputPayload,
}

#[derive(Serialize)]
struct SendSignalRequest {
    process: Selector,
    signal: i32,
}

#[derive(Deserialize)]
struct Empty {}

#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(default)]
    event: Option<ProcessEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessEvent {
    #[serde(default)]
    start: Option<StartEvent>,
    #[serde(default)]
    data: Option<DataEvent>,
    #[serde(default)]
    end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
struct StartEvent {
    pid: u32,
}

#[derive(Debug, Default, Deserialize)]
struct DataEvent {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndEvent {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    processes: Vec<RawProcessInfo>,
}

#[derive(Deserialize)]
struct RawProcessInfo {
    pid: u32,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    config: RawProcessConfig,
}

#[derive(Default, Deserialize)]
struct RawProcessConfig {
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    envs: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
}

impl From<RawProcessInfo> for ProcessInfo {
    fn from(raw: RawProcessInfo) -> Self {
        Self {
            pid: raw.pid,
            tag: raw.tag,
            cmd: raw.config.cmd,
            args: raw.config.args,
            envs: raw.config.envs,
            cwd: raw.config.cwd,
        }
    }
}

/// Output and terminal status accumulated by the reader task.
struct Collected {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Collected {
    fn new() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    fn data(&mut self, data: DataEvent, sink: Option<&OutputSink>) -> Result<()> {
        if let Some(encoded) = data.stdout {
            let bytes = decode_chunk(&encoded)?;
            emit(sink, OutputStream::Stdout, &bytes);
            self.stdout.extend_from_slice(&bytes);
        }
        if let Some(encoded) = data.stderr {
            let bytes = decode_chunk(&encoded)?;
            emit(sink, OutputStream::Stderr, &bytes);
            self.stderr.extend_from_slice(&bytes);
        }
        Ok(())
    }

    fn finish(self, end: EndEvent) -> ProcessResult {
        ProcessResult {
            exit_code: end.exit_code,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            error: end.error.filter(|e| !e.is_empty()),
        }
    }
}

fn decode_chunk(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| SandboxError::Protocol(format!("bad output chunk encoding: {e}")))
}

/// Read events until the start event names the pid.
async fn await_start(
    stream: &mut ServerStream,
    collected: &mut Collected,
    sink: Option<&OutputSink>,
) -> Result<u32> {
    loop {
        let Some(message) = stream.next::<EventMessage>().await? else {
            return Err(SandboxError::Protocol(
                "process stream ended before the process started".into(),
            ));
        };
        let Some(event) = message.event else {
            continue;
        };
        if let Some(data) = event.data {
            collected.data(data, sink)?;
        }
        if let Some(start) = event.start {
            return Ok(start.pid);
        }
    }
}

/// Drain the stream after the start event until the process ends.
async fn drain(
    mut stream: ServerStream,
    mut collected: Collected,
    pid: u32,
    state: Arc<Mutex<ProcessState>>,
    sink: Option<OutputSink>,
) -> Result<ProcessResult> {
    let started = Instant::now();
    loop {
        let Some(message) = stream.next::<EventMessage>().await? else {
            return Err(SandboxError::Protocol(format!(
                "process {pid} stream ended before exit"
            )));
        };
        let Some(event) = message.event else {
            continue;
        };
        if let Some(data) = event.data {
            collected.data(data, sink.as_ref())?;
        }
        if let Some(end) = event.end {
            let final_state = if end.status.starts_with("signal") {
                ProcessState::Killed
            } else {
                ProcessState::Exited
            };
            *state.lock() = final_state;
            tracing::debug!(
                pid,
                exit_code = end.exit_code,
                status = %end.status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Process finished"
            );
            return Ok(collected.finish(end));
        }
    }
}

enum Outcome {
    Pending(JoinHandle<Result<ProcessResult>>),
    Finished(ProcessResult),
    Failed(SandboxError),
    Detached,
}

/// A running or finished process.
///
/// Dropping the handle does not stop output delivery; use
/// [`ProcessHandle::disconnect`] for that, or [`ProcessHandle::kill`] to end
/// the process itself.
pub struct ProcessHandle {
    pid: u32,
    user: String,
    data: Arc<DataPlane>,
    state: Arc<Mutex<ProcessState>>,
    outcome: tokio::sync::Mutex<Outcome>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Block until the process exits.
    pub async fn wait(&self) -> Result<ProcessResult> {
        self.wait_until(None, None).await
    }

    /// Like [`ProcessHandle::wait`], giving up with `Cancelled` when the
    /// token fires. The process keeps running and can be waited on again.
    pub async fn wait_with_cancel(&self, cancel: &CancellationToken) -> Result<ProcessResult> {
        self.wait_until(None, Some(cancel)).await
    }

    async fn wait_until(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<ProcessResult> {
        let mut outcome = self.outcome.lock().await;
        if let Outcome::Pending(task) = &mut *outcome {
            let joined = bounded(timeout, cancel, async { Ok(task.await) }).await?;
            match joined {
                Ok(Ok(result)) => *outcome = Outcome::Finished(result),
                Ok(Err(err)) => {
                    *outcome = Outcome::Failed(err.replay());
                    return Err(err);
                }
                Err(join) => {
                    *outcome = Outcome::Failed(SandboxError::Transport(format!(
                        "process {} reader stopped: {join}",
                        self.pid
                    )));
                }
            }
        }
        match &*outcome {
            Outcome::Finished(result) => Ok(result.clone()),
            Outcome::Failed(err) => Err(err.replay()),
            Outcome::Detached => Err(SandboxError::Config(format!(
                "process {} was disconnected; connect again to wait",
                self.pid
            ))),
            Outcome::Pending(_) => Err(SandboxError::Protocol(format!(
                "process {} result unavailable",
                self.pid
            ))),
        }
    }

    /// Write bytes to the process's stdin.
    pub async fn send_input(&self, input: &[u8]) -> Result<()> {
        send_input(&self.data, &self.user, self.pid, input).await
    }

    /// Deliver a signal. Does not wait for the process to react.
    pub async fn send_signal(&self, signal: i32) -> Result<()> {
        send_signal(&self.data, &self.user, self.pid, signal).await
    }

    /// Send `SIGKILL`.
    pub async fn kill(&self) -> Result<()> {
        self.send_signal(SIGKILL).await
    }

    /// Stop receiving output. The process keeps running.
    pub async fn disconnect(&self) {
        let mut outcome = self.outcome.lock().await;
        if let Outcome::Pending(task) = &*outcome {
            task.abort();
            *outcome = Outcome::Detached;
            tracing::debug!(pid = self.pid, "Disconnected from process");
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Wait for `handle` with whatever is left of `deadline` (instant, full budget).
async fn finish_within(
    handle: &ProcessHandle,
    deadline: Option<(Instant, Duration)>,
    cancel: Option<&CancellationToken>,
) -> Result<ProcessResult> {
    let remaining = deadline.map(|(at, _)| at.saturating_duration_since(Instant::now()));
    let result = handle
        .wait_until(remaining, cancel)
        .await
        .map_err(|err| match (err, deadline) {
            (SandboxError::Timeout(_), Some((_, limit))) => SandboxError::Timeout(limit),
            (err, _) => err,
        });
    if result.is_err() {
        handle.disconnect().await;
    }
    result
}

async fn send_input(data: &DataPlane, user: &str, pid: u32, input: &[u8]) -> Result<()> {
    let request = SendInputRequest {
        process: Selector { pid },
        input: InputPayload {
            stdin: BASE64.encode(input),
        },
    };
    let _: Empty = data
        .unary("process.Process/SendInput", &request, Some(user))
        .await?;
    tracing::trace!(pid, len = input.len(), "Input sent");
    Ok(())
}

async fn send_signal(data: &DataPlane, user: &str, pid: u32, signal: i32) -> Result<()> {
    let request = SendSignalRequest {
        process: Selector { pid },
        signal,
    };
    let _: Empty = data
        .unary("process.Process/SendSignal", &request, Some(user))
        .await?;
    tracing::debug!(pid, signal, "Signal sent");
    Ok(())
}

/// Process management of one sandbox.
#[derive(Debug, Clone)]
pub struct Commands {
    data: Arc<DataPlane>,
}

impl Commands {
    pub(crate) fn new(data: Arc<DataPlane>) -> Self {
        Self { data }
    }

    /// Run a shell command in the foreground and wait for it to exit.
    ///
    /// Output reaches `output` before this returns. A non-zero exit code is
    /// reported in the result, not as an error.
    pub async fn run(
        &self,
        cmd: &str,
        config: ProcessConfig,
        output: Option<OutputSink>,
    ) -> Result<ProcessResult> {
        let deadline = config.timeout.map(|limit| (Instant::now() + limit, limit));
        let cancel = config.cancel.clone();
        let handle = bounded(config.timeout, cancel.as_ref(), self.start(cmd, config, output)).await?;
        finish_within(&handle, deadline, cancel.as_ref()).await
    }

    /// Launch a shell command and return once the sandbox assigned a pid.
    ///
    /// Output keeps flowing to `output` in the background until the process
    /// exits.
    pub async fn start(
        &self,
        cmd: &str,
        config: ProcessConfig,
        output: Option<OutputSink>,
    ) -> Result<ProcessHandle> {
        if cmd.trim().is_empty() {
            return Err(SandboxError::Config("command must not be empty".into()));
        }
        let request = StartRequest {
            process: ProcessSpec {
                cmd: SHELL,
                args: vec!["-l", "-c", cmd],
                envs: &config.envs,
                cwd: config.cwd.as_deref(),
            },
            stdin: config.stdin,
        };
        let stream = self
            .data
            .server_stream("process.Process/Start", &request, Some(&config.user), config.timeout)
            .await?;
        let handle = self.attach(stream, &config.user, output).await?;
        tracing::debug!(sandbox_id = %self.data.sandbox_id(), pid = handle.pid, cmd, "Process started");
        Ok(handle)
    }

    /// Attach to a process started elsewhere.
    ///
    /// The handle acts as `options.user` for input and signals. Fails with
    /// `NotFound` when the pid is not tracked.
    pub async fn connect(
        &self,
        pid: u32,
        options: &ProcessOptions,
        output: Option<OutputSink>,
    ) -> Result<ProcessHandle> {
        let request = ConnectRequest {
            process: Selector { pid },
        };
        let stream = self
            .data
            .server_stream("process.Process/Connect", &request, Some(&options.user), None)
            .await?;
        let handle = self.attach(stream, &options.user, output).await?;
        tracing::debug!(sandbox_id = %self.data.sandbox_id(), pid, "Connected to process");
        Ok(handle)
    }

    async fn attach(
        &self,
        mut stream: ServerStream,
        user: &str,
        output: Option<OutputSink>,
    ) -> Result<ProcessHandle> {
        let mut collected = Collected::new();
        let pid = await_start(&mut stream, &mut collected, output.as_ref()).await?;
        let state = Arc::new(Mutex::new(ProcessState::Running));
        let task = tokio::spawn(drain(stream, collected, pid, state.clone(), output));
        Ok(ProcessHandle {
            pid,
            user: user.to_string(),
            data: self.data.clone(),
            state,
            outcome: tokio::sync::Mutex::new(Outcome::Pending(task)),
        })
    }

    /// Processes currently tracked inside the sandbox.
    pub async fn list(&self, options: &ProcessOptions) -> Result<Vec<ProcessInfo>> {
        let resp: ListResponse = self
            .data
            .unary("process.Process/List", &serde_json::json!({}), Some(&options.user))
            .await?;
        Ok(resp.processes.into_iter().map(ProcessInfo::from).collect())
    }

    /// Write bytes to the stdin of process `pid`.
    pub async fn send_input(&self, pid: u32, input: &[u8], options: &ProcessOptions) -> Result<()> {
        send_input(&self.data, &options.user, pid, input).await
    }

    /// Deliver `signal` to process `pid`.
    pub async fn send_signal(&self, pid: u32, signal: i32, options: &ProcessOptions) -> Result<()> {
        send_signal(&self.data, &options.user, pid, signal).await
    }

    /// Send `SIGKILL` to process `pid`.
    pub async fn kill(&self, pid: u32, options: &ProcessOptions) -> Result<()> {
        self.send_signal(pid, SIGKILL, options).await
    }
}
