use nix::errno::Errno;
use nix::sys::signal::{self as nix_signal, Signal as NixSignal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, TapflowResult};
use crate::process::failure::{FailureSummary, ReportedFault, parse_fault_line};
use crate::tapflow_error;

/// Upper bound on the time spent draining stderr after the process exited.
///
/// A grandchild that inherited stderr can keep the pipe open after the connector exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Role a connector process plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorRole {
    Extractor,
    Transformer,
    Loader,
    FastSync,
}

impl ConnectorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorRole::Extractor => "extractor",
            ConnectorRole::Transformer => "transformer",
            ConnectorRole::Loader => "loader",
            ConnectorRole::FastSync => "fast_sync",
        }
    }
}

impl fmt::Display for ConnectorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub role: ConnectorRole,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// How a standard stream of the child is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Exposed on the [`ProcessHandle`] for the caller to read or write.
    Piped,
    /// Connected to `/dev/null`.
    Null,
}

impl From<StdioMode> for Stdio {
    fn from(mode: StdioMode) -> Self {
        match mode {
            StdioMode::Piped => Stdio::piped(),
            StdioMode::Null => Stdio::null(),
        }
    }
}

/// Signals deliverable to a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl From<Signal> for NixSignal {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Terminate => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        }
    }
}

/// Sends signals to the process group of a child. Cheap to clone and usable after the
/// [`ProcessHandle`] was consumed.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSignaller {
    role: ConnectorRole,
    pgid: Pid,
}

impl ProcessSignaller {
    /// Delivers `signal` to every process in the group.
    ///
    /// A group that no longer exists is not an error.
    pub fn signal(&self, signal: Signal) -> TapflowResult<()> {
        match nix_signal::killpg(self.pgid, NixSignal::from(signal)) {
            Ok(()) => {
                debug!(role = %self.role, pgid = %self.pgid, ?signal, "signalled process group");
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn role(&self) -> ConnectorRole {
        self.role
    }
}

/// Terminal status of a connector process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub role: ConnectorRole,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Whether the process ended because of a terminate or kill request, either by the signal
    /// itself or by the conventional `128 + signal` exit code of a shell.
    pub fn terminated_by_request(&self) -> bool {
        const SIGTERM: i32 = NixSignal::SIGTERM as i32;
        const SIGKILL: i32 = NixSignal::SIGKILL as i32;

        matches!(self.signal, Some(SIGTERM | SIGKILL))
            || matches!(self.code, Some(code) if code == 128 + SIGTERM || code == 128 + SIGKILL)
    }
}

fn serialize_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[derive(Debug, Default)]
struct StderrCapture {
    tail: VecDeque<String>,
    fault: Option<ReportedFault>,
}

/// A running connector process.
///
/// The child runs in its own process group and is killed when the handle is dropped before it
/// was waited for.
#[derive(Debug)]
pub struct ProcessHandle {
    role: ConnectorRole,
    child: Child,
    started: Instant,
    signaller: ProcessSignaller,
    capture: Arc<Mutex<StderrCapture>>,
    stderr_task: Option<JoinHandle<()>>,
}

/// Launches `spec`.
///
/// Stdin and stdout are wired according to `stdin` and `stdout`; stderr is always captured,
/// logged, and its last `stderr_tail_lines` lines retained for failure summaries.
pub fn start(
    spec: &ProcessSpec,
    stdin: StdioMode,
    stdout: StdioMode,
    stderr_tail_lines: usize,
) -> TapflowResult<ProcessHandle> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| {
        tapflow_error!(
            ErrorKind::SubprocessFailure,
            "Failed to start connector process",
            format!("{} `{}`: {err}", spec.role, spec.program),
            source: err
        )
    })?;

    let pid = child.id().ok_or_else(|| {
        tapflow_error!(
            ErrorKind::SubprocessFailure,
            "Connector process exited before it could be tracked",
            spec.role
        )
    })?;
    let pgid = Pid::from_raw(pid as i32);

    let capture = Arc::new(Mutex::new(StderrCapture::default()));
    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(capture_stderr(
            spec.role,
            stderr,
            capture.clone(),
            stderr_tail_lines,
        ))
    });

    info!(role = %spec.role, program = %spec.program, pid, "started connector process");

    Ok(ProcessHandle {
        role: spec.role,
        child,
        started: Instant::now(),
        signaller: ProcessSignaller {
            role: spec.role,
            pgid,
        },
        capture,
        stderr_task,
    })
}

impl ProcessHandle {
    pub fn role(&self) -> ConnectorRole {
        self.role
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn signaller(&self) -> ProcessSignaller {
        self.signaller
    }

    pub fn signal(&self, signal: Signal) -> TapflowResult<()> {
        self.signaller.signal(signal)
    }

    /// Waits for the process to exit and collects its status and failure summary.
    pub async fn wait(mut self) -> TapflowResult<ProcessExit> {
        let status = self.child.wait().await.map_err(|err| {
            tapflow_error!(
                ErrorKind::SubprocessFailure,
                "Failed to wait for connector process",
                self.role,
                source: err
            )
        })?;

        Ok(self.collect(status).await)
    }

    /// Sends [`Signal::Terminate`], waits up to `grace` and then sends [`Signal::Kill`].
    pub async fn terminate(mut self, grace: Duration) -> TapflowResult<ProcessExit> {
        self.signal(Signal::Terminate)?;

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(role = %self.role, ?grace, "connector ignored terminate, killing it");
                self.signal(Signal::Kill)?;
                self.child.wait().await
            }
        }
        .map_err(|err| {
            tapflow_error!(
                ErrorKind::SubprocessFailure,
                "Failed to wait for connector process",
                self.role,
                source: err
            )
        })?;

        Ok(self.collect(status).await)
    }

    async fn collect(&mut self, status: ExitStatus) -> ProcessExit {
        let duration = self.started.elapsed();

        if let Some(mut stderr_task) = self.stderr_task.take() {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut stderr_task)
                .await
                .is_err()
            {
                warn!(role = %self.role, "stderr still open after exit, not draining it further");
                stderr_task.abort();
            }
        }

        let code = status.code();
        let signal = status.signal();

        let failure = if status.success() {
            None
        } else {
            let mut capture = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
            let summary = match capture.fault.take() {
                Some(fault) => FailureSummary::from_reported(self.role, fault, code, signal),
                None => {
                    let tail: Vec<String> = capture.tail.iter().cloned().collect();
                    FailureSummary::synthesize(self.role, &tail, code, signal)
                }
            };
            Some(summary)
        };

        debug!(role = %self.role, ?code, ?signal, ?duration, "connector process exited");

        ProcessExit {
            role: self.role,
            code,
            signal,
            duration,
            failure,
        }
    }
}

async fn capture_stderr<R>(
    role: ConnectorRole,
    stderr: R,
    capture: Arc<Mutex<StderrCapture>>,
    tail_lines: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(%role, error = %err, "failed to read connector stderr");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);

        let fault = parse_fault_line(line);
        if let Some(fault) = &fault {
            warn!(%role, kind = %fault.kind, message = %fault.message, "connector reported a fault");
        } else {
            info!(%role, "{line}");
        }

        let mut capture = capture.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fault) = fault {
            capture.fault = Some(fault);
        }
        if tail_lines > 0 {
            if capture.tail.len() == tail_lines {
                capture.tail.pop_front();
            }
            capture.tail.push_back(line.to_string());
        }
    }
}
