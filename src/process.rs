//! External process invocation: spawn, capture output, enforce a timeout.
//!
//! Every pipeline command goes through [`run_command`]. The call blocks the
//! run until the child exits and its output pipes close, the time limit
//! elapses, or the run is cancelled. On unix the child leads its own process
//! group, and the whole group is terminated once the call returns, so
//! background descendants never outlive it.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CommandConfig;

/// Maximum stdout or stderr size captured per stream (4 MiB).
const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// Appended to a stream whose output exceeded [`MAX_OUTPUT_BYTES`].
pub const TRUNCATED_MARKER: &str = "\n... [truncated]";

/// Time between SIGTERM and SIGKILL when tearing down a process group.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for the pipes to close after the group was killed.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{}", describe_exit(*code))]
    Exit { code: Option<i32> },

    /// `output` holds whatever the child wrote before it was killed.
    #[error("killed after exceeding {}s", limit.as_secs())]
    TimedOut {
        limit: Duration,
        output: Box<CommandOutput>,
    },

    #[error("killed on cancellation")]
    Cancelled { output: Box<CommandOutput> },

    #[error("failed waiting for child: {0}")]
    Wait(#[source] std::io::Error),
}

impl ProcessError {
    /// Output captured from a child that was killed.
    pub fn partial_output(&self) -> Option<&CommandOutput> {
        match self {
            ProcessError::TimedOut { output, .. } | ProcessError::Cancelled { output } => {
                Some(output)
            }
            _ => None,
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exited with status {}", c),
        None => "terminated by signal".to_string(),
    }
}

/// Captured result of a finished child process.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into [`ProcessError::Exit`].
    pub fn check(self) -> Result<Self, ProcessError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProcessError::Exit {
                code: self.exit_code,
            })
        }
    }
}

enum Outcome {
    Finished(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run `spec` in `cwd` and wait for it, bounded by `limit` and `cancel`.
///
/// The limit covers both the child's exit and draining its output, so a
/// descendant that keeps the pipes open cannot stall the caller. A non-zero
/// exit is *not* an error here; callers decide with
/// [`CommandOutput::check`]. Stdin is closed.
pub async fn run_command(
    spec: &CommandConfig,
    cwd: &Path,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, ProcessError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id();

    let stdout = Capture::shared();
    let stderr = Capture::shared();
    let mut drain = tokio::spawn({
        let (out_pipe, err_pipe) = (child.stdout.take(), child.stderr.take());
        let (out, err) = (stdout.clone(), stderr.clone());
        async move {
            tokio::join!(drain_stream(out_pipe, out), drain_stream(err_pipe, err));
        }
    });

    let outcome = tokio::select! {
        (status, _) = async { tokio::join!(child.wait(), &mut drain) } => Outcome::Finished(status),
        _ = tokio::time::sleep(limit) => Outcome::TimedOut,
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    // Reap stragglers in the group, including on a clean exit.
    terminate_group(pid, &mut child).await;

    // The drain may already have completed inside the select.
    let killed = !matches!(outcome, Outcome::Finished(_));
    if killed
        && !drain.is_finished()
        && tokio::time::timeout(DRAIN_AFTER_KILL, &mut drain).await.is_err()
    {
        drain.abort();
    }

    let collect = |exit_code| CommandOutput {
        exit_code,
        stdout: stdout.lock().map(|c| c.render()).unwrap_or_default(),
        stderr: stderr.lock().map(|c| c.render()).unwrap_or_default(),
        duration: start.elapsed(),
    };

    match outcome {
        Outcome::Finished(status) => {
            let status = status.map_err(ProcessError::Wait)?;
            Ok(collect(status.code()))
        }
        Outcome::TimedOut => Err(ProcessError::TimedOut {
            limit,
            output: Box::new(collect(None)),
        }),
        Outcome::Cancelled => Err(ProcessError::Cancelled {
            output: Box::new(collect(None)),
        }),
    }
}

/// Bytes kept from one output stream.
#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

impl Capture {
    fn shared() -> SharedCapture {
        Arc::new(Mutex::new(Capture::default()))
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = MAX_OUTPUT_BYTES.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATED_MARKER);
        }
        text
    }
}

/// Read a stream to EOF, keeping the first [`MAX_OUTPUT_BYTES`] and
/// discarding the rest so the writer never blocks on a full pipe.
async fn drain_stream<R: AsyncRead + Unpin>(handle: Option<R>, sink: SharedCapture) {
    let Some(mut h) = handle else { return };
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match h.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => match sink.lock() {
                Ok(mut capture) => capture.push(&chunk[..n]),
                Err(_) => break,
            },
            Err(e) => {
                debug!(error = %e, "output stream read failed");
                break;
            }
        }
    }
}

/// SIGTERM the child's process group, give it [`TERMINATE_GRACE`], then
/// SIGKILL whatever is left and reap the child.
#[cfg(unix)]
async fn terminate_group(pid: Option<u32>, child: &mut Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw) else {
        let _ = child.kill().await;
        return;
    };

    match killpg(pgid, Signal::SIGTERM) {
        // Group already gone.
        Err(Errno::ESRCH) => {
            let _ = child.wait().await;
            return;
        }
        Err(e) => debug!(pgid = %pgid, error = %e, "SIGTERM to process group failed"),
        Ok(()) => {}
    }

    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        // Reap the leader first; a zombie still counts as a group member.
        let _ = child.try_wait();
        if killpg(pgid, None).is_err() {
            let _ = child.wait().await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            debug!(pgid = %pgid, error = %e, "SIGKILL to process group failed");
        }
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_group(_pid: Option<u32>, child: &mut Child) {
    let _ = child.kill().await;
}
