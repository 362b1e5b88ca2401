//! # Command Runner
//!
//! Spawns host commands as argv arrays (never through a shell), enforces a
//! wall-clock timeout, and captures stdout/stderr concurrently so partial
//! output survives a kill. Children run in their own process group; timeout
//! and cancellation send SIGTERM to the group, wait a short grace window,
//! then SIGKILL.
//!
//! The runner holds no shared mutable state; concurrent invocations are
//! independent.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Grace window between SIGTERM and SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(5);

/// One subprocess invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Structured outcome of a subprocess run.
///
/// `success` is true only for a clean zero exit. Timeouts, signals, spawn
/// failures, and non-zero exits all set `success=false` with a description
/// in `error`.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl CommandResult {
    /// Convert into an `EngineResult`, mapping failure kinds onto the
    /// engine's error taxonomy.
    pub fn into_result(self) -> EngineResult<CommandResult> {
        if self.success {
            return Ok(self);
        }
        let message = self
            .error
            .clone()
            .unwrap_or_else(|| "command failed".to_string());
        if self.timed_out {
            Err(EngineError::Timeout(message))
        } else {
            Err(EngineError::Command(message))
        }
    }
}

/// Run a command to completion under its configured timeout.
pub async fn run(spec: CommandSpec) -> CommandResult {
    run_with_cancel(spec, &CancellationToken::new()).await
}

/// Run a command, terminating early if `cancel` fires.
///
/// Cancellation and timeout share the same termination path: SIGTERM to the
/// child's process group, `TERM_GRACE`, then SIGKILL.
pub async fn run_with_cancel(spec: CommandSpec, cancel: &CancellationToken) -> CommandResult {
    let started = Instant::now();

    let Some((program, args)) = spec.argv.split_first() else {
        return spawn_failure(started, "empty argv".to_string());
    };

    debug!(command = %program, args = ?args, timeout_secs = spec.timeout.as_secs(), "running command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so the whole subtree can be signalled.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return spawn_failure(started, format!("failed to spawn {program}: {e}"));
        }
    };
    let pgid = child.id();

    if let Some(bytes) = spec.stdin.clone() {
        if let Some(mut sink) = child.stdin.take() {
            // Drop after the write so the child sees EOF.
            if let Err(e) = sink.write_all(&bytes).await {
                debug!(error = %e, "failed to write command stdin");
            }
        }
    }

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        match stdout_pipe {
            Some(pipe) => drain(pipe).await,
            None => Vec::new(),
        }
    });
    let stderr_task = tokio::spawn(async move {
        match stderr_pipe {
            Some(pipe) => drain(pipe).await,
            None => Vec::new(),
        }
    });

    let mut interrupted: Option<&'static str> = None;
    let wait_result = tokio::select! {
        res = child.wait() => Some(res),
        _ = tokio::time::sleep(spec.timeout) => {
            interrupted = Some("timeout");
            None
        }
        _ = cancel.cancelled() => {
            interrupted = Some("cancelled");
            None
        }
    };

    let wait_result = match wait_result {
        Some(res) => res,
        None => {
            warn!(
                command = %program,
                reason = interrupted.unwrap_or("interrupted"),
                "terminating command process group"
            );
            signal_group(pgid, libc::SIGTERM);
            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(res) => res,
                Err(_) => {
                    signal_group(pgid, libc::SIGKILL);
                    child.wait().await
                }
            }
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default())
        .trim()
        .to_string();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default())
        .trim()
        .to_string();
    let duration = started.elapsed();

    match (interrupted, wait_result) {
        (Some("timeout"), _) => CommandResult {
            success: false,
            stdout,
            stderr,
            exit_code: None,
            duration,
            timed_out: true,
            error: Some(format!(
                "command timed out after {}s: {program}",
                spec.timeout.as_secs()
            )),
        },
        (Some(_), _) => CommandResult {
            success: false,
            stdout,
            stderr,
            exit_code: None,
            duration,
            timed_out: false,
            error: Some(format!("command cancelled: {program}")),
        },
        (None, Ok(status)) => {
            if status.success() {
                CommandResult {
                    success: true,
                    stdout,
                    stderr,
                    exit_code: status.code(),
                    duration,
                    timed_out: false,
                    error: None,
                }
            } else {
                let exit_code = status.code();
                let detail = if stderr.is_empty() {
                    status.to_string()
                } else {
                    stderr.clone()
                };
                CommandResult {
                    success: false,
                    stdout,
                    stderr,
                    exit_code,
                    duration,
                    timed_out: false,
                    error: Some(match exit_code {
                        Some(code) => format!("{program} exited with code {code}: {detail}"),
                        None => format!("{program} terminated by signal: {detail}"),
                    }),
                }
            }
        }
        (None, Err(e)) => CommandResult {
            success: false,
            stdout,
            stderr,
            exit_code: None,
            duration,
            timed_out: false,
            error: Some(format!("failed to wait for {program}: {e}")),
        },
    }
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    buf
}

fn spawn_failure(started: Instant, error: String) -> CommandResult {
    CommandResult {
        success: false,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: None,
        duration: started.elapsed(),
        timed_out: false,
        error: Some(error),
    }
}

#[cfg(unix)]
fn signal_group(pgid: Option<u32>, signal: i32) {
    if let Some(pgid) = pgid {
        // Negative pid targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), signal) };
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, _signal: i32) {}
