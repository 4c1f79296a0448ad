// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Child-process primitive used for every spawned program: the long-lived
//! stream transcoders, the short-lived frame extractors, and the detector
//! worker.
//!
//! Each child moves Starting → Running → Closed. Output is delivered
//! line-wise to callbacks from reader tasks; exit is delivered once through
//! `on_close` after both output streams have drained, so no trailing lines
//! are lost. Writes to a dead child's stdin are logged and discarded; they
//! never fault the supervisor.

use base::{bail_t, format_err_t, Error, ErrorKind};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncWriteExt as _, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

pub type LineFn = Box<dyn FnMut(&str) + Send>;
pub type CloseFn = Box<dyn FnOnce(ExitInfo) + Send>;

/// How a child exited: a normal exit code or the terminating signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn clean(&self) -> bool {
        self.code == Some(0)
    }
}

pub struct Spawn {
    pub name: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Pipe stdin for line writes; otherwise stdin is null.
    pub pipe_stdin: bool,
    pub on_stdout: Option<LineFn>,
    pub on_stderr: Option<LineFn>,
    pub on_close: Option<CloseFn>,
}

impl Spawn {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>, args: Vec<String>) -> Self {
        Spawn {
            name: name.into(),
            cmd: cmd.into(),
            args,
            cwd: None,
            pipe_stdin: false,
            on_stdout: None,
            on_stderr: None,
            on_close: None,
        }
    }
}

struct Shared {
    name: String,
    pid: u32,
    exit: Mutex<Option<ExitInfo>>,
}

/// Handle to a spawned child. Cloneable; all clones observe the same exit
/// state and share the stdin writer.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
}

impl Handle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    /// `None` while running.
    pub fn exit(&self) -> Option<ExitInfo> {
        *self.shared.exit.lock().unwrap()
    }

    pub fn is_alive(&self) -> bool {
        self.exit().is_none()
    }

    /// Writes one line to the child's stdin, best-effort. A write to a dead
    /// or never-piped child is logged and dropped. Returns whether the line
    /// was written.
    pub async fn write_line(&self, line: &str) -> bool {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            debug!("{}: dropping stdin write, no pipe", self.shared.name);
            return false;
        };
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        if let Err(e) = stdin.write_all(&buf).await {
            // EPIPE from an exiting child is expected; drop the writer so
            // later writes short-circuit.
            warn!("{}: stdin write failed: {e}", self.shared.name);
            *guard = None;
            return false;
        }
        true
    }

    /// Sends a signal; failures (e.g. the process is already gone) are
    /// logged and ignored.
    pub fn kill(&self, signal: Signal) {
        if !self.is_alive() {
            return;
        }
        debug!("{}: sending {signal} to pid {}", self.shared.name, self.shared.pid);
        if let Err(e) = kill(Pid::from_raw(self.shared.pid as i32), signal) {
            debug!("{}: kill failed: {e}", self.shared.name);
        }
    }

    /// SIGTERM now, SIGKILL after `grace` if the child hasn't exited.
    pub fn kill_with_escalation(&self, grace: Duration) {
        self.kill(Signal::SIGTERM);
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if this.is_alive() {
                warn!("{}: did not exit after SIGTERM, sending SIGKILL", this.shared.name);
                this.kill(Signal::SIGKILL);
            }
        });
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R, mut f: Option<LineFn>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(f) = f.as_mut() {
                    f(&line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("output stream read failed: {e}");
                break;
            }
        }
    }
}

/// Spawns a child and its reader/waiter tasks.
///
/// `on_close` fires exactly once, after both output streams have reached
/// EOF, with the exit code or terminating signal.
pub fn spawn(opts: Spawn) -> Result<Handle, Error> {
    let Spawn {
        name,
        cmd,
        args,
        cwd,
        pipe_stdin,
        on_stdout,
        on_stderr,
        on_close,
    } = opts;

    let mut command = Command::new(&cmd);
    command
        .args(&args)
        .stdin(if pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &cwd {
        command.current_dir(cwd);
    }
    let mut child = command
        .spawn()
        .map_err(|e| Error::wrap(ErrorKind::Internal, e).context(format!("spawning {cmd}")))?;
    let pid = child
        .id()
        .ok_or_else(|| format_err_t!(Internal, "{name}: spawned child has no pid"))?;
    debug!("{name}: spawned {cmd} as pid {pid}");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();

    let shared = Arc::new(Shared {
        name,
        pid,
        exit: Mutex::new(None),
    });
    let handle = Handle {
        shared: shared.clone(),
        stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
    };

    let stdout_join = stdout.map(|out| tokio::spawn(read_lines(out, on_stdout)));
    let stderr_join = stderr.map(|out| tokio::spawn(read_lines(out, on_stderr)));

    let stdin_slot = handle.stdin.clone();
    tokio::spawn(async move {
        let status = child.wait().await;
        // Drain output before reporting close so no trailing lines are lost.
        if let Some(j) = stdout_join {
            let _ = j.await;
        }
        if let Some(j) = stderr_join {
            let _ = j.await;
        }
        let exit = match status {
            Ok(status) => ExitInfo {
                code: status.code(),
                signal: status.signal(),
            },
            Err(e) => {
                warn!("{}: wait failed: {e}", shared.name);
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        *stdin_slot.lock().await = None;
        *shared.exit.lock().unwrap() = Some(exit);
        debug!(
            "{}: pid {} closed with code {:?} signal {:?}",
            shared.name, shared.pid, exit.code, exit.signal
        );
        if let Some(f) = on_close {
            f(exit);
        }
    });

    Ok(handle)
}

#[derive(Debug)]
pub struct Output {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command to completion, capturing output. The child is killed when
/// `timeout` elapses.
pub async fn run_to_completion(
    cmd: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<Output, Error> {
    let child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::wrap(ErrorKind::Internal, e).context(format!("spawning {cmd}")))?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.map_err(|e| Error::wrap(ErrorKind::Internal, e))?;
            Ok(Output {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        // Dropping the future drops the child; kill_on_drop reaps it.
        Err(_) => Err(format_err_t!(
            DeadlineExceeded,
            "{cmd} did not finish within {timeout:?}"
        )),
    }
}

/// Waits for a spawned child to prove startup by producing a fresh output
/// artifact.
///
/// Ready means: the file exists and its mtime is within `max_file_age`.
/// Fails when the process dies first or `max_wait` elapses.
pub async fn verify_startup(
    handle: &Handle,
    output_file: &Path,
    max_wait: Duration,
    max_file_age: Duration,
    check_interval: Duration,
) -> Result<(), Error> {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if let Some(exit) = handle.exit() {
            bail_t!(
                FailedPrecondition,
                "{}: not ready: process exited (code {:?}, signal {:?}) before {} appeared",
                handle.name(),
                exit.code,
                exit.signal,
                output_file.display()
            );
        }
        if let Ok(metadata) = tokio::fs::metadata(output_file).await {
            let fresh = metadata
                .modified()
                .ok()
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                // An mtime in the future counts as fresh.
                .map(|age| age <= max_file_age)
                .unwrap_or(true);
            if fresh {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            bail_t!(
                DeadlineExceeded,
                "{}: not ready: {} was not fresh within {max_wait:?}",
                handle.name(),
                output_file.display()
            );
        }
        tokio::time::sleep(check_interval).await;
    }
}
