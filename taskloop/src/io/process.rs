//! Agent subprocess with streamed stdout and cooperative cancellation.
//!
//! Stdout is read on a worker thread and handed over a bounded channel in raw
//! chunks; stderr is drained concurrently on a second thread so a chatty child
//! never blocks on a full pipe. The consumer polls the channel so it can notice
//! cancellation between chunks.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::AgentError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CHUNK_SIZE: usize = 8192;
const CHANNEL_DEPTH: usize = 64;
const STDERR_LIMIT_BYTES: usize = 64 * 1024;
/// How long [`RunningProcess::stop`] waits for a voluntary exit.
const STOP_GRACE: Duration = Duration::from_millis(250);

/// Override value that removes a variable from the child's environment.
pub const UNSET: &str = "unset";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Set(String),
    Unset,
}

/// What to launch.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Applied on top of the inherited environment.
    pub env: Vec<(String, EnvValue)>,
    pub workdir: Option<PathBuf>,
}

impl ProcessSpec {
    /// Turn config-style overrides into env operations; `"unset"` removes.
    pub fn env_overrides(overrides: &BTreeMap<String, String>) -> Vec<(String, EnvValue)> {
        overrides
            .iter()
            .map(|(key, value)| {
                let value = if value == UNSET {
                    EnvValue::Unset
                } else {
                    EnvValue::Set(value.clone())
                };
                (key.clone(), value)
            })
            .collect()
    }
}

/// Exit summary of a fully drained process.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub stderr: String,
}

type StderrHandle = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

/// A spawned child whose stdout is consumed chunk by chunk.
pub struct RunningProcess {
    child: Child,
    args: Vec<String>,
    chunks: Receiver<std::io::Result<Vec<u8>>>,
    stderr: Option<StderrHandle>,
    cancel: Option<CancellationToken>,
    killed: bool,
    reaped: bool,
}

/// Spawn `spec`, binding `cancel` so that cancellation kills the child.
#[instrument(skip_all, fields(program = %spec.program, args = spec.args.len()))]
pub fn spawn(
    spec: &ProcessSpec,
    cancel: Option<CancellationToken>,
) -> Result<RunningProcess, AgentError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        match value {
            EnvValue::Set(v) => {
                cmd.env(key, v);
            }
            EnvValue::Unset => {
                cmd.env_remove(key);
            }
        }
    }
    if let Some(dir) = &spec.workdir {
        cmd.current_dir(dir);
    }

    debug!("spawning agent process");
    let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(out), Some(err)) => (out, err),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AgentError::ProcessUnavailable(
                "stdout/stderr were not attached".to_string(),
            ));
        }
    };

    let (tx, rx) = mpsc::sync_channel(CHANNEL_DEPTH);
    thread::spawn(move || pump_chunks(stdout, tx));
    let stderr = thread::spawn(move || read_stream_limited(stderr, STDERR_LIMIT_BYTES));

    Ok(RunningProcess {
        child,
        args: spec.args.clone(),
        chunks: rx,
        stderr: Some(stderr),
        cancel,
        killed: false,
        reaped: false,
    })
}

fn pump_chunks<R: Read>(mut reader: R, tx: SyncSender<std::io::Result<Vec<u8>>>) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                let _ = tx.send(Err(err));
                break;
            }
        }
    }
}

impl RunningProcess {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Next stdout chunk, `Ok(None)` at end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AgentError> {
        loop {
            if self.is_cancelled() {
                self.kill();
                return Err(AgentError::Cancelled);
            }
            match self.chunks.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(chunk)) => return Ok(Some(chunk)),
                Ok(Err(err)) => return Err(AgentError::Io(err)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    /// Kill the child. Safe to call any number of times.
    pub fn kill(&mut self) {
        if self.killed || self.reaped {
            return;
        }
        self.killed = true;
        debug!("killing agent process");
        if let Err(err) = self.child.kill() {
            warn!(err = %err, "failed to kill agent process");
        }
    }

    /// Wait for exit after stdout is drained.
    ///
    /// Non-zero exit becomes [`AgentError::ProcessFailed`] with the collected
    /// stderr and the argument vector; a kill caused by cancellation becomes
    /// [`AgentError::Cancelled`].
    pub fn finish(mut self) -> Result<ProcessExit, AgentError> {
        let status = loop {
            if self.is_cancelled() {
                self.kill();
            }
            match self.child.wait_timeout(POLL_INTERVAL) {
                Ok(Some(status)) => break status,
                Ok(None) => continue,
                Err(err) => return Err(AgentError::Io(err)),
            }
        };
        self.reaped = true;
        debug!(exit_code = ?status.code(), killed = self.killed, "agent process exited");

        // A killed child's descendants may still hold stderr open; don't wait on them.
        if self.killed || self.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let stderr = match self.stderr.take() {
            Some(handle) => join_stderr(handle),
            None => String::new(),
        };
        if !status.success() {
            return Err(AgentError::ProcessFailed {
                code: status.code(),
                stderr: stderr.trim().to_string(),
                args: std::mem::take(&mut self.args),
                partial_response: None,
            });
        }
        Ok(ProcessExit {
            code: status.code(),
            stderr,
        })
    }
}

impl RunningProcess {
    /// End a child whose output is no longer needed.
    ///
    /// Waits briefly for a voluntary exit, then kills and reaps it. The exit
    /// status is not inspected and the kill is not reported as cancellation.
    pub fn stop(mut self) -> Result<Option<i32>, AgentError> {
        let status = match self.child.wait_timeout(STOP_GRACE)? {
            Some(status) => status,
            None => {
                self.kill();
                self.child.wait()?
            }
        };
        self.reaped = true;
        debug!(exit_code = ?status.code(), killed = self.killed, "agent process stopped");
        Ok(status.code())
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn join_stderr(handle: StderrHandle) -> String {
    match handle.join() {
        Ok(Ok((bytes, truncated))) => {
            if truncated > 0 {
                warn!(truncated, "agent stderr truncated");
            }
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Ok(Err(err)) => {
            warn!(err = %err, "failed to read agent stderr");
            String::new()
        }
        Err(_) => {
            warn!("stderr reader thread panicked");
            String::new()
        }
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Run a process to completion and return all of stdout.
pub fn run_collect(
    spec: &ProcessSpec,
    cancel: Option<CancellationToken>,
) -> Result<(Vec<u8>, ProcessExit), AgentError> {
    let mut process = spawn(spec, cancel)?;
    let mut stdout = Vec::new();
    while let Some(chunk) = process.next_chunk()? {
        stdout.extend_from_slice(&chunk);
    }
    let exit = process.finish()?;
    Ok((stdout, exit))
}

/// Ensure `program` can be found, for early diagnostics.
pub fn check_program(program: &str) -> Result<()> {
    let found = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match found {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(anyhow!("agent binary {program:?} not found on PATH"))
        }
        Err(err) => Err(err).with_context(|| format!("run {program} --version")),
    }
}
