//! Structured activity events and the sinks that receive them.
//!
//! Two destinations are independent sinks: a one-line console preview and an
//! append-only JSONL record at `.taskloop/activity/<run-id>.jsonl`. Callers
//! compose them with [`FanoutSink`].

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::warn;

/// An activity event. Serialized as tagged JSON (`"type": "task_started"`, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    RunStarted {
        run_id: String,
        branch: String,
        pending: usize,
    },
    RunFinished {
        run_id: String,
        outcome: String,
        completed: usize,
        total: usize,
    },
    TaskStarted {
        task_id: String,
        title: String,
        resumed: bool,
    },
    TaskFinished {
        task_id: String,
        outcome: String,
        duration_ms: u64,
        iterations: u32,
    },
    IterationStarted {
        task_id: String,
        iteration: u32,
    },
    IterationFinished {
        task_id: String,
        iteration: u32,
        progress: String,
        complete: bool,
        output_bytes: usize,
    },
    ToolCall {
        task_id: String,
        kind: String,
        label: String,
    },
    RetryScheduled {
        task_id: String,
        kind: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    TokenWarning {
        task_id: String,
        bytes: usize,
    },
    WorkflowRestart {
        attempt: u32,
        reason: String,
    },
}

impl ActivityEvent {
    /// One-line human preview.
    pub fn preview(&self) -> String {
        match self {
            ActivityEvent::RunStarted {
                run_id,
                branch,
                pending,
            } => format!("run {run_id} on {branch}: {pending} task(s) pending"),
            ActivityEvent::RunFinished {
                run_id,
                outcome,
                completed,
                total,
            } => format!("run {run_id} {outcome}: {completed}/{total} tasks complete"),
            ActivityEvent::TaskStarted {
                task_id,
                title,
                resumed,
            } => {
                let tag = if *resumed { " (resumed)" } else { "" };
                format!("> {task_id} {title}{tag}")
            }
            ActivityEvent::TaskFinished {
                task_id,
                outcome,
                duration_ms,
                iterations,
            } => format!(
                "< {task_id} {outcome} after {iterations} iteration(s), {:.1}s",
                *duration_ms as f64 / 1000.0
            ),
            ActivityEvent::IterationStarted { task_id, iteration } => {
                format!("  {task_id} iteration {iteration}")
            }
            ActivityEvent::IterationFinished {
                task_id,
                iteration,
                progress,
                complete,
                ..
            } => {
                let done = if *complete { ", complete" } else { "" };
                format!("  {task_id} iteration {iteration}: {progress}{done}")
            }
            ActivityEvent::ToolCall { kind, label, .. } => format!("    {kind} {label}"),
            ActivityEvent::RetryScheduled {
                kind,
                attempt,
                delay_ms,
                reason,
                ..
            } => format!("  retry {kind} #{attempt} in {delay_ms}ms: {reason}"),
            ActivityEvent::TokenWarning { task_id, bytes } => {
                format!("  {task_id}: {bytes} bytes of output accumulated")
            }
            ActivityEvent::WorkflowRestart { attempt, reason } => {
                format!("restarting workflow (#{attempt}): {reason}")
            }
        }
    }
}

/// Receiver of activity events.
pub trait ActivitySink {
    fn emit(&mut self, event: &ActivityEvent);
}

pub struct NullSink;

impl ActivitySink for NullSink {
    fn emit(&mut self, _event: &ActivityEvent) {}
}

/// Prints one preview line per event.
pub struct ConsoleSink<W: Write> {
    out: W,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ActivitySink for ConsoleSink<W> {
    fn emit(&mut self, event: &ActivityEvent) {
        if let Err(err) = writeln!(self.out, "{}", event.preview()) {
            warn!(err = %err, "failed to write console activity");
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    seq: u64,
    ts: String,
    #[serde(flatten)]
    event: &'a ActivityEvent,
}

/// Append-only JSONL writer. Best-effort: write failures are logged, not raised.
pub struct JsonlSink {
    path: PathBuf,
    seq: u64,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seq: 0,
        }
    }
}

impl ActivitySink for JsonlSink {
    fn emit(&mut self, event: &ActivityEvent) {
        let record = Record {
            seq: self.seq,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
        };
        self.seq += 1;
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(err) = append_line(&self.path, &line) {
                    warn!(err = %err, path = %self.path.display(), "failed to append activity");
                }
            }
            Err(err) => warn!(err = %err, "failed to serialize activity"),
        }
    }
}

fn append_line(path: &Path, line: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// Forwards every event to each inner sink, in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn ActivitySink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ActivitySink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl ActivitySink for FanoutSink {
    fn emit(&mut self, event: &ActivityEvent) {
        for sink in &mut self.sinks {
            sink.emit(event);
        }
    }
}
