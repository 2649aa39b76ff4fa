//! Test-only fakes and builders: a scripted agent, a manual clock, a
//! recording activity sink, and a throwaway git repository.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::events::{ResultEvent, StreamEvent};
use crate::core::types::{Task, TaskCollection};
use crate::error::AgentError;
use crate::io::activity::{ActivityEvent, ActivitySink};
use crate::io::agent::{Agent, AgentRequest, StreamObserver, StreamResponse, TokenProgress};
use crate::io::clock::Clock;
use crate::io::config::{HarnessConfig, HarnessPaths};
use crate::io::task_store::{load_collection, save_collection};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Failure(String),
    Connection,
    Reported(String, Option<String>),
    Cancelled,
}

/// One scripted agent call.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    reply: Reply,
    takes: Duration,
    tool_paths: Vec<String>,
    writes: Vec<(PathBuf, String)>,
}

impl ScriptedCall {
    fn of(reply: Reply) -> Self {
        Self {
            reply,
            takes: Duration::ZERO,
            tool_paths: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Successful call producing `text`.
    pub fn text(text: &str) -> Self {
        Self::of(Reply::Text(text.to_string()))
    }

    /// Process exit with `stderr` as the failure text.
    pub fn failure(stderr: &str) -> Self {
        Self::of(Reply::Failure(stderr.to_string()))
    }

    pub fn connection_error() -> Self {
        Self::of(Reply::Connection)
    }

    /// Error result document reported by the agent itself.
    pub fn reported(message: &str, session_id: Option<&str>) -> Self {
        Self::of(Reply::Reported(
            message.to_string(),
            session_id.map(str::to_string),
        ))
    }

    pub fn cancelled() -> Self {
        Self::of(Reply::Cancelled)
    }

    /// Advance the attached clock by `duration` during the call.
    pub fn taking(mut self, duration: Duration) -> Self {
        self.takes = duration;
        self
    }

    /// Emit a started read-tool event per path.
    pub fn with_tool_calls(mut self, paths: &[&str]) -> Self {
        self.tool_paths = paths.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Write a file as a side effect, like an agent editing the workspace.
    pub fn writing(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
        self.writes.push((path.into(), contents.to_string()));
        self
    }
}

/// Agent that replays a fixed script. Runs out as an unclassified error.
#[derive(Default)]
pub struct ScriptedAgent {
    script: RefCell<VecDeque<ScriptedCall>>,
    prompts: RefCell<Vec<String>>,
    calls: Cell<usize>,
    clock: RefCell<Option<ManualClock>>,
}

impl ScriptedAgent {
    pub fn new(script: Vec<ScriptedCall>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            ..Self::default()
        }
    }

    /// Share `clock` so scripted durations advance it.
    pub fn attach_clock(&self, clock: &ManualClock) {
        *self.clock.borrow_mut() = Some(clock.clone());
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    fn next(&self, request: &AgentRequest) -> Result<ScriptedCall, AgentError> {
        self.calls.set(self.calls.get() + 1);
        self.prompts.borrow_mut().push(request.prompt.clone());
        let step = self
            .script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| AgentError::InvalidResult("script exhausted".to_string()))?;
        if let Some(clock) = self.clock.borrow().as_ref() {
            clock.advance(step.takes);
        }
        for (path, contents) in &step.writes {
            fs::write(path, contents)?;
        }
        Ok(step)
    }
}

fn reply_error(reply: Reply) -> AgentError {
    match reply {
        Reply::Failure(stderr) => AgentError::ProcessFailed {
            code: Some(1),
            stderr,
            args: Vec::new(),
            partial_response: None,
        },
        Reply::Connection => AgentError::ProcessFailed {
            code: Some(1),
            stderr: "read ECONNRESET".to_string(),
            args: Vec::new(),
            partial_response: Some("half a thought".to_string()),
        },
        Reply::Reported(message, session_id) => AgentError::Reported {
            message,
            session_id,
            partial_response: None,
        },
        Reply::Cancelled => AgentError::Cancelled,
        Reply::Text(_) => AgentError::InvalidResult("unexpected text reply".to_string()),
    }
}

impl Agent for ScriptedAgent {
    fn call(&self, request: &AgentRequest) -> Result<ResultEvent, AgentError> {
        let step = self.next(request)?;
        match step.reply {
            Reply::Text(text) => Ok(ResultEvent {
                subtype: Some("success".to_string()),
                duration_ms: 0,
                duration_api_ms: 0,
                is_error: false,
                result: text,
                session_id: Some("scripted-session".to_string()),
            }),
            other => Err(reply_error(other)),
        }
    }

    fn stream(
        &self,
        request: &AgentRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<StreamResponse, AgentError> {
        let step = self.next(request)?;
        for (idx, path) in step.tool_paths.iter().enumerate() {
            let event: StreamEvent = serde_json::from_value(json!({
                "type": "tool_call",
                "subtype": "started",
                "call_id": format!("call-{idx}"),
                "tool_call": {"readToolCall": {"args": {"path": path}}},
            }))
            .map_err(|err| AgentError::InvalidResult(err.to_string()))?;
            observer.on_event(&event);
        }
        match step.reply {
            Reply::Text(text) => {
                observer.on_progress(TokenProgress::from_bytes(text.len()));
                Ok(StreamResponse {
                    tool_calls: u32::try_from(step.tool_paths.len()).unwrap_or(u32::MAX),
                    session_id: Some("scripted-session".to_string()),
                    text,
                    result: None,
                    dropped_lines: 0,
                })
            }
            other => Err(reply_error(other)),
        }
    }
}

#[derive(Debug)]
struct ClockState {
    now: Instant,
    sleeps: Vec<Duration>,
}

/// Clock that only moves when told to. Sleeps advance it instantly.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Rc<RefCell<ClockState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(ClockState {
                now: Instant::now(),
                sleeps: Vec::new(),
            })),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.borrow_mut();
        state.now += by;
    }

    /// Every requested sleep, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.borrow().sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.state.borrow().now
    }

    fn sleep(&self, duration: Duration, cancel: Option<&CancellationToken>) -> bool {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return false;
        }
        let mut state = self.state.borrow_mut();
        state.sleeps.push(duration);
        state.now += duration;
        true
    }
}

/// Sink that keeps every event for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<ActivityEvent>,
}

impl RecordingSink {
    /// Number of events whose serialized `type` tag equals `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .iter()
            .filter(|event| {
                serde_json::to_value(event)
                    .ok()
                    .is_some_and(|value| value["type"] == kind)
            })
            .count()
    }
}

impl ActivitySink for RecordingSink {
    fn emit(&mut self, event: &ActivityEvent) {
        self.events.push(event.clone());
    }
}

/// Defaults with zero retry delays.
pub fn fast_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.retry.connection_base_delay_ms = 0;
    config.retry.loop_delay_ms = 0;
    config
}

pub fn task_with_criteria(id: &str, criteria: &[&str]) -> Task {
    let mut task = Task::new(id, format!("{id} title"));
    task.description = format!("{id} description");
    task.acceptance_criteria = criteria.iter().map(|c| (*c).to_string()).collect();
    task
}

pub fn collection(branch: &str, tasks: Vec<Task>) -> TaskCollection {
    TaskCollection {
        created_at: "2026-01-01T00:00:00Z".to_string(),
        branch_name: branch.to_string(),
        tasks,
    }
}

/// Temporary git repository with a committer identity configured.
pub struct TestRepo {
    pub temp: tempfile::TempDir,
    pub paths: HarnessPaths,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path();
        git(root, &["init"])?;
        git(root, &["config", "user.email", "test@example.com"])?;
        git(root, &["config", "user.name", "Test"])?;
        let paths = HarnessPaths::new(root);
        fs::create_dir_all(&paths.dir).context("create harness dir")?;
        Ok(Self { temp, paths })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn write_tasks(&self, collection: &TaskCollection) -> Result<()> {
        save_collection(&self.paths.tasks, collection)
    }

    pub fn read_tasks(&self) -> Result<TaskCollection> {
        load_collection(&self.paths.tasks)
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        git(self.root(), args)
    }
}

fn git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
