//! Agent session: the single-shot and streaming call API.
//!
//! The [`Agent`] trait decouples the iteration loop from the real CLI backend.
//! Tests use scripted agents that return predetermined responses without
//! spawning processes.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::command::{CallOptions, InvocationOptions, OutputFormat, Resume, build_args};
use crate::core::events::{LineDecoder, ResultEvent, StreamEvent, ToolCallPhase, ToolResult};
use crate::error::AgentError;
use crate::io::process::{EnvValue, ProcessSpec, run_collect, spawn};

/// One agent call.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub resume: Resume,
    pub stream_partial_output: bool,
    pub cancel: Option<CancellationToken>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Running size of the accumulated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenProgress {
    pub bytes: usize,
    /// Rough estimate: four bytes per token.
    pub approx_tokens: usize,
}

impl TokenProgress {
    pub fn from_bytes(bytes: usize) -> Self {
        Self {
            bytes,
            approx_tokens: bytes.div_ceil(4),
        }
    }
}

/// Callbacks invoked while a streaming call is in flight.
pub trait StreamObserver {
    fn on_event(&mut self, _event: &StreamEvent) {}
    fn on_progress(&mut self, _progress: TokenProgress) {}
}

pub struct NoopObserver;

impl StreamObserver for NoopObserver {}

/// Product of a streaming call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamResponse {
    pub text: String,
    pub session_id: Option<String>,
    pub result: Option<ResultEvent>,
    pub tool_calls: u32,
    pub dropped_lines: u64,
}

/// Abstraction over agent backends.
pub trait Agent {
    /// Run to completion and return the terminal result document.
    fn call(&self, request: &AgentRequest) -> Result<ResultEvent, AgentError>;

    /// Run with streamed events, accumulating assistant text.
    fn stream(
        &self,
        request: &AgentRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<StreamResponse, AgentError>;
}

/// Agent backed by the external CLI binary.
#[derive(Debug, Clone)]
pub struct CliAgent {
    options: InvocationOptions,
    env: Vec<(String, EnvValue)>,
    workdir: PathBuf,
}

impl CliAgent {
    pub fn new(
        options: InvocationOptions,
        env: Vec<(String, EnvValue)>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            options,
            env,
            workdir: workdir.into(),
        }
    }

    fn process_spec(
        &self,
        request: &AgentRequest,
        format: OutputFormat,
    ) -> Result<ProcessSpec, AgentError> {
        let call = CallOptions {
            prompt: request.prompt.clone(),
            model: request.model.clone(),
            output_format: format,
            print: true,
            stream_partial_output: request.stream_partial_output,
            resume: request.resume.clone(),
            sandbox: None,
        };
        Ok(ProcessSpec {
            program: self.options.binary.clone(),
            args: build_args(&self.options, &call)?,
            env: self.env.clone(),
            workdir: Some(self.workdir.clone()),
        })
    }
}

impl Agent for CliAgent {
    #[instrument(skip_all, fields(binary = %self.options.binary, model = ?request.model))]
    fn call(&self, request: &AgentRequest) -> Result<ResultEvent, AgentError> {
        let spec = self.process_spec(request, OutputFormat::Json)?;
        info!("starting single-shot agent call");
        let (stdout, _exit) = run_collect(&spec, request.cancel.clone())?;
        parse_final_result(&stdout)
    }

    #[instrument(skip_all, fields(binary = %self.options.binary, model = ?request.model))]
    fn stream(
        &self,
        request: &AgentRequest,
        observer: &mut dyn StreamObserver,
    ) -> Result<StreamResponse, AgentError> {
        let spec = self.process_spec(request, OutputFormat::StreamJson)?;
        info!("starting streaming agent call");
        let mut process = spawn(&spec, request.cancel.clone())?;
        let mut decoder = LineDecoder::new();
        let mut session = Session::default();

        // The result event is terminal: stop reading as soon as it arrives.
        let mut drained = false;
        while session.result.is_none() {
            match process.next_chunk() {
                Ok(Some(chunk)) => {
                    for event in decoder.push(&chunk) {
                        session.apply(event, observer);
                    }
                }
                Ok(None) => {
                    for event in decoder.finish() {
                        session.apply(event, observer);
                    }
                    drained = true;
                    break;
                }
                Err(err) => return Err(session.fail(err)),
            }
        }
        if decoder.dropped() > 0 {
            debug!(dropped = decoder.dropped(), "stream lines dropped during call");
        }

        let exit = if drained {
            process.finish().map(|_| ())
        } else {
            debug!("terminal result received, stopping agent process");
            process.stop().map(|_| ())
        };
        if let Err(err) = exit {
            return Err(session.fail(err));
        }
        session.into_response(decoder.dropped())
    }
}

/// Per-call accumulation state.
#[derive(Default)]
struct Session {
    text: String,
    session_id: Option<String>,
    result: Option<ResultEvent>,
    tool_calls: u32,
}

impl Session {
    fn apply(&mut self, event: StreamEvent, observer: &mut dyn StreamObserver) {
        if self.result.is_some() {
            debug!("ignoring event after terminal result");
            return;
        }
        if let Some(id) = event.session_id() {
            self.session_id = Some(id.to_string());
        }
        observer.on_event(&event);
        match event {
            StreamEvent::Assistant(message) => {
                self.text.push_str(&message.message.text());
                observer.on_progress(TokenProgress::from_bytes(self.text.len()));
            }
            StreamEvent::ToolCall(call) => match call.subtype {
                ToolCallPhase::Started => self.tool_calls += 1,
                ToolCallPhase::Completed => {
                    if call.tool_call.result().is_some_and(ToolResult::is_error) {
                        debug!(
                            tool = call.tool_call.kind(),
                            label = call.tool_call.label(),
                            "tool call failed"
                        );
                    }
                }
            },
            StreamEvent::Result(result) => self.result = Some(result),
            _ => {}
        }
    }

    fn partial(&self) -> Option<String> {
        (!self.text.is_empty()).then(|| self.text.clone())
    }

    /// An error result already received explains the failure better than the
    /// exit status does.
    fn reported_error(&self) -> Option<AgentError> {
        let result = self.result.as_ref().filter(|result| result.is_error)?;
        warn!(message = %result.result, "agent reported an error result");
        Some(AgentError::Reported {
            message: result.result.clone(),
            session_id: self.session_id.clone(),
            partial_response: self.partial(),
        })
    }

    fn fail(&self, err: AgentError) -> AgentError {
        if err.is_cancelled() {
            return err;
        }
        self.reported_error().unwrap_or_else(|| self.attach_partial(err))
    }

    fn attach_partial(&self, err: AgentError) -> AgentError {
        match err {
            AgentError::ProcessFailed {
                code, stderr, args, ..
            } => AgentError::ProcessFailed {
                code,
                stderr,
                args,
                partial_response: self.partial(),
            },
            other => other,
        }
    }

    fn into_response(self, dropped_lines: u64) -> Result<StreamResponse, AgentError> {
        if let Some(err) = self.reported_error() {
            return Err(err);
        }
        let mut text = self.text;
        if text.is_empty()
            && let Some(result) = &self.result
        {
            text = result.result.clone();
        }
        Ok(StreamResponse {
            text,
            session_id: self.session_id,
            result: self.result,
            tool_calls: self.tool_calls,
            dropped_lines,
        })
    }
}

/// Parse the last non-blank stdout line as the terminal result document.
pub fn parse_final_result(stdout: &[u8]) -> Result<ResultEvent, AgentError> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or(AgentError::EmptyOutput)?;
    match serde_json::from_str::<StreamEvent>(line.trim()) {
        Ok(StreamEvent::Result(result)) => Ok(result),
        Ok(other) => Err(AgentError::InvalidResult(format!(
            "last line is not a result document: {other:?}"
        ))),
        Err(err) => Err(AgentError::InvalidResult(err.to_string())),
    }
}
