//! Argument-vector construction for the wrapped agent binary.
//!
//! Pure: the same [`InvocationOptions`] and [`CallOptions`] always produce the
//! same vector, so the whole CLI surface is testable without a subprocess.

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Output format requested from the agent binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    StreamJson,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::StreamJson => "stream-json",
        }
    }
}

/// Which conversation, if any, the call continues.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Resume {
    #[default]
    Fresh,
    /// Continue the most recent conversation.
    Latest,
    /// Continue a specific session/chat id.
    Session(String),
}

/// Base options fixed for the lifetime of a harness run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationOptions {
    pub binary: String,
    pub credential: Option<String>,
    pub force: bool,
    pub approve_tools: bool,
    pub sandbox: Option<String>,
    pub extra_args: Vec<String>,
}

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub prompt: String,
    pub model: Option<String>,
    pub output_format: OutputFormat,
    pub print: bool,
    pub stream_partial_output: bool,
    pub resume: Resume,
    /// Overrides [`InvocationOptions::sandbox`] when set.
    pub sandbox: Option<String>,
}

/// Build the argument vector (binary excluded) for one agent call.
///
/// Order: base flags, print/output-format, partial output, resume, model,
/// sandbox, extra arguments, prompt.
pub fn build_args(base: &InvocationOptions, call: &CallOptions) -> Result<Vec<String>, AgentError> {
    if call.prompt.trim().is_empty() {
        return Err(AgentError::InvalidArgument(
            "prompt must not be empty".to_string(),
        ));
    }

    let mut args = Vec::new();
    if base.force {
        args.push("--force".to_string());
    }
    if base.approve_tools {
        args.push("--approve-mcps".to_string());
    }
    if let Some(key) = &base.credential {
        args.push("--api-key".to_string());
        args.push(key.clone());
    }

    if call.print || call.output_format != OutputFormat::Text {
        args.push("--print".to_string());
    }
    if call.output_format != OutputFormat::Text {
        args.push("--output-format".to_string());
        args.push(call.output_format.as_str().to_string());
    }
    if call.output_format == OutputFormat::StreamJson && call.stream_partial_output {
        args.push("--stream-partial-output".to_string());
    }

    match &call.resume {
        Resume::Fresh => {}
        Resume::Latest => args.push("--continue".to_string()),
        Resume::Session(id) => {
            args.push("--resume".to_string());
            args.push(id.clone());
        }
    }

    if let Some(model) = &call.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    if let Some(sandbox) = call.sandbox.as_ref().or(base.sandbox.as_ref()) {
        args.push("--sandbox".to_string());
        args.push(sandbox.clone());
    }

    args.extend(base.extra_args.iter().cloned());
    args.push(call.prompt.clone());
    Ok(args)
}
