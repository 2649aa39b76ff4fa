//! Stream protocol emitted by the agent with `--output-format stream-json`.
//!
//! One JSON document per line. Lines that are not JSON, or are JSON of an
//! unknown shape, decode to [`Decoded::Unrecognized`] and are dropped by the
//! [`LineDecoder`]; they are expected noise, not a fatal condition.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// One validated event from the agent's standard output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    System(SystemInit),
    User(MessageEvent),
    Assistant(MessageEvent),
    Thinking(ThinkingEvent),
    ToolCall(ToolCallEvent),
    Result(ResultEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemSubtype {
    Init,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInit {
    pub subtype: SystemSubtype,
    pub session_id: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, rename = "permissionMode")]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub message: Message,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Concatenated text of every text block, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingPhase {
    Delta,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingEvent {
    pub subtype: ThinkingPhase,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPhase {
    Started,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub subtype: ToolCallPhase,
    pub call_id: String,
    pub tool_call: ToolCall,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Tool-specific payload, keyed by tool kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolCall {
    #[serde(rename = "readToolCall")]
    Read(PathToolCall),
    #[serde(rename = "writeToolCall")]
    Write(PathToolCall),
    #[serde(rename = "function")]
    Function(FunctionCall),
}

impl ToolCall {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolCall::Read(_) => "read",
            ToolCall::Write(_) => "write",
            ToolCall::Function(_) => "function",
        }
    }

    pub fn result(&self) -> Option<&ToolResult> {
        match self {
            ToolCall::Read(call) | ToolCall::Write(call) => call.result.as_ref(),
            ToolCall::Function(call) => call.result.as_ref(),
        }
    }

    /// Short human label: the path for file tools, the name for functions.
    pub fn label(&self) -> &str {
        match self {
            ToolCall::Read(call) | ToolCall::Write(call) => &call.args.path,
            ToolCall::Function(call) => &call.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathToolCall {
    pub args: PathArgs,
    #[serde(default)]
    pub result: Option<ToolResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub result: Option<ToolResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResult {
    Success(Value),
    Error(Value),
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Error(_))
    }
}

/// Terminal event; ends the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    pub is_error: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl StreamEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            StreamEvent::System(init) => Some(init.session_id.as_str()),
            StreamEvent::User(msg) | StreamEvent::Assistant(msg) => msg.session_id.as_deref(),
            StreamEvent::Thinking(ev) => ev.session_id.as_deref(),
            StreamEvent::ToolCall(ev) => ev.session_id.as_deref(),
            StreamEvent::Result(ev) => ev.session_id.as_deref(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Result(_))
    }
}

/// Outcome of decoding one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(Box<StreamEvent>),
    Unrecognized,
}

/// Decode one complete line. Blank lines, non-JSON and unknown shapes are
/// [`Decoded::Unrecognized`].
pub fn decode_line(line: &str) -> Decoded {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Decoded::Unrecognized;
    }
    match serde_json::from_str::<StreamEvent>(trimmed) {
        Ok(event) => Decoded::Event(Box::new(event)),
        Err(_) => Decoded::Unrecognized,
    }
}

/// Incremental newline-delimited decoder.
///
/// Chunks may end anywhere, including mid-line or mid-UTF-8 sequence; bytes
/// after the last newline stay buffered until more input or [`finish`].
///
/// [`finish`]: LineDecoder::finish
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    dropped: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.decode_into(&line, &mut events);
        }
        events
    }

    /// Flush a trailing unterminated line through the same validation path.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let line = std::mem::take(&mut self.pending);
        let mut events = Vec::new();
        self.decode_into(&line, &mut events);
        events
    }

    /// Non-blank lines dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn decode_into(&mut self, line: &[u8], events: &mut Vec<StreamEvent>) {
        let text = String::from_utf8_lossy(line);
        if text.trim().is_empty() {
            return;
        }
        match decode_line(&text) {
            Decoded::Event(event) => events.push(*event),
            Decoded::Unrecognized => {
                self.dropped += 1;
                debug!(
                    dropped = self.dropped,
                    bytes = line.len(),
                    "dropped unrecognized stream line"
                );
            }
        }
    }
}
