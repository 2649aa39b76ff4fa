//! Map an opaque failure to the recovery policy that owns it.
//!
//! Typed errors already in the chain win outright; everything else falls back
//! to keyword tables over the flattened message text. The tables are plain
//! data so they can be replaced from config.

use std::io;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, ConnectionError, LoopError, ResourceExhaustionError, find_in_chain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Cancelled,
    ResourceExhaustion,
    Connection,
    Loop,
    Unclassified,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::ResourceExhaustion => "resource_exhaustion",
            ErrorClass::Connection => "connection",
            ErrorClass::Loop => "loop",
            ErrorClass::Unclassified => "unclassified",
        }
    }
}

/// Keyword and code tables used for text-based classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierTables {
    pub connection_codes: Vec<String>,
    pub connection_keywords: Vec<String>,
    pub loop_phrases: Vec<String>,
    pub resource_keywords: Vec<String>,
}

impl Default for ClassifierTables {
    fn default() -> Self {
        fn owned(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| (*s).to_string()).collect()
        }
        Self {
            connection_codes: owned(&[
                "ECONNRESET",
                "ECONNREFUSED",
                "ETIMEDOUT",
                "EPIPE",
                "ENOTFOUND",
                "EAI_AGAIN",
            ]),
            connection_keywords: owned(&[
                "reset", "refused", "timeout", "timed out", "stalled", "aborted", "network",
                "socket",
            ]),
            loop_phrases: owned(&[
                "step limit",
                "max steps",
                "maximum steps",
                "max turns",
                "loop detected",
                "repetitive",
                "infinite loop",
                "too many iterations",
            ]),
            resource_keywords: owned(&[
                "context window",
                "context length",
                "context_length_exceeded",
                "prompt is too long",
                "too many tokens",
                "token limit",
                "resource exhausted",
                "resource_exhausted",
                "quota exceeded",
            ]),
        }
    }
}

impl ClassifierTables {
    pub fn validate(&self) -> Result<(), String> {
        for (name, table) in [
            ("connection_codes", &self.connection_codes),
            ("connection_keywords", &self.connection_keywords),
            ("loop_phrases", &self.loop_phrases),
            ("resource_keywords", &self.resource_keywords),
        ] {
            if table.iter().any(|entry| entry.trim().is_empty()) {
                return Err(format!("classifier.{name} must not contain blank entries"));
            }
        }
        Ok(())
    }
}

/// Everything the text classifier looks at, flattened out of an error chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureSignal {
    pub message: String,
    pub exit_code: Option<i32>,
    pub os_code: Option<String>,
}

impl FailureSignal {
    pub fn from_error(err: &anyhow::Error) -> Self {
        let message = format!("{err:#}");
        let exit_code = match find_in_chain::<AgentError>(err) {
            Some(AgentError::ProcessFailed { code, .. }) => *code,
            _ => None,
        };
        let os_code = find_in_chain::<ConnectionError>(err)
            .and_then(|c| c.os_code.clone())
            .or_else(|| find_in_chain::<io::Error>(err).and_then(|e| io_code_name(e.kind())))
            .or_else(|| match find_in_chain::<AgentError>(err) {
                Some(AgentError::Spawn { source, .. }) | Some(AgentError::Io(source)) => {
                    io_code_name(source.kind())
                }
                _ => None,
            });
        Self {
            message,
            exit_code,
            os_code,
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

fn io_code_name(kind: io::ErrorKind) -> Option<String> {
    let name = match kind {
        io::ErrorKind::ConnectionReset => "ECONNRESET",
        io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
        io::ErrorKind::TimedOut => "ETIMEDOUT",
        io::ErrorKind::BrokenPipe => "EPIPE",
        _ => return None,
    };
    Some(name.to_string())
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let haystack = haystack.to_lowercase();
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_lowercase()))
}

pub fn is_connection_error(signal: &FailureSignal, tables: &ClassifierTables) -> bool {
    let code_matches = signal.os_code.as_ref().is_some_and(|code| {
        tables
            .connection_codes
            .iter()
            .any(|known| known.eq_ignore_ascii_case(code))
    });
    code_matches
        || signal
            .message
            .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .any(|word| tables.connection_codes.iter().any(|code| code == word))
        || contains_any(&signal.message, &tables.connection_keywords)
}

pub fn is_loop_error(signal: &FailureSignal, tables: &ClassifierTables) -> bool {
    contains_any(&signal.message, &tables.loop_phrases)
}

pub fn is_resource_exhaustion_error(signal: &FailureSignal, tables: &ClassifierTables) -> bool {
    contains_any(&signal.message, &tables.resource_keywords)
}

/// Classify a failure. Order: cancelled, resource exhaustion, connection, loop.
pub fn classify_error(err: &anyhow::Error, tables: &ClassifierTables) -> ErrorClass {
    if find_in_chain::<AgentError>(err).is_some_and(AgentError::is_cancelled) {
        return ErrorClass::Cancelled;
    }
    if find_in_chain::<ResourceExhaustionError>(err).is_some() {
        return ErrorClass::ResourceExhaustion;
    }
    if find_in_chain::<ConnectionError>(err).is_some() {
        return ErrorClass::Connection;
    }
    if find_in_chain::<LoopError>(err).is_some() {
        return ErrorClass::Loop;
    }
    classify_signal(&FailureSignal::from_error(err), tables)
}

pub fn classify_signal(signal: &FailureSignal, tables: &ClassifierTables) -> ErrorClass {
    if is_resource_exhaustion_error(signal, tables) {
        ErrorClass::ResourceExhaustion
    } else if is_connection_error(signal, tables) {
        ErrorClass::Connection
    } else if is_loop_error(signal, tables) {
        ErrorClass::Loop
    } else {
        ErrorClass::Unclassified
    }
}
