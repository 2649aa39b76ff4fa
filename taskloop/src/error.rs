//! Typed failures surfaced by the agent layer and the recovery policies.
//!
//! [`AgentError`] is what a single agent call can fail with. The three
//! recovery kinds ([`ConnectionError`], [`LoopError`],
//! [`ResourceExhaustionError`]) are produced by the iteration controller once a
//! failure has been classified, and travel up inside `anyhow::Error` so callers
//! can recover them with [`find_in_chain`].

use std::error::Error as StdError;

use thiserror::Error;

/// Boxed underlying cause attached to a recovery error.
pub type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// Failure of a single agent invocation (single-shot or streaming).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent process unavailable: {0}")]
    ProcessUnavailable(String),

    #[error("agent produced no output")]
    EmptyOutput,

    #[error("invalid result document: {0}")]
    InvalidResult(String),

    #[error("agent exited with status {code:?}: {stderr}")]
    ProcessFailed {
        code: Option<i32>,
        stderr: String,
        args: Vec<String>,
        partial_response: Option<String>,
    },

    #[error("agent reported an error: {message}")]
    Reported {
        message: String,
        session_id: Option<String>,
        partial_response: Option<String>,
    },

    #[error("agent call cancelled")]
    Cancelled,

    #[error("agent output stream: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Text the agent produced before the failure, if any was captured.
    pub fn partial_response(&self) -> Option<&str> {
        match self {
            AgentError::ProcessFailed {
                partial_response, ..
            }
            | AgentError::Reported {
                partial_response, ..
            } => partial_response.as_deref(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }
}

/// Transport-level failure that survived the connection-retry budget (or was
/// raised before it applied).
#[derive(Debug, Error)]
#[error("connection error: {message}")]
pub struct ConnectionError {
    pub message: String,
    /// OS-level error code name (`ECONNRESET`, ...), when one was observed.
    pub os_code: Option<String>,
    pub partial_response: Option<String>,
    #[source]
    pub cause: Option<Cause>,
}

/// The agent looped, hit its step limit, or overran the per-iteration runtime
/// budget.
#[derive(Debug, Error)]
#[error("loop error in iteration {iteration} after {retry_count} retries ({elapsed_ms} ms): {message}")]
pub struct LoopError {
    pub message: String,
    pub iteration: u32,
    pub retry_count: u32,
    pub elapsed_ms: u64,
    pub partial_response: Option<String>,
    #[source]
    pub cause: Option<Cause>,
}

/// The agent's context window or resource budget was exceeded. Never retried
/// locally; the workflow restarts with a fresh conversation instead.
#[derive(Debug, Error)]
#[error("resource exhaustion in iteration {iteration} (context {context_bytes} bytes): {message}")]
pub struct ResourceExhaustionError {
    pub message: String,
    pub context_bytes: usize,
    pub iteration: u32,
    pub elapsed_ms: u64,
    pub session_id: Option<String>,
    pub partial_response: Option<String>,
    #[source]
    pub cause: Option<Cause>,
}

/// The workflow hit resource exhaustion more often than it may restart.
#[derive(Debug, Error)]
#[error("workflow gave up after {restarts} restart(s)")]
pub struct RestartsExhausted {
    pub restarts: u32,
    #[source]
    pub cause: Cause,
}

/// Text captured before the failure, from whichever typed error carries it.
pub fn partial_response(err: &anyhow::Error) -> Option<&str> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<ConnectionError>() {
            e.partial_response.as_deref()
        } else if let Some(e) = cause.downcast_ref::<LoopError>() {
            e.partial_response.as_deref()
        } else if let Some(e) = cause.downcast_ref::<ResourceExhaustionError>() {
            e.partial_response.as_deref()
        } else {
            cause
                .downcast_ref::<AgentError>()
                .and_then(AgentError::partial_response)
        }
    })
}

/// Find the first error of type `T` anywhere in `err`'s cause chain.
pub fn find_in_chain<'a, T: StdError + 'static>(err: &'a anyhow::Error) -> Option<&'a T> {
    err.chain().find_map(|cause| cause.downcast_ref::<T>())
}
