//! Iteration controller: drives repeated agent calls for one task attempt and
//! applies the recovery policies to whatever goes wrong.
//!
//! Every iteration sends the same fixed instruction in a fresh conversation;
//! memory between iterations lives in the task file and the progress log.
//! Failures are classified and routed:
//!
//! - connection: bounded exponential backoff, counter reset on success
//! - loop: bounded fixed-delay retry with a fresh runtime budget
//! - resource exhaustion: no local retry, escalated with diagnostics
//! - cancellation: never retried
//! - anything else: returned as-is

use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::RuntimeBudget;
use crate::core::checklist::{ChecklistProgress, is_complete, scan};
use crate::core::classifier::{ErrorClass, FailureSignal, classify_error};
use crate::core::command::Resume;
use crate::core::events::{StreamEvent, ToolCallPhase};
use crate::error::{
    AgentError, ConnectionError, LoopError, ResourceExhaustionError, partial_response,
};
use crate::io::activity::{ActivityEvent, ActivitySink};
use crate::io::agent::{Agent, AgentRequest, StreamObserver, StreamResponse, TokenProgress};
use crate::io::clock::Clock;
use crate::io::config::HarnessConfig;
use crate::io::prompt::{append_token_warning, read_task_file};

/// How a task attempt ended when no error escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStop {
    /// Completion marker seen, or every checklist item checked.
    Completed,
    /// Iteration limit hit without completion.
    MaxIterationsReached,
}

/// What the controller observed, whatever the outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub iterations: u32,
    /// Assistant text accumulated across successful iterations.
    pub output: String,
    pub progress: ChecklistProgress,
    pub tool_calls: u32,
    /// Failed agent calls, retried or not.
    pub errors: u32,
    pub session_id: Option<String>,
    pub token_warning_sent: bool,
}

#[derive(Debug)]
pub struct IterationOutcome {
    pub report: IterationReport,
    pub result: Result<IterationStop>,
}

/// Inputs for one task attempt.
pub struct TaskAttempt<'a> {
    pub task_id: &'a str,
    /// Task prompt file, re-read after every iteration.
    pub task_file: &'a Path,
    /// The fixed iteration instruction.
    pub prompt: &'a str,
    pub cancel: Option<CancellationToken>,
}

pub struct IterationController<'a> {
    config: &'a HarnessConfig,
    agent: &'a dyn Agent,
    clock: &'a dyn Clock,
    sink: &'a mut dyn ActivitySink,
}

/// Forwards tool-call starts to the activity sink while a call streams.
struct SinkObserver<'s, 'a> {
    sink: &'s mut dyn ActivitySink,
    task_id: &'a str,
}

impl StreamObserver for SinkObserver<'_, '_> {
    fn on_event(&mut self, event: &StreamEvent) {
        if let StreamEvent::ToolCall(call) = event
            && call.subtype == ToolCallPhase::Started
        {
            self.sink.emit(&ActivityEvent::ToolCall {
                task_id: self.task_id.to_string(),
                kind: call.tool_call.kind().to_string(),
                label: call.tool_call.label().to_string(),
            });
        }
    }

    fn on_progress(&mut self, progress: TokenProgress) {
        debug!(
            bytes = progress.bytes,
            approx_tokens = progress.approx_tokens,
            "response progress"
        );
    }
}

impl<'a> IterationController<'a> {
    pub fn new(
        config: &'a HarnessConfig,
        agent: &'a dyn Agent,
        clock: &'a dyn Clock,
        sink: &'a mut dyn ActivitySink,
    ) -> Self {
        Self {
            config,
            agent,
            clock,
            sink,
        }
    }

    /// Run iterations until completion, the iteration limit, or an error
    /// that the recovery policies do not absorb.
    #[instrument(skip_all, fields(task = attempt.task_id))]
    pub fn run(&mut self, attempt: &TaskAttempt<'_>) -> IterationOutcome {
        let mut report = IterationReport::default();
        let result = self.drive(attempt, &mut report);
        IterationOutcome { report, result }
    }

    fn drive(
        &mut self,
        attempt: &TaskAttempt<'_>,
        report: &mut IterationReport,
    ) -> Result<IterationStop> {
        let cfg = &self.config.iteration;
        let mut budget = RuntimeBudget::start_at(self.config.runtime_budget(), self.clock.now());
        let mut connection_retry = self.config.connection_retry();
        let mut loop_retry = self.config.loop_retry();

        while report.iterations < cfg.max_iterations {
            report.iterations += 1;
            let iteration = report.iterations;
            self.sink.emit(&ActivityEvent::IterationStarted {
                task_id: attempt.task_id.to_string(),
                iteration,
            });
            budget.reset_at(self.clock.now());

            let response = loop {
                let err = match self.invoke(attempt, iteration, &budget, report) {
                    Ok(response) => {
                        connection_retry.reset();
                        break response;
                    }
                    Err(err) => err,
                };
                report.errors += 1;
                let elapsed_ms = millis(budget.elapsed_at(self.clock.now()));

                match classify_error(&err, &self.config.classifier) {
                    ErrorClass::Cancelled => {
                        info!(iteration, "agent call cancelled");
                        return Err(err);
                    }
                    ErrorClass::ResourceExhaustion => {
                        warn!(
                            iteration,
                            err = %format!("{err:#}"),
                            "resource exhaustion, escalating"
                        );
                        return Err(anyhow::Error::new(ResourceExhaustionError {
                            message: format!("{err:#}"),
                            context_bytes: report.output.len(),
                            iteration,
                            elapsed_ms,
                            session_id: session_of(&err).or_else(|| report.session_id.clone()),
                            partial_response: partial_response(&err).map(str::to_string),
                            cause: Some(err.into()),
                        }));
                    }
                    ErrorClass::Connection => match connection_retry.next_delay() {
                        Some(delay) => {
                            let attempt_no = connection_retry.attempts();
                            warn!(
                                iteration,
                                attempt = attempt_no,
                                delay_ms = millis(delay),
                                err = %format!("{err:#}"),
                                "connection error, retrying"
                            );
                            self.schedule_retry(attempt, "connection", attempt_no, delay, &err)?;
                        }
                        None => {
                            warn!(iteration, "connection retries exhausted");
                            let signal = FailureSignal::from_error(&err);
                            return Err(anyhow::Error::new(ConnectionError {
                                message: signal.message,
                                os_code: signal.os_code,
                                partial_response: partial_response(&err).map(str::to_string),
                                cause: Some(err.into()),
                            }));
                        }
                    },
                    ErrorClass::Loop => match loop_retry.next_delay() {
                        Some(delay) => {
                            let attempt_no = loop_retry.attempts();
                            warn!(
                                iteration,
                                attempt = attempt_no,
                                err = %format!("{err:#}"),
                                "loop error, retrying with a fresh budget"
                            );
                            self.schedule_retry(attempt, "loop", attempt_no, delay, &err)?;
                            budget.reset_at(self.clock.now());
                        }
                        None => {
                            warn!(iteration, "loop retries exhausted");
                            return Err(anyhow::Error::new(LoopError {
                                message: format!("{err:#}"),
                                iteration,
                                retry_count: loop_retry.attempts(),
                                elapsed_ms,
                                partial_response: partial_response(&err).map(str::to_string),
                                cause: Some(err.into()),
                            }));
                        }
                    },
                    ErrorClass::Unclassified => return Err(err),
                }
            };

            if self.absorb(attempt, iteration, response, report)? {
                info!(iteration, progress = %report.progress, "task complete");
                return Ok(IterationStop::Completed);
            }
        }

        info!(
            iterations = report.iterations,
            progress = %report.progress,
            "iteration limit reached"
        );
        Ok(IterationStop::MaxIterationsReached)
    }

    /// One agent call guarded by the runtime budget on both sides.
    fn invoke(
        &mut self,
        attempt: &TaskAttempt<'_>,
        iteration: u32,
        budget: &RuntimeBudget,
        report: &IterationReport,
    ) -> Result<StreamResponse> {
        if budget.is_exceeded_at(self.clock.now()) {
            return Err(anyhow::Error::new(LoopError {
                message: format!(
                    "runtime budget of {}s exhausted before invoking the agent",
                    budget.limit().as_secs()
                ),
                iteration,
                retry_count: 0,
                elapsed_ms: millis(budget.elapsed_at(self.clock.now())),
                partial_response: None,
                cause: None,
            }));
        }

        let request = AgentRequest {
            prompt: attempt.prompt.to_string(),
            model: self.config.agent.model.clone(),
            resume: Resume::Fresh,
            stream_partial_output: self.config.agent.stream_partial_output,
            cancel: attempt.cancel.clone(),
        };
        let mut observer = SinkObserver {
            sink: &mut *self.sink,
            task_id: attempt.task_id,
        };
        let response = self.agent.stream(&request, &mut observer)?;

        if budget.is_exceeded_at(self.clock.now()) {
            return Err(anyhow::Error::new(LoopError {
                message: format!(
                    "runtime budget of {}s exceeded during the agent call",
                    budget.limit().as_secs()
                ),
                iteration,
                retry_count: 0,
                elapsed_ms: millis(budget.elapsed_at(self.clock.now())),
                partial_response: Some(response.text),
                cause: None,
            }));
        }
        debug!(
            iteration,
            bytes = response.text.len(),
            accumulated = report.output.len(),
            remaining_ms = millis(budget.remaining_at(self.clock.now())),
            "agent call finished"
        );
        Ok(response)
    }

    fn schedule_retry(
        &mut self,
        attempt: &TaskAttempt<'_>,
        kind: &str,
        attempt_no: u32,
        delay: std::time::Duration,
        err: &anyhow::Error,
    ) -> Result<()> {
        self.sink.emit(&ActivityEvent::RetryScheduled {
            task_id: attempt.task_id.to_string(),
            kind: kind.to_string(),
            attempt: attempt_no,
            delay_ms: millis(delay),
            reason: err.to_string(),
        });
        if !self.clock.sleep(delay, attempt.cancel.as_ref()) {
            return Err(AgentError::Cancelled.into());
        }
        Ok(())
    }

    /// Fold a successful response into the report; true when the task is done.
    fn absorb(
        &mut self,
        attempt: &TaskAttempt<'_>,
        iteration: u32,
        response: StreamResponse,
        report: &mut IterationReport,
    ) -> Result<bool> {
        if !report.output.is_empty() && !report.output.ends_with('\n') {
            report.output.push('\n');
        }
        report.output.push_str(&response.text);
        report.tool_calls += response.tool_calls;
        if response.session_id.is_some() {
            report.session_id = response.session_id;
        }

        let threshold = self.config.iteration.token_warning_bytes;
        if !report.token_warning_sent && threshold > 0 && report.output.len() >= threshold {
            warn!(bytes = report.output.len(), "accumulated output crossed warning threshold");
            append_token_warning(attempt.task_file, report.output.len())?;
            self.sink.emit(&ActivityEvent::TokenWarning {
                task_id: attempt.task_id.to_string(),
                bytes: report.output.len(),
            });
            report.token_warning_sent = true;
        }

        let task_text = read_task_file(attempt.task_file)?;
        report.progress = scan([task_text.as_str(), report.output.as_str()]);
        // The marker only counts in this iteration's own reply.
        let complete = is_complete(
            &report.progress,
            &response.text,
            &self.config.iteration.completion_marker,
        );

        self.sink.emit(&ActivityEvent::IterationFinished {
            task_id: attempt.task_id.to_string(),
            iteration,
            progress: report.progress.to_string(),
            complete,
            output_bytes: report.output.len(),
        });
        if !complete && let Some(next) = &report.progress.first_unchecked {
            debug!(iteration, next = %next, "first unchecked item");
        }
        Ok(complete)
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn session_of(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| match cause.downcast_ref::<AgentError>() {
        Some(AgentError::Reported { session_id, .. }) => session_id.clone(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::find_in_chain;
    use crate::io::prompt::write_task_file;
    use crate::test_support::{
        ManualClock, RecordingSink, ScriptedAgent, ScriptedCall, fast_config, task_with_criteria,
    };
    use std::time::Duration;

    const MARKER: &str = "<promise>COMPLETE</promise>";

    struct Fixture {
        _temp: tempfile::TempDir,
        task_file: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let task_file = temp.path().join("TASK.md");
        let task = task_with_criteria("US-001", &["Add parser", "Add tests", "Update docs"]);
        write_task_file(&task_file, &task, false).expect("task file");
        Fixture {
            _temp: temp,
            task_file,
        }
    }

    fn run(
        config: &HarnessConfig,
        agent: &ScriptedAgent,
        clock: &ManualClock,
        sink: &mut RecordingSink,
        fx: &Fixture,
    ) -> IterationOutcome {
        let attempt = TaskAttempt {
            task_id: "US-001",
            task_file: &fx.task_file,
            prompt: "do the task",
            cancel: None,
        };
        IterationController::new(config, agent, clock, sink).run(&attempt)
    }

    #[test]
    fn partial_progress_is_reported_without_completion() {
        let fx = fixture();
        let mut config = fast_config();
        config.iteration.max_iterations = 1;
        let agent = ScriptedAgent::new(vec![ScriptedCall::text(
            "- [x] Add parser\n- [x] Add tests\n",
        )]);
        let clock = ManualClock::new();
        let mut sink = RecordingSink::default();
        let outcome = run(&config, &agent, &clock, &mut sink, &fx);
        assert_eq!(outcome.result.expect("result"), IterationStop::MaxIterationsReached);
        assert_eq!(outcome.report.progress.to_string(), "2/3 (67%)");
        assert_eq!(
            outcome.report.progress.first_unchecked.as_deref(),
            Some("Update docs")
        );
    }

    #[test]
    fn marker_stops_early() {
        let fx = fixture();
        let config = fast_config();
        assert_eq!(config.iteration.max_iterations, 20);
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::text("working"),
            ScriptedCall::text(&format!("all done {MARKER}")),
            ScriptedCall::text("should never run"),
        ]);
        let clock = ManualClock::new();
        let mut sink = RecordingSink::default();
        let outcome = run(&config, &agent, &clock, &mut sink, &fx);
        assert_eq!(outcome.result.expect("result"), IterationStop::Completed);
        assert_eq!(outcome.report.iterations, 2);
        assert_eq!(agent.calls(), 2);
    }

    #[test]
    fn all_items_checked_completes() {
        let fx = fixture();
        let agent = ScriptedAgent::new(vec![ScriptedCall::text(
            "- [x] Add parser\n- [x] Add tests\n- [x] Update docs",
        )]);
        let outcome = run(
            &fast_config(),
            &agent,
            &ManualClock::new(),
            &mut RecordingSink::default(),
            &fx,
        );
        assert_eq!(outcome.result.expect("result"), IterationStop::Completed);
        assert_eq!(outcome.report.iterations, 1);
    }

    #[test]
    fn connection_errors_back_off_then_escalate() {
        let fx = fixture();
        let mut config = fast_config();
        config.retry.connection_max_attempts = 2;
        config.retry.connection_base_delay_ms = 100;
        config.retry.backoff_multiplier = 3;
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::connection_error(),
            ScriptedCall::connection_error(),
            ScriptedCall::connection_error(),
        ]);
        let clock = ManualClock::new();
        let mut sink = RecordingSink::default();
        let outcome = run(&config, &agent, &clock, &mut sink, &fx);
        let err = outcome.result.expect_err("should escalate");
        assert!(find_in_chain::<ConnectionError>(&err).is_some());
        assert_eq!(agent.calls(), 3);
        assert_eq!(outcome.report.errors, 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(300)]
        );
        assert_eq!(sink.count("retry_scheduled"), 2);
    }

    #[test]
    fn overrun_budget_skips_the_agent_and_retries_as_loop() {
        let fx = fixture();
        let mut config = fast_config();
        config.iteration.runtime_budget_secs = 1;
        config.retry.connection_base_delay_ms = 2_000;
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::connection_error(),
            ScriptedCall::text(MARKER),
        ]);
        let clock = ManualClock::new();
        let mut sink = RecordingSink::default();
        let outcome = run(&config, &agent, &clock, &mut sink, &fx);

        assert_eq!(outcome.result.expect("result"), IterationStop::Completed);
        // The backoff sleep alone exhausts the budget, so the next attempt
        // fails before reaching the agent.
        assert_eq!(agent.calls(), 2);
        assert_eq!(outcome.report.errors, 2);
        let kinds: Vec<&str> = sink
            .events
            .iter()
            .filter_map(|event| match event {
                ActivityEvent::RetryScheduled { kind, .. } => Some(kind.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["connection", "loop"]);
    }

    #[test]
    fn connection_backoff_resets_after_success() {
        let fx = fixture();
        let mut config = fast_config();
        config.retry.connection_base_delay_ms = 100;
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::connection_error(),
            ScriptedCall::text("progress"),
            ScriptedCall::connection_error(),
            ScriptedCall::text(MARKER),
        ]);
        let clock = ManualClock::new();
        let outcome = run(&config, &agent, &clock, &mut RecordingSink::default(), &fx);
        assert_eq!(outcome.result.expect("result"), IterationStop::Completed);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(100)]
        );
    }

    #[test]
    fn loop_retry_gets_fresh_budget() {
        let fx = fixture();
        let mut config = fast_config();
        config.iteration.runtime_budget_secs = 10;
        config.retry.loop_max_attempts = 1;
        // First call overruns the budget; the retry would start with nothing
        // left unless the clock is reset.
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::text("slow").taking(Duration::from_secs(15)),
            ScriptedCall::text(MARKER).taking(Duration::from_secs(9)),
        ]);
        let clock = ManualClock::new();
        agent.attach_clock(&clock);
        let outcome = run(&config, &agent, &clock, &mut RecordingSink::default(), &fx);
        assert_eq!(outcome.result.expect("result"), IterationStop::Completed);
        assert_eq!(agent.calls(), 2);
    }

    #[test]
    fn loop_retries_exhaust_into_loop_error() {
        let fx = fixture();
        let mut config = fast_config();
        config.retry.loop_max_attempts = 2;
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::failure("agent hit the step limit"),
            ScriptedCall::failure("agent hit the step limit"),
            ScriptedCall::failure("agent hit the step limit"),
        ]);
        let outcome = run(&config, &agent, &ManualClock::new(), &mut RecordingSink::default(), &fx);
        let err = outcome.result.expect_err("loop error");
        let loop_err = find_in_chain::<LoopError>(&err).expect("typed loop error");
        assert_eq!(loop_err.retry_count, 2);
        assert_eq!(loop_err.iteration, 1);
        assert_eq!(agent.calls(), 3);
    }

    #[test]
    fn connection_during_loop_retry_uses_its_own_budget() {
        let fx = fixture();
        let mut config = fast_config();
        config.retry.loop_max_attempts = 1;
        config.retry.connection_max_attempts = 1;
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::failure("max turns reached"),
            ScriptedCall::connection_error(),
            ScriptedCall::text(MARKER),
        ]);
        let outcome = run(&config, &agent, &ManualClock::new(), &mut RecordingSink::default(), &fx);
        assert_eq!(outcome.result.expect("result"), IterationStop::Completed);
    }

    #[test]
    fn resource_exhaustion_is_never_retried() {
        let fx = fixture();
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::text("some output"),
            ScriptedCall::reported("context window exceeded", Some("chat-7")),
        ]);
        let outcome = run(
            &fast_config(),
            &agent,
            &ManualClock::new(),
            &mut RecordingSink::default(),
            &fx,
        );
        let err = outcome.result.expect_err("escalated");
        let exhausted = find_in_chain::<ResourceExhaustionError>(&err).expect("typed");
        assert_eq!(exhausted.iteration, 2);
        assert_eq!(exhausted.session_id.as_deref(), Some("chat-7"));
        assert_eq!(exhausted.context_bytes, "some output".len());
        assert_eq!(agent.calls(), 2);
    }

    #[test]
    fn cancellation_is_not_retried() {
        let fx = fixture();
        let agent = ScriptedAgent::new(vec![ScriptedCall::cancelled(), ScriptedCall::text(MARKER)]);
        let clock = ManualClock::new();
        let outcome = run(&fast_config(), &agent, &clock, &mut RecordingSink::default(), &fx);
        let err = outcome.result.expect_err("cancelled");
        assert!(find_in_chain::<AgentError>(&err).is_some_and(AgentError::is_cancelled));
        assert_eq!(agent.calls(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn unclassified_errors_pass_through() {
        let fx = fixture();
        let agent = ScriptedAgent::new(vec![ScriptedCall::failure("syntax error in prompt")]);
        let outcome = run(
            &fast_config(),
            &agent,
            &ManualClock::new(),
            &mut RecordingSink::default(),
            &fx,
        );
        let err = outcome.result.expect_err("error");
        assert!(find_in_chain::<LoopError>(&err).is_none());
        assert!(find_in_chain::<ConnectionError>(&err).is_none());
        assert_eq!(agent.calls(), 1);
    }

    #[test]
    fn token_warning_is_written_once() {
        let fx = fixture();
        let mut config = fast_config();
        config.iteration.token_warning_bytes = 10;
        config.iteration.max_iterations = 3;
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::text("0123456789abcdef"),
            ScriptedCall::text("more output"),
            ScriptedCall::text("even more"),
        ]);
        let mut sink = RecordingSink::default();
        let outcome = run(&config, &agent, &ManualClock::new(), &mut sink, &fx);
        assert!(outcome.report.token_warning_sent);
        assert_eq!(sink.count("token_warning"), 1);
        let body = read_task_file(&fx.task_file).expect("read");
        assert_eq!(body.matches("Context size notice").count(), 1);
        assert!(agent.prompts().iter().all(|p| p == "do the task"));
    }

    #[test]
    fn tool_calls_are_counted_and_forwarded() {
        let fx = fixture();
        let agent = ScriptedAgent::new(vec![
            ScriptedCall::text(MARKER).with_tool_calls(&["src/lib.rs", "Cargo.toml"]),
        ]);
        let mut sink = RecordingSink::default();
        let outcome = run(&fast_config(), &agent, &ManualClock::new(), &mut sink, &fx);
        assert_eq!(outcome.report.tool_calls, 2);
        assert_eq!(sink.count("tool_call"), 2);
    }
}
