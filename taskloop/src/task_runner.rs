//! Sequential loop over the pending tasks of the persisted collection.
//!
//! Every state change is written to `tasks.json` before the runner moves on,
//! so a killed run resumes at task granularity.

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::core::classifier::{ErrorClass, classify_error};
use crate::core::types::{Task, TaskCollection, TaskStats, snapshot_tail};
use crate::error::partial_response;
use crate::io::activity::{ActivityEvent, ActivitySink};
use crate::io::agent::Agent;
use crate::io::clock::{Clock, now_rfc3339};
use crate::io::config::{HarnessConfig, HarnessPaths};
use crate::io::git::Git;
use crate::io::progress_log::ProgressLog;
use crate::io::prompt::{render_commit_message, render_iteration_prompt, write_task_file};
use crate::io::task_store::{load_collection, save_collection};
use crate::iteration::{IterationController, IterationOutcome, IterationStop, TaskAttempt};

/// Collaborators shared by the runner and the workflow around it.
pub struct RunContext<'a> {
    pub paths: &'a HarnessPaths,
    pub config: &'a HarnessConfig,
    pub agent: &'a dyn Agent,
    pub clock: &'a dyn Clock,
    pub git: &'a Git,
    pub cancel: Option<CancellationToken>,
}

/// Reason why the runner stopped without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// No task was left to attempt.
    Exhausted,
    /// `max_tasks` completions reached.
    LimitReached { max_tasks: u32 },
    /// A loop failure survived its retries; later tasks may depend on it.
    Halted { task_id: String },
    Cancelled,
}

impl RunStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStop::Exhausted => "finished",
            RunStop::LimitReached { .. } => "limit_reached",
            RunStop::Halted { .. } => "halted",
            RunStop::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub stop: RunStop,
    /// Tasks completed during this run.
    pub completed: Vec<String>,
    /// Tasks whose attempt ended without completion and did not stop the run.
    pub failed: Vec<String>,
    pub completed_total: usize,
    pub total: usize,
}

/// How one task attempt ended, after persisting.
enum TaskEnd {
    Completed,
    Failed,
    Halt,
    Cancelled,
}

/// Work through the pending tasks once, in order.
///
/// Returns `Err` for resource exhaustion (after persisting the failure) and
/// for I/O or git failures; every other outcome is a [`RunStop`].
#[instrument(skip_all, fields(run_id))]
pub fn run_tasks(
    ctx: &RunContext<'_>,
    sink: &mut dyn ActivitySink,
    run_id: &str,
) -> Result<RunSummary> {
    let paths = ctx.paths;
    let mut collection = load_collection(&paths.tasks)?;
    let progress = ProgressLog::new(&paths.progress);
    progress.ensure()?;
    ctx.git
        .ensure_branch(&collection.branch_name, &ctx.config.run.main_branches)
        .with_context(|| format!("check out {}", collection.branch_name))?;

    let prompt = render_iteration_prompt(
        &relative(&paths.root, &paths.task_prompt),
        &relative(&paths.root, &paths.progress),
        &ctx.config.iteration.completion_marker,
    )?;

    let pending = collection.pending();
    info!(pending = pending.len(), branch = %collection.branch_name, "starting run");
    sink.emit(&ActivityEvent::RunStarted {
        run_id: run_id.to_string(),
        branch: collection.branch_name.clone(),
        pending: pending.len(),
    });

    let mut completed = Vec::new();
    let mut failed = Vec::new();
    let mut stop = RunStop::Exhausted;

    for idx in pending {
        if ctx.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            stop = RunStop::Cancelled;
            break;
        }
        if let Some(max_tasks) = ctx.config.run.max_tasks
            && completed.len() >= max_tasks as usize
        {
            info!(max_tasks, "task limit reached");
            stop = RunStop::LimitReached { max_tasks };
            break;
        }

        let task_id = collection.tasks[idx].id.clone();
        let end = match run_one(ctx, sink, &progress, &prompt, &mut collection, idx) {
            Ok(end) => end,
            Err(err) => {
                sink.emit(&ActivityEvent::RunFinished {
                    run_id: run_id.to_string(),
                    outcome: "error".to_string(),
                    completed: collection.completed_count(),
                    total: collection.tasks.len(),
                });
                return Err(err);
            }
        };
        match end {
            TaskEnd::Completed => completed.push(task_id),
            TaskEnd::Failed => failed.push(task_id),
            TaskEnd::Halt => {
                stop = RunStop::Halted { task_id };
                break;
            }
            TaskEnd::Cancelled => {
                stop = RunStop::Cancelled;
                break;
            }
        }
    }

    sink.emit(&ActivityEvent::RunFinished {
        run_id: run_id.to_string(),
        outcome: stop.as_str().to_string(),
        completed: collection.completed_count(),
        total: collection.tasks.len(),
    });
    Ok(RunSummary {
        run_id: run_id.to_string(),
        stop,
        completed,
        failed,
        completed_total: collection.completed_count(),
        total: collection.tasks.len(),
    })
}

#[instrument(skip_all, fields(task = %collection.tasks[idx].id))]
fn run_one(
    ctx: &RunContext<'_>,
    sink: &mut dyn ActivitySink,
    progress: &ProgressLog,
    prompt: &str,
    collection: &mut TaskCollection,
    idx: usize,
) -> Result<TaskEnd> {
    let paths = ctx.paths;
    let resumed = collection.tasks[idx].is_resumed();
    {
        let task = &mut collection.tasks[idx];
        if resumed {
            info!("resuming interrupted task");
        }
        write_task_file(&paths.task_prompt, task, resumed)?;
        let now = now_rfc3339();
        progress.begin_entry(&task.id, &task.title, &now)?;
        task.started_at = Some(now);
        task.stats = None;
        sink.emit(&ActivityEvent::TaskStarted {
            task_id: task.id.clone(),
            title: task.title.clone(),
            resumed,
        });
    }
    save_collection(&paths.tasks, collection)?;

    let started = ctx.clock.now();
    let task_id = collection.tasks[idx].id.clone();
    let attempt = TaskAttempt {
        task_id: &task_id,
        task_file: &paths.task_prompt,
        prompt,
        cancel: ctx.cancel.clone(),
    };
    let IterationOutcome { report, result } =
        IterationController::new(ctx.config, ctx.agent, ctx.clock, sink).run(&attempt);
    let duration = ctx.clock.now().saturating_duration_since(started);

    let task = &mut collection.tasks[idx];
    task.stats = Some(TaskStats {
        duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        iterations: report.iterations,
        tool_calls: report.tool_calls,
        errors: report.errors,
    });
    let mut captured = report.output.clone();
    if let Err(err) = &result
        && let Some(partial) = partial_response(err)
    {
        if !captured.is_empty() {
            captured.push('\n');
        }
        captured.push_str(partial);
    }
    if !captured.is_empty() {
        task.output = Some(snapshot_tail(&captured, ctx.config.run.output_snapshot_bytes));
    }

    let (end, outcome, note) = match &result {
        Ok(IterationStop::Completed) => {
            task.completed = true;
            task.passes = true;
            task.completed_at = Some(now_rfc3339());
            (
                TaskEnd::Completed,
                "completed",
                format!(
                    "Completed in {} iteration(s), checklist {}.",
                    report.iterations, report.progress
                ),
            )
        }
        Ok(IterationStop::MaxIterationsReached) => (
            TaskEnd::Failed,
            "max_iterations",
            format!(
                "Stopped after {} iteration(s) without completion, checklist {}.",
                report.iterations, report.progress
            ),
        ),
        Err(err) => {
            let class = classify_error(err, &ctx.config.classifier);
            let end = match class {
                ErrorClass::Cancelled => TaskEnd::Cancelled,
                ErrorClass::Loop => TaskEnd::Halt,
                // Propagated below once persisted.
                ErrorClass::ResourceExhaustion => TaskEnd::Failed,
                ErrorClass::Connection | ErrorClass::Unclassified => TaskEnd::Failed,
            };
            warn!(class = class.as_str(), err = %format!("{err:#}"), "task attempt failed");
            (end, class.as_str(), failure_note(class, err))
        }
    };
    task.notes = note.clone();
    save_collection(&paths.tasks, collection)?;

    let task = &collection.tasks[idx];
    progress.finish_entry(&task.id, &note, &now_rfc3339())?;
    if matches!(end, TaskEnd::Completed) {
        commit_task(ctx, task)?;
    }
    sink.emit(&ActivityEvent::TaskFinished {
        task_id: task.id.clone(),
        outcome: outcome.to_string(),
        duration_ms: task.stats.map(|s| s.duration_ms).unwrap_or_default(),
        iterations: report.iterations,
    });

    match result {
        Err(err)
            if classify_error(&err, &ctx.config.classifier) == ErrorClass::ResourceExhaustion =>
        {
            Err(err.context(format!("task {}", task.id)))
        }
        _ => Ok(end),
    }
}

fn failure_note(class: ErrorClass, err: &anyhow::Error) -> String {
    match class {
        ErrorClass::Cancelled => "Cancelled by operator; partial work may remain.".to_string(),
        ErrorClass::ResourceExhaustion => {
            format!("Resource exhaustion, workflow restart requested: {err:#}")
        }
        ErrorClass::Connection => format!("Connection failure after retries: {err:#}"),
        ErrorClass::Loop => format!("Loop failure after retries, run halted: {err:#}"),
        ErrorClass::Unclassified => format!("Failed: {err:#}"),
    }
}

fn commit_task(ctx: &RunContext<'_>, task: &Task) -> Result<()> {
    let message = render_commit_message(&ctx.config.run.commit_message, task)?;
    if ctx.git.commit_all(&message)? {
        let subject = ctx.git.last_commit_subject()?;
        info!(task = %task.id, subject, "committed task");
    } else {
        info!(task = %task.id, "nothing to commit");
    }
    Ok(())
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
