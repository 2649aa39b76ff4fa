//! Top-level development workflow: prepare the task store, then run the task
//! loop with a bounded number of full restarts after resource exhaustion.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::merge::MergeOutcome;
use crate::error::{RestartsExhausted, ResourceExhaustionError, find_in_chain};
use crate::io::activity::{ActivityEvent, ActivitySink};
use crate::io::clock::now_rfc3339;
use crate::io::task_store::{load_collection, merge_into_store};
use crate::task_runner::{RunContext, RunSummary, run_tasks};

/// Merge a generated task list into `.taskloop/tasks.json` and make sure a
/// repository exists to commit into.
#[instrument(skip_all, fields(tasks = %generated.display()))]
pub fn prepare(ctx: &RunContext<'_>, generated: &Path) -> Result<MergeOutcome> {
    if ctx.git.ensure_repository()? {
        info!("initialized repository");
    }
    let collection = load_collection(generated)
        .with_context(|| format!("load generated tasks {}", generated.display()))?;
    merge_into_store(&ctx.paths.tasks, collection, &now_rfc3339())
}

/// Run the task loop, restarting from the persisted state when a task hits
/// resource exhaustion. Each restart starts fresh agent conversations.
#[instrument(skip_all, fields(run_id))]
pub fn run_workflow(
    ctx: &RunContext<'_>,
    sink: &mut dyn ActivitySink,
    run_id: &str,
) -> Result<RunSummary> {
    let allowed = ctx.config.run.workflow_restarts;
    let mut restarts = 0u32;
    loop {
        let err = match run_tasks(ctx, sink, run_id) {
            Ok(summary) => return Ok(summary),
            Err(err) => err,
        };
        if find_in_chain::<ResourceExhaustionError>(&err).is_none() {
            return Err(err);
        }
        if restarts >= allowed {
            warn!(restarts, "workflow restarts exhausted");
            return Err(RestartsExhausted {
                restarts,
                cause: err.into(),
            }
            .into());
        }
        restarts += 1;
        warn!(attempt = restarts, allowed, err = %format!("{err:#}"), "restarting workflow");
        sink.emit(&ActivityEvent::WorkflowRestart {
            attempt: restarts,
            reason: err.to_string(),
        });
    }
}
