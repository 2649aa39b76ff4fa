//! Resumable harness that drives an external coding-agent CLI through a list
//! of tasks.
//!
//! - **[`core`]**: pure logic (command building, stream protocol, error
//!   classification, checklist progress, retry policies, task model).
//! - **[`io`]**: side effects (agent processes, config, task store, git,
//!   progress log, activity sinks).
//!
//! Orchestration lives at the crate root: [`iteration`] drives one task
//! attempt, [`task_runner`] walks the task list, and [`workflow`] restarts the
//! whole loop after resource exhaustion.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod task_runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
