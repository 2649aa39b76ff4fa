//! Rendering of the iteration instruction, the per-task prompt file, and
//! commit messages.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::checklist::render_unchecked;
use crate::core::types::Task;
use crate::io::config::write_atomic;

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("iteration", ITERATION_TEMPLATE)
        .expect("iteration template should be valid");
    env.add_template("task", TASK_TEMPLATE)
        .expect("task template should be valid");
    env
});

/// The fixed instruction sent on every iteration of a task.
pub fn render_iteration_prompt(
    task_file: &str,
    progress_log: &str,
    completion_marker: &str,
) -> Result<String> {
    let template = ENGINE.get_template("iteration")?;
    let rendered = template.render(context! {
        task_file => task_file,
        progress_log => progress_log,
        completion_marker => completion_marker,
    })?;
    Ok(rendered)
}

/// Task prompt file body: criteria as an unchecked checklist, plus a notice
/// when an earlier attempt may have left partial work behind.
pub fn render_task_file(task: &Task, resumed: bool) -> Result<String> {
    let template = ENGINE.get_template("task")?;
    let mut rendered = template.render(context! {
        task => task,
        resumed => resumed,
        checklist => render_unchecked(&task.acceptance_criteria),
    })?;
    rendered.push('\n');
    Ok(rendered)
}

pub fn write_task_file(path: &Path, task: &Task, resumed: bool) -> Result<()> {
    debug!(path = %path.display(), task = %task.id, resumed, "writing task file");
    let body = render_task_file(task, resumed)?;
    write_atomic(path, &body)
}

/// Append the one-off context-size advisory to the task file.
pub fn append_token_warning(path: &Path, accumulated_bytes: usize) -> Result<()> {
    let note = format!(
        "\n## Context size notice\n\n\
         About {accumulated_bytes} bytes of output have accumulated on this task. \
         Rely on the progress log and this file for what has been done so far \
         instead of re-reading earlier conversation.\n"
    );
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("open task file {}", path.display()))?;
    file.write_all(note.as_bytes())
        .with_context(|| format!("append to task file {}", path.display()))
}

pub fn read_task_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read task file {}", path.display()))
}

/// Render a user-supplied commit message template against `task`.
pub fn render_commit_message(template: &str, task: &Task) -> Result<String> {
    let env = Environment::new();
    let message = env
        .render_str(template, context! { task => task })
        .context("render commit message template")?;
    Ok(message.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checklist::scan;

    fn task() -> Task {
        Task {
            description: "Let users sign in.".to_string(),
            acceptance_criteria: vec![
                "Form renders".to_string(),
                "Errors are shown".to_string(),
                "Session is stored".to_string(),
            ],
            dependencies: vec!["US-001".to_string()],
            ..Task::new("US-002", "Login form")
        }
    }

    #[test]
    fn task_file_lists_criteria_unchecked() {
        let body = render_task_file(&task(), false).expect("render");
        assert!(body.starts_with("# Task US-002: Login form"));
        assert!(body.contains("- [ ] Form renders\n"));
        assert!(body.contains("- US-001"));
        assert!(!body.contains("Resumed attempt"));
        let progress = scan([body.as_str()]);
        assert_eq!(progress.total, 3);
        assert_eq!(progress.checked, 0);
    }

    #[test]
    fn resumed_task_file_carries_notice() {
        let body = render_task_file(&task(), true).expect("render");
        assert!(body.contains("Resumed attempt"));
        assert!(body.contains("partial work"));
    }

    #[test]
    fn iteration_prompt_is_fixed_for_fixed_inputs() {
        let a = render_iteration_prompt(".taskloop/TASK.md", ".taskloop/progress.md", "<done/>")
            .expect("render");
        let b = render_iteration_prompt(".taskloop/TASK.md", ".taskloop/progress.md", "<done/>")
            .expect("render");
        assert_eq!(a, b);
        assert!(a.contains(".taskloop/TASK.md"));
        assert!(a.contains("<done/>"));
    }

    #[test]
    fn commit_message_uses_task_fields() {
        let msg = render_commit_message("feat({{ task.id }}): {{ task.title }}", &task())
            .expect("render");
        assert_eq!(msg, "feat(US-002): Login form");
    }

    #[test]
    fn bad_commit_template_is_an_error() {
        assert!(render_commit_message("{{ task.id ", &task()).is_err());
    }

    #[test]
    fn token_warning_appends_once_per_call() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("TASK.md");
        write_task_file(&path, &task(), false).expect("write");
        append_token_warning(&path, 500_000).expect("append");
        let body = read_task_file(&path).expect("read");
        assert_eq!(body.matches("Context size notice").count(), 1);
        assert!(body.contains("500000 bytes"));
    }
}
