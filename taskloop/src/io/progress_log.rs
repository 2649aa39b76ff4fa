//! Append-mostly progress notes shared between iterations and tasks.
//!
//! Layout: a `## Codebase Patterns` section up front, closed by a `---` line,
//! followed by `## <timestamp> - Task <id>` entries. An entry opened with
//! [`ProgressLog::begin_entry`] carries a placeholder line that
//! [`ProgressLog::finish_entry`] later replaces in place.

use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::io::config::write_atomic;

pub const PATTERNS_HEADER: &str = "## Codebase Patterns";
const SEPARATOR: &str = "---";
const IN_PROGRESS: &str = "_in progress_";

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^## (?P<ts>.+?) - Task (?P<id>\S+)[ \t]*$").expect("entry header regex")
});

fn template() -> String {
    format!("# Progress Log\n\n{PATTERNS_HEADER}\n\n{SEPARATOR}\n")
}

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("read progress log {}", self.path.display()))
    }

    fn write(&self, contents: &str) -> Result<()> {
        write_atomic(&self.path, contents)
    }

    /// Create the log, or add a missing patterns section to an existing one.
    pub fn ensure(&self) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "creating progress log");
            return self.write(&template());
        }
        let contents = self.read()?;
        if contents.contains(PATTERNS_HEADER) {
            return Ok(());
        }
        self.write(&format!("{}\n{contents}", template()))
    }

    /// Append an entry for `task_id` with an in-progress placeholder.
    pub fn begin_entry(&self, task_id: &str, title: &str, at: &str) -> Result<()> {
        self.ensure()?;
        let mut contents = self.read()?;
        push_block(
            &mut contents,
            &format!("## {at} - Task {task_id}\n{title}\n\n{IN_PROGRESS}\n"),
        );
        self.write(&contents)
    }

    /// Replace the latest placeholder for `task_id` with `summary`, or append
    /// a fresh entry when there is none.
    pub fn finish_entry(&self, task_id: &str, summary: &str, at: &str) -> Result<()> {
        self.ensure()?;
        let mut contents = self.read()?;
        match open_entry_span(&contents, task_id) {
            Some((start, end)) => {
                contents.replace_range(start..end, summary.trim_end());
            }
            None => push_block(
                &mut contents,
                &format!("## {at} - Task {task_id}\n{}\n", summary.trim_end()),
            ),
        }
        self.write(&contents)
    }

    /// Add a bullet to the end of the patterns section.
    pub fn add_pattern(&self, text: &str) -> Result<()> {
        self.ensure()?;
        let contents = self.read()?;
        let Some(header) = contents.find(PATTERNS_HEADER) else {
            return Ok(());
        };
        let body_start = header + PATTERNS_HEADER.len();
        let body_end = contents[body_start..]
            .find(&format!("\n{SEPARATOR}\n"))
            .map(|offset| body_start + offset + 1)
            .unwrap_or(contents.len());

        let mut bullets: Vec<&str> = contents[body_start..body_end]
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        let bullet = format!("- {}", text.trim());
        bullets.push(&bullet);

        let mut updated = String::with_capacity(contents.len() + bullet.len() + 2);
        updated.push_str(&contents[..body_start]);
        updated.push_str("\n\n");
        updated.push_str(&bullets.join("\n"));
        updated.push_str("\n\n");
        updated.push_str(&contents[body_end..]);
        self.write(&updated)
    }
}

fn push_block(contents: &mut String, block: &str) {
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push('\n');
    contents.push_str(block);
}

/// Byte span of the placeholder line inside the latest entry for `task_id`.
fn open_entry_span(contents: &str, task_id: &str) -> Option<(usize, usize)> {
    let headers: Vec<_> = ENTRY_RE.captures_iter(contents).collect();
    let (idx, caps) = headers
        .iter()
        .enumerate()
        .rev()
        .find(|(_, caps)| &caps["id"] == task_id)?;
    let body_start = caps.get(0)?.end();
    let body_end = headers
        .get(idx + 1)
        .and_then(|next| next.get(0))
        .map(|m| m.start())
        .unwrap_or(contents.len());
    let offset = contents[body_start..body_end].find(IN_PROGRESS)?;
    let start = body_start + offset;
    Some((start, start + IN_PROGRESS.len()))
}
