//! Task collection data model, as persisted in `tasks.json`.

use serde::{Deserialize, Serialize};

/// Execution statistics for one task attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub duration_ms: u64,
    pub iterations: u32,
    pub tool_calls: u32,
    pub errors: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub suggested_role: Option<String>,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub stats: Option<TaskStats>,
}

/// Where a task stands, derived from its persisted fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    /// Started, never finished: the process died mid-attempt.
    Interrupted,
    /// An attempt finished without completing the task.
    Failed,
    Done,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Interrupted => "resumable",
            TaskState::Failed => "failed",
            TaskState::Done => "done",
        }
    }
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            priority: 0,
            dependencies: Vec::new(),
            suggested_role: None,
            passes: false,
            notes: String::new(),
            completed: false,
            started_at: None,
            completed_at: None,
            output: None,
            stats: None,
        }
    }

    /// A previous attempt started and did not complete; partial work may exist.
    pub fn is_resumed(&self) -> bool {
        self.started_at.is_some() && !self.completed
    }

    pub fn state(&self) -> TaskState {
        if self.completed {
            TaskState::Done
        } else if self.started_at.is_none() {
            TaskState::Pending
        } else if self.stats.is_some() {
            TaskState::Failed
        } else {
            TaskState::Interrupted
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCollection {
    #[serde(default)]
    pub created_at: String,
    #[serde(rename = "branchName")]
    pub branch_name: String,
    #[serde(rename = "userStories")]
    pub tasks: Vec<Task>,
}

impl TaskCollection {
    pub fn completed_count(&self) -> usize {
        self.tasks.iter().filter(|task| task.completed).count()
    }

    /// Indices of the tasks that still need work, in order.
    pub fn pending(&self) -> Vec<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| !task.completed)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn is_done(&self) -> bool {
        self.tasks.iter().all(|task| task.completed)
    }
}

/// Last `max_bytes` of `text`, cut on a char boundary.
pub fn snapshot_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
