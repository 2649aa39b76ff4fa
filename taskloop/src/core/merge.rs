//! Merge a freshly generated task list into the persisted one.

use super::types::{Task, TaskCollection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub collection: TaskCollection,
    pub warnings: Vec<String>,
}

/// Merge `generated` into `existing`.
///
/// Definitions (title, description, criteria, ordering) come from
/// `generated`; progress fields are carried over for every id present in both.
/// Ids seen for the first time start fresh, whatever progress the generated
/// file claims. The branch name and creation time of an existing collection
/// never change.
pub fn merge_collections(
    existing: Option<&TaskCollection>,
    generated: TaskCollection,
) -> MergeOutcome {
    let Some(existing) = existing else {
        return MergeOutcome {
            collection: TaskCollection {
                tasks: generated.tasks.into_iter().map(fresh).collect(),
                ..generated
            },
            warnings: Vec::new(),
        };
    };

    let mut warnings = Vec::new();
    if existing.tasks.len() != generated.tasks.len() {
        warnings.push(format!(
            "task count changed from {} to {}",
            existing.tasks.len(),
            generated.tasks.len()
        ));
    }
    if !generated.branch_name.is_empty() && generated.branch_name != existing.branch_name {
        warnings.push(format!(
            "ignoring branch {:?}; collection is bound to {:?}",
            generated.branch_name, existing.branch_name
        ));
    }

    let tasks = generated
        .tasks
        .into_iter()
        .map(|task| match existing.get(&task.id) {
            Some(previous) => carry_progress(task, previous),
            None => fresh(task),
        })
        .collect();

    MergeOutcome {
        collection: TaskCollection {
            created_at: existing.created_at.clone(),
            branch_name: existing.branch_name.clone(),
            tasks,
        },
        warnings,
    }
}

fn fresh(mut task: Task) -> Task {
    task.completed = false;
    task.passes = false;
    task.started_at = None;
    task.completed_at = None;
    task.notes.clear();
    task.output = None;
    task.stats = None;
    task
}

fn carry_progress(mut task: Task, previous: &Task) -> Task {
    task.completed = previous.completed;
    task.passes = previous.passes;
    task.started_at = previous.started_at.clone();
    task.completed_at = previous.completed_at.clone();
    task.notes = previous.notes.clone();
    task.output = previous.output.clone();
    task.stats = previous.stats;
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStats;

    fn collection(branch: &str, tasks: Vec<Task>) -> TaskCollection {
        TaskCollection {
            created_at: "2026-01-01T00:00:00Z".to_string(),
            branch_name: branch.to_string(),
            tasks,
        }
    }

    fn finished(id: &str) -> Task {
        Task {
            completed: true,
            passes: true,
            started_at: Some("s".to_string()),
            completed_at: Some("c".to_string()),
            notes: "went fine".to_string(),
            output: Some("out".to_string()),
            stats: Some(TaskStats {
                duration_ms: 10,
                iterations: 2,
                tool_calls: 3,
                errors: 0,
            }),
            ..Task::new(id, "old title")
        }
    }

    #[test]
    fn without_existing_the_generated_list_is_used() {
        let generated = collection("feature/x", vec![Task::new("US-001", "a")]);
        let outcome = merge_collections(None, generated.clone());
        assert_eq!(outcome.collection, generated);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn preserves_progress_for_matching_ids() {
        let existing = collection("feature/x", vec![finished("US-001"), Task::new("US-002", "b")]);
        let generated = collection(
            "feature/x",
            vec![Task::new("US-001", "new title"), Task::new("US-002", "b")],
        );
        let outcome = merge_collections(Some(&existing), generated);
        let merged = &outcome.collection.tasks[0];
        let previous = &existing.tasks[0];
        assert_eq!(merged.title, "new title");
        assert_eq!(merged.completed, previous.completed);
        assert_eq!(merged.passes, previous.passes);
        assert_eq!(merged.started_at, previous.started_at);
        assert_eq!(merged.completed_at, previous.completed_at);
        assert_eq!(merged.output, previous.output);
        assert_eq!(merged.stats, previous.stats);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn count_change_warns_and_new_tasks_start_fresh() {
        let existing = collection("feature/x", vec![finished("US-001")]);
        // Stale progress in the regenerated file must not leak into a new id.
        let generated = collection(
            "feature/x",
            vec![Task::new("US-001", "a"), finished("US-002")],
        );
        let outcome = merge_collections(Some(&existing), generated);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("1 to 2"));
        assert!(outcome.collection.tasks[0].completed);
        let added = &outcome.collection.tasks[1];
        assert_eq!(added.title, "old title");
        assert!(!added.completed);
        assert!(!added.passes);
        assert!(added.started_at.is_none());
        assert!(added.completed_at.is_none());
        assert!(added.notes.is_empty());
        assert!(added.output.is_none());
        assert!(added.stats.is_none());
    }

    #[test]
    fn first_import_drops_claimed_progress() {
        let generated = collection("feature/x", vec![finished("US-001")]);
        let outcome = merge_collections(None, generated);
        let task = &outcome.collection.tasks[0];
        assert_eq!(task.state(), crate::core::types::TaskState::Pending);
        assert!(!task.passes);
        assert!(task.output.is_none());
    }

    #[test]
    fn branch_name_is_immutable() {
        let existing = collection("feature/x", vec![Task::new("US-001", "a")]);
        let generated = collection("feature/y", vec![Task::new("US-001", "a")]);
        let outcome = merge_collections(Some(&existing), generated);
        assert_eq!(outcome.collection.branch_name, "feature/x");
        assert_eq!(outcome.collection.created_at, existing.created_at);
        assert_eq!(outcome.warnings.len(), 1);
    }
}
