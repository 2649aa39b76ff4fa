//! Task collection load/save with schema validation.
//!
//! The whole collection is rewritten (temp file + rename) after every
//! mutation, so a crash loses at most the in-flight task's state.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::merge::{MergeOutcome, merge_collections};
use crate::core::types::TaskCollection;
use crate::io::config::write_atomic;

const SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/task_collection.schema.json"
));

static VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(SCHEMA).map_err(|err| err.to_string())?;
    jsonschema::validator_for(&schema).map_err(|err| err.to_string())
});

fn validate_schema(value: &Value) -> Result<()> {
    let validator = VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid task collection schema: {err}"))?;
    if !validator.is_valid(value) {
        let messages = validator
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "task collection schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn validate_invariants(collection: &TaskCollection) -> Result<()> {
    let mut seen = BTreeSet::new();
    for task in &collection.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(anyhow!("duplicate task id {}", task.id));
        }
    }
    Ok(())
}

/// Parse and validate a task collection document.
pub fn parse_collection(contents: &str, origin: &Path) -> Result<TaskCollection> {
    let value: Value = serde_json::from_str(contents)
        .with_context(|| format!("parse task collection {}", origin.display()))?;
    validate_schema(&value).with_context(|| format!("validate {}", origin.display()))?;
    let collection: TaskCollection = serde_json::from_value(value)
        .with_context(|| format!("deserialize task collection {}", origin.display()))?;
    validate_invariants(&collection).with_context(|| format!("validate {}", origin.display()))?;
    Ok(collection)
}

/// Load and validate a collection from disk.
pub fn load_collection(path: &Path) -> Result<TaskCollection> {
    debug!(path = %path.display(), "loading task collection");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read task collection {}", path.display()))?;
    parse_collection(&contents, path)
}

/// Load the persisted collection if one exists.
pub fn load_existing(path: &Path) -> Result<Option<TaskCollection>> {
    if !path.exists() {
        return Ok(None);
    }
    load_collection(path).map(Some)
}

/// Atomically persist the whole collection.
pub fn save_collection(path: &Path, collection: &TaskCollection) -> Result<()> {
    debug!(
        path = %path.display(),
        completed = collection.completed_count(),
        total = collection.tasks.len(),
        "writing task collection"
    );
    let mut buf = serde_json::to_string_pretty(collection).context("serialize task collection")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Merge a freshly generated list into the persisted one and save the result.
///
/// `now` fills `created_at` when neither side has one.
pub fn merge_into_store(
    store: &Path,
    generated: TaskCollection,
    now: &str,
) -> Result<MergeOutcome> {
    let existing = load_existing(store)?;
    let mut outcome = merge_collections(existing.as_ref(), generated);
    if outcome.collection.created_at.is_empty() {
        outcome.collection.created_at = now.to_string();
    }
    for warning in &outcome.warnings {
        warn!(%warning, "task list merge");
    }
    save_collection(store, &outcome.collection)?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Task;

    fn collection() -> TaskCollection {
        TaskCollection {
            created_at: "2026-01-01T00:00:00Z".to_string(),
            branch_name: "feature/x".to_string(),
            tasks: vec![Task::new("US-001", "a"), Task::new("US-002", "b")],
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".taskloop/tasks.json");
        save_collection(&path, &collection()).expect("save");
        assert_eq!(load_collection(&path).expect("load"), collection());
        assert!(!temp.path().join(".taskloop/tasks.json.tmp").exists());
    }

    #[test]
    fn schema_rejects_missing_branch() {
        let err = parse_collection(r#"{"userStories": []}"#, Path::new("x.json")).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let raw = r#"{"branchName":"b","userStories":[{"id":"US-1","title":"t","completed":"yes"}]}"#;
        assert!(parse_collection(raw, Path::new("x.json")).is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let raw = r#"{"branchName":"b","userStories":[{"id":"US-1","title":"a"},{"id":"US-1","title":"b"}]}"#;
        let err = parse_collection(raw, Path::new("x.json")).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate task id"));
    }

    #[test]
    fn minimal_generated_list_parses_with_defaults() {
        let raw = r#"{"branchName":"b","userStories":[{"id":"US-1","title":"a","acceptanceCriteria":["x"]}]}"#;
        let parsed = parse_collection(raw, Path::new("x.json")).expect("parse");
        assert!(parsed.created_at.is_empty());
        assert!(!parsed.tasks[0].completed);
    }

    #[test]
    fn merge_into_store_keeps_progress_and_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        let mut existing = collection();
        existing.tasks[0].completed = true;
        existing.tasks[0].passes = true;
        save_collection(&path, &existing).expect("save");

        let mut generated = collection();
        generated.created_at = String::new();
        generated.tasks.push(Task::new("US-003", "c"));
        let outcome = merge_into_store(&path, generated, "later").expect("merge");
        assert_eq!(outcome.warnings.len(), 1);

        let stored = load_collection(&path).expect("load");
        assert!(stored.tasks[0].completed);
        assert_eq!(stored.tasks.len(), 3);
        assert_eq!(stored.created_at, "2026-01-01T00:00:00Z");
    }

    #[test]
    fn merge_into_empty_store_stamps_creation_time() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        let mut generated = collection();
        generated.created_at = String::new();
        let outcome = merge_into_store(&path, generated, "now").expect("merge");
        assert_eq!(outcome.collection.created_at, "now");
        assert!(path.exists());
    }
}
