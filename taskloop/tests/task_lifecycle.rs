//! Run-level scenarios: several tasks driven through `run_workflow` with a
//! scripted agent, checking what ends up in `tasks.json`, the progress log,
//! the task prompt file and git.

use std::fs;

use taskloop::core::types::Task;
use taskloop::io::activity::{ActivityEvent, FanoutSink, JsonlSink};
use taskloop::io::config::HarnessConfig;
use taskloop::io::git::Git;
use taskloop::task_runner::{RunContext, RunStop, RunSummary};
use taskloop::test_support::{
    ManualClock, RecordingSink, ScriptedAgent, ScriptedCall, TestRepo, collection, fast_config,
    task_with_criteria,
};
use taskloop::workflow::run_workflow;

const MARKER: &str = "<promise>COMPLETE</promise>";

fn three_tasks() -> Vec<Task> {
    vec![
        task_with_criteria("US-001", &["Schema migrated"]),
        task_with_criteria("US-002", &["Endpoint returns 200"]),
        task_with_criteria("US-003", &["UI shows the list"]),
    ]
}

fn run(
    repo: &TestRepo,
    config: &HarnessConfig,
    agent: &ScriptedAgent,
    sink: &mut RecordingSink,
) -> RunSummary {
    let git = Git::new(repo.root());
    let clock = ManualClock::new();
    let ctx = RunContext {
        paths: &repo.paths,
        config,
        agent,
        clock: &clock,
        git: &git,
        cancel: None,
    };
    run_workflow(&ctx, sink, "run-20260101-000000").expect("workflow")
}

/// Three connection failures against a two-retry budget fail the first task;
/// the runner moves on and the next tasks complete.
#[test]
fn connection_failure_skips_to_next_task() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks(&collection("feature/api", three_tasks()))
        .expect("tasks");
    let mut config = fast_config();
    config.retry.connection_max_attempts = 2;
    let agent = ScriptedAgent::new(vec![
        ScriptedCall::connection_error(),
        ScriptedCall::connection_error(),
        ScriptedCall::connection_error(),
        ScriptedCall::text(MARKER),
        ScriptedCall::text(MARKER),
    ]);

    let mut sink = RecordingSink::default();
    let summary = run(&repo, &config, &agent, &mut sink);

    assert_eq!(summary.stop, RunStop::Exhausted);
    assert_eq!(summary.failed, vec!["US-001".to_string()]);
    assert_eq!(
        summary.completed,
        vec!["US-002".to_string(), "US-003".to_string()]
    );

    let stored = repo.read_tasks().expect("read");
    let failed = &stored.tasks[0];
    assert!(!failed.completed);
    assert!(failed.notes.starts_with("Connection failure"));
    assert_eq!(failed.stats.map(|s| s.errors), Some(3));
    // Partial text from the failed call is kept in the snapshot.
    assert!(
        failed
            .output
            .as_deref()
            .is_some_and(|out| out.contains("half a thought"))
    );
    assert_eq!(sink.count("retry_scheduled"), 2);
}

/// An exhausted loop retry halts the run; later tasks are never attempted.
#[test]
fn loop_failure_halts_the_run() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks(&collection("feature/api", three_tasks()))
        .expect("tasks");
    let mut config = fast_config();
    config.retry.loop_max_attempts = 1;
    let agent = ScriptedAgent::new(vec![
        ScriptedCall::text(MARKER),
        ScriptedCall::failure("error: agent exceeded max steps"),
        ScriptedCall::failure("error: agent exceeded max steps"),
        ScriptedCall::text(MARKER),
    ]);

    let mut sink = RecordingSink::default();
    let summary = run(&repo, &config, &agent, &mut sink);

    assert_eq!(
        summary.stop,
        RunStop::Halted {
            task_id: "US-002".to_string()
        }
    );
    assert_eq!(agent.calls(), 3);
    let stored = repo.read_tasks().expect("read");
    assert!(stored.tasks[0].completed);
    assert!(stored.tasks[1].notes.starts_with("Loop failure"));
    assert!(stored.tasks[2].started_at.is_none());
    assert!(!sink.events.iter().any(|event| matches!(
        event,
        ActivityEvent::TaskStarted { task_id, .. } if task_id == "US-003"
    )));
}

/// A killed run left US-002 started but unfinished: completed tasks are
/// skipped and US-002's prompt tells the agent about prior partial work.
#[test]
fn interrupted_task_resumes_with_notice() {
    let repo = TestRepo::new().expect("repo");
    let mut tasks = three_tasks();
    tasks[0].completed = true;
    tasks[0].passes = true;
    tasks[0].started_at = Some("2026-01-01T00:00:00Z".to_string());
    tasks[0].completed_at = Some("2026-01-01T00:10:00Z".to_string());
    tasks[1].started_at = Some("2026-01-01T00:11:00Z".to_string());
    repo.write_tasks(&collection("feature/api", tasks)).expect("tasks");

    let mut config = fast_config();
    config.run.max_tasks = Some(1);
    let agent = ScriptedAgent::new(vec![ScriptedCall::text(MARKER)]);

    let mut sink = RecordingSink::default();
    let summary = run(&repo, &config, &agent, &mut sink);
    assert_eq!(summary.completed, vec!["US-002".to_string()]);

    let started: Vec<(String, bool)> = sink
        .events
        .iter()
        .filter_map(|event| match event {
            ActivityEvent::TaskStarted {
                task_id, resumed, ..
            } => Some((task_id.clone(), *resumed)),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![("US-002".to_string(), true)]);

    let prompt = fs::read_to_string(&repo.paths.task_prompt).expect("task file");
    assert!(prompt.contains("# Task US-002"));
    assert!(prompt.contains("Prior partial work"));
}

/// Progress-log entries are opened per attempt and closed with a summary.
#[test]
fn progress_log_records_each_attempt() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks(&collection(
        "feature/api",
        vec![
            task_with_criteria("US-001", &["a", "b"]),
            task_with_criteria("US-002", &["c"]),
        ],
    ))
    .expect("tasks");
    let mut config = fast_config();
    config.iteration.max_iterations = 1;
    let agent = ScriptedAgent::new(vec![
        ScriptedCall::text("- [x] a"),
        ScriptedCall::text("- [x] c"),
    ]);

    let mut sink = RecordingSink::default();
    let summary = run(&repo, &config, &agent, &mut sink);
    assert_eq!(summary.completed, vec!["US-002".to_string()]);

    let log = fs::read_to_string(&repo.paths.progress).expect("progress");
    assert!(log.contains("## Codebase Patterns"));
    assert!(log.contains("Task US-001"));
    assert!(log.contains("without completion, checklist 1/2 (50%)"));
    assert!(log.contains("Completed in 1 iteration(s), checklist 1/1 (100%)"));
    assert!(!log.contains("_in progress_"));
}

/// Every run gets a durable JSONL record next to the console output.
#[test]
fn activity_record_is_written() {
    let repo = TestRepo::new().expect("repo");
    repo.write_tasks(&collection(
        "feature/api",
        vec![task_with_criteria("US-001", &["a"])],
    ))
    .expect("tasks");
    let config = fast_config();
    let agent = ScriptedAgent::new(vec![
        ScriptedCall::text(MARKER).with_tool_calls(&["src/main.rs"]),
    ]);
    let git = Git::new(repo.root());
    let clock = ManualClock::new();
    let ctx = RunContext {
        paths: &repo.paths,
        config: &config,
        agent: &agent,
        clock: &clock,
        git: &git,
        cancel: None,
    };
    let record = repo.paths.activity_log("run-1");
    let mut sink = FanoutSink::new().with(JsonlSink::new(&record));
    run_workflow(&ctx, &mut sink, "run-1").expect("workflow");

    let lines: Vec<serde_json::Value> = fs::read_to_string(&record)
        .expect("record")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json"))
        .collect();
    let kinds: Vec<&str> = lines
        .iter()
        .filter_map(|line| line["type"].as_str())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "run_started",
            "task_started",
            "iteration_started",
            "tool_call",
            "iteration_finished",
            "task_finished",
            "run_finished",
        ]
    );
    assert_eq!(lines[3]["label"], "src/main.rs");
}
