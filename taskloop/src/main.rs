//! `taskloop`: drive a coding-agent CLI through a resumable task list.
//!
//! State lives in `.taskloop/` under the current directory: `config.toml`,
//! `tasks.json`, `progress.md`, the per-task prompt file and the activity
//! records of every run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use taskloop::core::command::Resume;
use taskloop::error::{AgentError, RestartsExhausted, find_in_chain};
use taskloop::exit_codes;
use taskloop::io::activity::{ConsoleSink, FanoutSink, JsonlSink};
use taskloop::io::agent::{Agent, AgentRequest, CliAgent};
use taskloop::io::clock::{SystemClock, new_run_id};
use taskloop::io::config::{HarnessConfig, HarnessPaths, load_config};
use taskloop::io::git::Git;
use taskloop::io::init::{InitOptions, init_harness};
use taskloop::io::process::check_program;
use taskloop::io::progress_log::ProgressLog;
use taskloop::io::task_store::load_collection;
use taskloop::logging;
use taskloop::task_runner::{RunContext, RunStop};
use taskloop::workflow::{prepare, run_workflow};

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Resumable task loop around a coding-agent CLI"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.taskloop/` with a default config and progress log.
    Init {
        /// Overwrite existing harness files.
        #[arg(short, long)]
        force: bool,
    },
    /// Merge a generated task list and work through the pending tasks.
    Run {
        /// Task collection JSON produced by the task generator.
        #[arg(long)]
        tasks: PathBuf,
        /// Stop after completing this many tasks.
        #[arg(long)]
        max_tasks: Option<u32>,
        /// Model passed to the agent.
        #[arg(long)]
        model: Option<String>,
    },
    /// Show the state of every task in `.taskloop/tasks.json`.
    Status,
    /// Record a reusable codebase pattern in the progress log.
    Pattern { text: String },
    /// Send a single prompt and print the agent's final answer.
    Ask {
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        /// Resume a conversation by session id.
        #[arg(long, conflicts_with = "continue_latest")]
        resume: Option<String>,
        /// Resume the most recent conversation.
        #[arg(long = "continue")]
        continue_latest: bool,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if find_in_chain::<RestartsExhausted>(err).is_some() {
        exit_codes::RESTARTS_EXHAUSTED
    } else if find_in_chain::<AgentError>(err).is_some_and(AgentError::is_cancelled) {
        exit_codes::CANCELLED
    } else {
        exit_codes::ERROR
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    let paths = HarnessPaths::new(&root);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Run {
            tasks,
            max_tasks,
            model,
        } => cmd_run(&paths, &tasks, max_tasks, model),
        Command::Status => cmd_status(&paths),
        Command::Pattern { text } => cmd_pattern(&paths, &text),
        Command::Ask {
            prompt,
            model,
            resume,
            continue_latest,
        } => {
            let resume = match (resume, continue_latest) {
                (Some(id), _) => Resume::Session(id),
                (None, true) => Resume::Latest,
                (None, false) => Resume::Fresh,
            };
            cmd_ask(&paths, prompt, model, resume)
        }
    }
}

fn cmd_init(paths: &HarnessPaths, force: bool) -> Result<i32> {
    let paths = init_harness(&paths.root, &InitOptions { force })?;
    println!("initialized {}", paths.dir.display());
    Ok(exit_codes::OK)
}

fn load_overridden(
    paths: &HarnessPaths,
    max_tasks: Option<u32>,
    model: Option<String>,
) -> Result<HarnessConfig> {
    let mut config = load_config(&paths.config)?;
    if max_tasks.is_some() {
        config.run.max_tasks = max_tasks;
    }
    if model.is_some() {
        config.agent.model = model;
    }
    config.validate()?;
    Ok(config)
}

/// Cancellation token fired by Ctrl-C.
fn interrupt_token() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || handler.cancel()).context("install Ctrl-C handler")?;
    Ok(cancel)
}

fn cmd_run(
    paths: &HarnessPaths,
    tasks: &Path,
    max_tasks: Option<u32>,
    model: Option<String>,
) -> Result<i32> {
    let config = load_overridden(paths, max_tasks, model)?;
    check_program(&config.agent.binary)?;
    let cancel = interrupt_token()?;

    let agent = CliAgent::new(config.invocation_options(), config.agent_env(), &paths.root);
    let git = Git::new(&paths.root);
    let clock = SystemClock;
    let ctx = RunContext {
        paths,
        config: &config,
        agent: &agent,
        clock: &clock,
        git: &git,
        cancel: Some(cancel),
    };

    let merged = prepare(&ctx, tasks)?;
    for warning in &merged.warnings {
        eprintln!("warning: {warning}");
    }

    let run_id = new_run_id();
    let mut sink = FanoutSink::new()
        .with(ConsoleSink::stdout())
        .with(JsonlSink::new(paths.activity_log(&run_id)));
    let summary = run_workflow(&ctx, &mut sink, &run_id)?;

    println!(
        "{}: {}/{} tasks complete",
        summary.run_id, summary.completed_total, summary.total
    );
    if !summary.failed.is_empty() {
        println!("failed this run: {}", summary.failed.join(", "));
    }
    Ok(match summary.stop {
        RunStop::Exhausted | RunStop::LimitReached { .. } => exit_codes::OK,
        RunStop::Halted { task_id } => {
            eprintln!("run halted at {task_id}: loop failure after retries");
            exit_codes::HALTED
        }
        RunStop::Cancelled => exit_codes::CANCELLED,
    })
}

fn cmd_status(paths: &HarnessPaths) -> Result<i32> {
    let collection = load_collection(&paths.tasks)?;
    println!("branch {}", collection.branch_name);
    for task in &collection.tasks {
        println!("{:<10} {:<10} {}", task.id, task.state().as_str(), task.title);
    }
    if collection.is_done() {
        println!("all {} tasks complete", collection.tasks.len());
    } else {
        println!(
            "{}/{} tasks complete",
            collection.completed_count(),
            collection.tasks.len()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_pattern(paths: &HarnessPaths, text: &str) -> Result<i32> {
    if !paths.dir.is_dir() {
        bail!("{} not found; run `taskloop init` first", paths.dir.display());
    }
    let text = text.trim();
    if text.is_empty() {
        bail!("pattern must not be empty");
    }
    ProgressLog::new(&paths.progress).add_pattern(text)?;
    println!("recorded pattern in {}", paths.progress.display());
    Ok(exit_codes::OK)
}

fn cmd_ask(
    paths: &HarnessPaths,
    prompt: String,
    model: Option<String>,
    resume: Resume,
) -> Result<i32> {
    let config = load_overridden(paths, None, model)?;
    let cancel = interrupt_token()?;
    let agent = CliAgent::new(config.invocation_options(), config.agent_env(), &paths.root);
    let request = AgentRequest {
        model: config.agent.model.clone(),
        resume,
        cancel: Some(cancel),
        ..AgentRequest::new(prompt)
    };
    let result = agent.call(&request)?;
    println!("{}", result.result);
    if let Some(session_id) = &result.session_id {
        eprintln!("session: {session_id}");
    }
    Ok(exit_codes::OK)
}
