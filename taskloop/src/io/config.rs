//! Harness configuration stored under `.taskloop/config.toml`, plus the fixed
//! layout of the `.taskloop/` directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::ClassifierTables;
use crate::core::command::InvocationOptions;
use crate::core::retry::{ConnectionRetry, LoopRetry};
use crate::io::process::{EnvValue, ProcessSpec};

pub const HARNESS_DIR: &str = ".taskloop";

/// Well-known files under `.taskloop/`.
#[derive(Debug, Clone)]
pub struct HarnessPaths {
    pub root: PathBuf,
    pub dir: PathBuf,
    pub config: PathBuf,
    pub tasks: PathBuf,
    pub progress: PathBuf,
    pub task_prompt: PathBuf,
    pub activity_dir: PathBuf,
}

impl HarnessPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dir = root.join(HARNESS_DIR);
        Self {
            config: dir.join("config.toml"),
            tasks: dir.join("tasks.json"),
            progress: dir.join("progress.md"),
            task_prompt: dir.join("TASK.md"),
            activity_dir: dir.join("activity"),
            dir,
            root,
        }
    }

    pub fn activity_log(&self, run_id: &str) -> PathBuf {
        self.activity_dir.join(format!("{run_id}.jsonl"))
    }
}

/// Harness configuration (TOML).
///
/// Edited by humans; every table and field is optional and falls back to the
/// defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    pub agent: AgentConfig,
    pub iteration: IterationConfig,
    pub retry: RetryConfig,
    pub run: RunConfig,
    pub classifier: ClassifierTables,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub binary: String,
    /// Environment variable holding the API key passed via `--api-key`.
    pub credential_env: Option<String>,
    pub force: bool,
    pub approve_tools: bool,
    pub sandbox: Option<String>,
    pub model: Option<String>,
    pub stream_partial_output: bool,
    pub extra_args: Vec<String>,
    /// Child environment overrides; the value `"unset"` removes the variable.
    pub env: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "cursor-agent".to_string(),
            credential_env: Some("CURSOR_API_KEY".to_string()),
            force: true,
            approve_tools: true,
            sandbox: None,
            model: None,
            stream_partial_output: false,
            extra_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IterationConfig {
    pub max_iterations: u32,
    /// Wall-clock budget for one iteration, in seconds.
    pub runtime_budget_secs: u64,
    /// Accumulated output size that triggers the one-off context warning.
    pub token_warning_bytes: usize,
    pub completion_marker: String,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            runtime_budget_secs: 30 * 60,
            token_warning_bytes: 400_000,
            completion_marker: "<promise>COMPLETE</promise>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub connection_max_attempts: u32,
    pub connection_base_delay_ms: u64,
    pub backoff_multiplier: u32,
    pub loop_max_attempts: u32,
    pub loop_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            connection_max_attempts: 3,
            connection_base_delay_ms: 2_000,
            backoff_multiplier: 2,
            loop_max_attempts: 2,
            loop_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Stop voluntarily after this many tasks complete in one run.
    pub max_tasks: Option<u32>,
    /// Full-workflow restarts allowed after resource exhaustion.
    pub workflow_restarts: u32,
    pub output_snapshot_bytes: usize,
    /// minijinja template rendered with `task`.
    pub commit_message: String,
    /// Candidates for the main line a new feature branch is cut from.
    pub main_branches: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_tasks: None,
            workflow_restarts: 2,
            output_snapshot_bytes: 4_000,
            commit_message: "feat({{ task.id }}): {{ task.title }}".to_string(),
            main_branches: vec!["main".to_string(), "master".to_string()],
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.binary.trim().is_empty() {
            return Err(anyhow!("agent.binary must not be empty"));
        }
        if self.iteration.max_iterations == 0 {
            return Err(anyhow!("iteration.max_iterations must be > 0"));
        }
        if self.iteration.runtime_budget_secs == 0 {
            return Err(anyhow!("iteration.runtime_budget_secs must be > 0"));
        }
        if self.iteration.completion_marker.trim().is_empty() {
            return Err(anyhow!("iteration.completion_marker must not be empty"));
        }
        if self.retry.backoff_multiplier == 0 {
            return Err(anyhow!("retry.backoff_multiplier must be >= 1"));
        }
        if self.run.output_snapshot_bytes == 0 {
            return Err(anyhow!("run.output_snapshot_bytes must be > 0"));
        }
        if self.run.main_branches.iter().all(|b| b.trim().is_empty()) {
            return Err(anyhow!("run.main_branches must name at least one branch"));
        }
        if self.run.commit_message.trim().is_empty() {
            return Err(anyhow!("run.commit_message must not be empty"));
        }
        self.classifier.validate().map_err(|msg| anyhow!(msg))
    }

    /// Base invocation options, resolving the credential through `lookup`.
    pub fn invocation_options_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> InvocationOptions {
        InvocationOptions {
            binary: self.agent.binary.clone(),
            credential: self
                .agent
                .credential_env
                .as_deref()
                .and_then(lookup)
                .filter(|key| !key.trim().is_empty()),
            force: self.agent.force,
            approve_tools: self.agent.approve_tools,
            sandbox: self.agent.sandbox.clone(),
            extra_args: self.agent.extra_args.clone(),
        }
    }

    pub fn invocation_options(&self) -> InvocationOptions {
        self.invocation_options_with(|name| std::env::var(name).ok())
    }

    pub fn agent_env(&self) -> Vec<(String, EnvValue)> {
        ProcessSpec::env_overrides(&self.agent.env)
    }

    pub fn runtime_budget(&self) -> Duration {
        Duration::from_secs(self.iteration.runtime_budget_secs)
    }

    pub fn connection_retry(&self) -> ConnectionRetry {
        ConnectionRetry::new(
            self.retry.connection_max_attempts,
            Duration::from_millis(self.retry.connection_base_delay_ms),
            self.retry.backoff_multiplier,
        )
    }

    pub fn loop_retry(&self) -> LoopRetry {
        LoopRetry::new(
            self.retry.loop_max_attempts,
            Duration::from_millis(self.retry.loop_delay_ms),
        )
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
        assert_eq!(cfg.iteration.max_iterations, 20);
        assert_eq!(cfg.iteration.completion_marker, "<promise>COMPLETE</promise>");
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = HarnessConfig::default();
        cfg.agent.env.insert("NO_COLOR".to_string(), "1".to_string());
        cfg.run.max_tasks = Some(3);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!temp.path().join("config.toml.tmp").exists());
    }

    #[test]
    fn partial_tables_fill_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[retry]\nloop_max_attempts = 5\n\n[classifier]\nloop_phrases = [\"spinning\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.retry.loop_max_attempts, 5);
        assert_eq!(cfg.retry.connection_max_attempts, 3);
        assert_eq!(cfg.classifier.loop_phrases, vec!["spinning".to_string()]);
        assert!(!cfg.classifier.connection_codes.is_empty());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[iteration]\nmax_iterations = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_iterations"));
    }

    #[test]
    fn credential_comes_from_named_variable() {
        let cfg = HarnessConfig::default();
        let opts = cfg.invocation_options_with(|name| {
            (name == "CURSOR_API_KEY").then(|| "secret".to_string())
        });
        assert_eq!(opts.credential.as_deref(), Some("secret"));
        let none = cfg.invocation_options_with(|_| Some("  ".to_string()));
        assert_eq!(none.credential, None);
    }

    #[test]
    fn env_overrides_map_unset() {
        let mut cfg = HarnessConfig::default();
        cfg.agent.env.insert("A".to_string(), "unset".to_string());
        cfg.agent.env.insert("B".to_string(), "x".to_string());
        assert_eq!(
            cfg.agent_env(),
            vec![
                ("A".to_string(), EnvValue::Unset),
                ("B".to_string(), EnvValue::Set("x".to_string())),
            ]
        );
    }
}
