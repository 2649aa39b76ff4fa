//! Git adapter for the feature-branch lifecycle.
//!
//! A small, explicit wrapper around `git` subprocess calls: make sure a
//! repository exists, put the working tree on the collection's branch, and
//! commit after each completed task.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn is_repository(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--is-inside-work-tree"])?;
        Ok(out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
    }

    /// Initialize a repository when the working directory is not inside one.
    #[instrument(skip_all)]
    pub fn ensure_repository(&self) -> Result<bool> {
        if self.is_repository()? {
            return Ok(false);
        }
        info!(workdir = %self.workdir.display(), "initializing git repository");
        self.run_checked(&["init"])?;
        Ok(true)
    }

    pub fn has_commits(&self) -> Result<bool> {
        Ok(self
            .run(&["rev-parse", "--verify", "--quiet", "HEAD"])?
            .status
            .success())
    }

    /// Name of the checked-out branch (works on an unborn branch too).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if !out.status.success() {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Check out `branch`, creating it from the first existing main-line
    /// candidate when it does not exist yet.
    #[instrument(skip_all, fields(branch))]
    pub fn ensure_branch(&self, branch: &str, main_candidates: &[String]) -> Result<()> {
        if self.current_branch().ok().as_deref() == Some(branch) {
            debug!(branch, "already on feature branch");
            return Ok(());
        }
        if self.branch_exists(branch)? {
            info!(branch, "checking out existing feature branch");
            self.run_checked(&["checkout", branch])?;
            return Ok(());
        }
        if !self.has_commits()? {
            info!(branch, "creating feature branch in empty repository");
            self.run_checked(&["checkout", "-b", branch])?;
            return Ok(());
        }

        let mut base = None;
        for candidate in main_candidates {
            if self.branch_exists(candidate)? {
                base = Some(candidate.as_str());
                break;
            }
        }
        match base {
            Some(base) => {
                info!(branch, base, "creating feature branch");
                self.run_checked(&["checkout", "-b", branch, base])?;
            }
            None => {
                warn!(branch, "no main branch found, branching from HEAD");
                self.run_checked(&["checkout", "-b", branch])?;
            }
        }
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Stage everything and commit; "nothing to commit" is `Ok(false)`.
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        self.commit_staged(message)
    }

    /// Subject line of the latest commit.
    pub fn last_commit_subject(&self) -> Result<String> {
        let out = self.run_checked(&["log", "-1", "--format=%s"])?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
