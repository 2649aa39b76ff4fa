//! `.taskloop/` scaffolding.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use super::config::{HarnessConfig, HarnessPaths, write_config};
use super::progress_log::ProgressLog;

const HARNESS_GITIGNORE: &str = "activity/\n*.tmp\n";

/// Options for `init_harness`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite harness-owned files that already exist.
    pub force: bool,
}

/// Create `.taskloop/` in `root` with a default config, an empty progress log
/// and a `.gitignore` for the activity records.
///
/// Fails if `.taskloop/` already exists unless `options.force` is set. The
/// task collection and progress log are never overwritten.
pub fn init_harness(root: &Path, options: &InitOptions) -> Result<HarnessPaths> {
    let paths = HarnessPaths::new(root);
    if paths.dir.exists() && !paths.dir.is_dir() {
        return Err(anyhow!("taskloop init: .taskloop exists but is not a directory"));
    }
    if paths.dir.exists() && !options.force {
        return Err(anyhow!(
            "taskloop init: .taskloop already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.activity_dir)
        .with_context(|| format!("create directory {}", paths.activity_dir.display()))?;
    let gitignore = paths.dir.join(".gitignore");
    fs::write(&gitignore, HARNESS_GITIGNORE)
        .with_context(|| format!("write file {}", gitignore.display()))?;
    write_config(&paths.config, &HarnessConfig::default())?;
    ProgressLog::new(&paths.progress).ensure()?;
    Ok(paths)
}
