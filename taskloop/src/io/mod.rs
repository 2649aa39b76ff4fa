//! Side-effecting adapters: processes, files, git, and activity output.

pub mod activity;
pub mod agent;
pub mod clock;
pub mod config;
pub mod git;
pub mod init;
pub mod process;
pub mod progress_log;
pub mod prompt;
pub mod task_store;
