//! Stable exit codes for the `taskloop` binary.

/// Command succeeded (including a run that stopped at its task limit).
pub const OK: i32 = 0;
/// Invalid config/task file, git failure, or any other error.
pub const ERROR: i32 = 1;
/// A loop failure exhausted its retries and halted the run.
pub const HALTED: i32 = 2;
/// Resource exhaustion persisted through every allowed workflow restart.
pub const RESTARTS_EXHAUSTED: i32 = 3;
/// Interrupted by Ctrl-C.
pub const CANCELLED: i32 = 130;
