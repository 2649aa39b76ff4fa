//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod budget;
pub mod checklist;
pub mod classifier;
pub mod command;
pub mod events;
pub mod merge;
pub mod retry;
pub mod types;
