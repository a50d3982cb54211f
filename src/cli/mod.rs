//! Command-line interface for fujifill.
//!
//! Provides commands for running the scoring pipeline, managing the job
//! queue, and exporting scored records.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
