//! Command-line interface for media-forge.
//!
//! Provides the `run` command for submitting and following a generation
//! job, and the `health` command for model health reporting.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, RunArgs};
