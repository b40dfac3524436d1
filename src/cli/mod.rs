//! Command-line interface for mlp-forge.
//!
//! Provides the `run` and `validate` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
