//! Command-line interface for opportunity-forge.
//!
//! Runs the pipeline server and talks to a running one: submitting
//! candidates, listing opportunities, reading and verifying the proof log.

mod commands;

pub use commands::{load_config, parse_cli, run, run_with_cli, Cli, Commands};
