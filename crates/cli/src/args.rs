//! Command-line arguments

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::{list::ListArgs, run::RunArgs, validate::ValidateArgs};
use crate::output::OutputFormat;

/// uiflow - scenario-driven browser automation tests
#[derive(Parser, Debug)]
#[command(name = "uiflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "uiflow.toml", env = "UIFLOW_CONFIG", global = true)]
    pub config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    pub format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run scenarios against a browser
    Run(RunArgs),

    /// Parse and check scenarios without running them
    Validate(ValidateArgs),

    /// List discovered scenarios
    List(ListArgs),
}
