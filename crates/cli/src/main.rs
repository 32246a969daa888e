//! uiflow CLI - Main Entry Point

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use uiflow_cli::args::{Cli, Commands};
use uiflow_cli::commands::{self, EXIT_RUNNER_ERROR};
use uiflow_cli::output::print_error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    let result = match cli.command {
        Commands::Run(args) => commands::run::execute(args, &cli.config, cli.format).await,
        Commands::Validate(args) => commands::validate::execute(args, &cli.config, cli.format).await,
        Commands::List(args) => commands::list::execute(args, &cli.config, cli.format).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::from(EXIT_RUNNER_ERROR)
        }
    }
}
