//! Vigil CLI
//!
//! Policy linter with an incremental language server.

mod cli;
mod commands;
mod output;
mod utils;

use std::process::ExitCode;

use clap::Parser;
use miette::Result;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, RulesCommands};
use crate::utils::load_config;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(has_errors) => {
            if has_errors {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("{:?}", e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Lint { paths, format } => {
            let config = load_config(cli.config.as_ref())?;
            commands::run_lint(&config, &paths, format)
        }
        Commands::Init { force } => {
            commands::run_init(force)?;
            Ok(false)
        }
        Commands::Rules { command } => match command {
            RulesCommands::List => {
                let config = load_config(cli.config.as_ref())?;
                commands::run_rules_list(&config)?;
                Ok(false)
            }
        },
        Commands::Lsp {
            hot_reload_rules,
            ticker_interval,
        } => {
            commands::run_lsp(cli.config, hot_reload_rules, ticker_interval)?;
            Ok(false)
        }
    }
}
