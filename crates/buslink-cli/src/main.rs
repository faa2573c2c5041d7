//! Buslink CLI: runs a gateway from a TOML configuration.
//!
//! `buslink start` hosts the configured local services on an in-process bus
//! and bridges them to the configured peers until Ctrl+C.

mod cli;
mod cmd;
mod ui;

use crate::cli::*;
use buslink_kernel::config::{default_config_path, load_config};
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Initialise stderr logging. `RUST_LOG` wins over `default_filter`.
fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(default_config_path);

    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"), cli.json_logs);
            ui::error_with_fix(
                &format!("{e}"),
                &format!("Check {} or pass --config <path>", path.display()),
            );
            return ExitCode::FAILURE;
        }
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    init_tracing(&level, cli.json_logs);
    tracing::debug!(path = %path.display(), "Configuration loaded");

    match cli.command {
        Commands::Start => cmd::gateway::cmd_start(config),
        Commands::CheckConfig { json } => cmd::gateway::cmd_check_config(&path, &config, json),
    }
}
