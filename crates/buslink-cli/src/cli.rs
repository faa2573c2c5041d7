//! Clap CLI definitions for Buslink.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  buslink check-config                      Validate ~/.buslink/gateway.toml
  buslink start                             Run the gateway in the foreground
  buslink --config edge.toml start          Run with another config file
  buslink --json-logs start                 Emit logs as JSON lines";

/// Buslink: bridges two message-bus domains over TCP.
#[derive(Parser, Debug)]
#[command(
    name = "buslink",
    version,
    about = "Buslink message-bus gateway",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Path to config file (default: ~/.buslink/gateway.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set (overrides the config's log_level).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway and run until Ctrl+C.
    Start,
    /// Load and validate the config, print a summary, and exit.
    CheckConfig {
        /// Print the merged config as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start_with_global_flags() {
        let cli = Cli::parse_from(["buslink", "start", "--config", "edge.toml", "--json-logs"]);
        assert!(matches!(cli.command, Commands::Start));
        assert_eq!(cli.config, Some(PathBuf::from("edge.toml")));
        assert!(cli.json_logs);
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn test_parse_check_config() {
        let cli = Cli::parse_from(["buslink", "--log-level", "debug", "check-config", "--json"]);
        assert!(matches!(cli.command, Commands::CheckConfig { json: true }));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
