//! CLI definitions for supervisord.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// supervisord CLI.
#[derive(Parser)]
#[command(name = "supervisord")]
#[command(about = "Resource lifecycle supervisor with tiered recovery")]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the supervisor with a JSON-lines console on stdin/stdout
    Run {
        /// Configuration file path (defaults apply when omitted)
        #[arg(short, long, env = "SUPERVISORD_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Load and validate a configuration file, then print the effective values
    CheckConfig {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_without_config() {
        let cli = Cli::try_parse_from(["supervisord", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { config: None }));
    }

    #[test]
    fn test_parse_check_config() {
        let cli =
            Cli::try_parse_from(["supervisord", "check-config", "--config", "sup.toml"]).unwrap();
        match cli.command {
            Commands::CheckConfig { config } => assert_eq!(config, PathBuf::from("sup.toml")),
            _ => panic!("Wrong subcommand"),
        }
    }

    #[test]
    fn test_check_config_requires_path() {
        assert!(Cli::try_parse_from(["supervisord", "check-config"]).is_err());
    }
}
