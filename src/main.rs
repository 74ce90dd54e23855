//! supervisord - resource lifecycle supervisor.
//!
//! Main entry point for the supervisord CLI.

mod cli;
mod console;

use std::path::Path;

use clap::Parser;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use autohands_supervisor::SupervisorConfig;

use crate::cli::{Cli, Commands};

/// Initialize tracing.
///
/// Console output goes to stderr; stdout carries the JSON-lines console. With
/// `log_dir` set, logs are also written there with daily rotation.
fn init_tracing(log_dir: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("supervisord")
                .filename_suffix("log")
                .max_log_files(30)
                .build(log_dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Keep the writer alive for the program duration.
            static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
                std::sync::OnceLock::new();
            let _ = GUARD.set(guard);

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = SupervisorConfig::load(config.as_deref())?;
            init_tracing(config.log_dir.as_deref())?;
            info!("Starting supervisord v{}", env!("CARGO_PKG_VERSION"));
            console::run(config).await
        }
        Commands::CheckConfig { config } => {
            let config = SupervisorConfig::from_file(&config)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
