// ABOUTME: Main entry point for the ovh command-line client
//
// Binary: ovh
// Usage: ovh [--config FILE] [--log-json] [--log-dir DIR] <COMMAND>
// - request: send pooled HTTPS requests to a URL or overlay service
// - config: print the effective configuration

#![allow(missing_docs)]

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;

use overlay_https::cli::{self, Commands};
use overlay_https::config::PoolConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    setup_logging(args.log_json, args.log_dir.as_deref())?;
    setup_panic_handler();

    let config = PoolConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Commands::Request(request_args) => {
            cli::request::execute(request_args, config, args.format).await
        }
        Commands::Config => cli::config::execute(&config, args.format),
    }
}

fn setup_logging(json: bool, log_dir: Option<&Path>) -> Result<()> {
    use std::fs::OpenOptions;
    use std::sync::Mutex;
    use tracing_subscriber::prelude::*;

    // JSONL log file with timestamp, only when asked for
    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let log_file = dir.join(format!(
                "ovh-{}.jsonl",
                chrono::Local::now().format("%Y%m%d-%H%M%S")
            ));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .with_context(|| format!("Failed to create log file {}", log_file.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let stderr_json = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
    });
    let stderr_text = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overlay_https=info".into()),
        )
        .with(file_layer)
        .with(stderr_json)
        .with(stderr_text)
        .init();
    Ok(())
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
    }));
}
