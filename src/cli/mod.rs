// ABOUTME: CLI argument parsing and command routing for ovh
//
// Provides command-line interface for:
// - Issuing pooled HTTPS requests to URLs or overlay services (request)
// - Printing the effective merged configuration (config)

pub mod config;
pub mod request;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Pooled HTTPS requests over an overlay network
#[derive(Parser)]
#[command(name = "ovh")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file layered on top of the local and user config
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log to stderr as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write JSON logs to a timestamped file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

/// Output format for commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Send one or more requests through a shared client pool
    Request(RequestArgs),

    /// Print the effective configuration
    Config,
}

/// Arguments for the request command
#[derive(clap::Args, Debug, Clone)]
pub struct RequestArgs {
    /// URL (https://host[:port]/path) or service name
    pub target: String,

    /// HTTP method
    #[arg(long, short = 'X', default_value = "GET")]
    pub method: String,

    /// Request path (defaults to the URL path, or / for services)
    #[arg(long)]
    pub path: Option<String>,

    /// Header as name:value (repeatable)
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,

    /// Request body
    #[arg(long, short = 'd')]
    pub data: Option<String>,

    /// Service endpoint as name=host:port (repeatable)
    #[arg(long = "service")]
    pub services: Vec<String>,

    /// Number of concurrent copies of the request
    #[arg(long, short = 'n', default_value = "1")]
    pub repeat: usize,

    /// Override the configured pool size
    #[arg(long)]
    pub pool_size: Option<usize>,
}
