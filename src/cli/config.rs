// ABOUTME: CLI config command - print the effective merged configuration

use super::OutputFormat;
use crate::config::PoolConfig;
use anyhow::{Context, Result};

/// Execute the config command
pub fn execute(config: &PoolConfig, format: OutputFormat) -> Result<()> {
    let rendered = match format {
        OutputFormat::Text => config.to_toml()?,
        OutputFormat::Json => {
            serde_json::to_string_pretty(config).context("Failed to serialize config as JSON")?
        }
    };
    println!("{rendered}");
    Ok(())
}
