//! Command handlers.

pub mod check;
pub mod say;

use std::path::PathBuf;

use anyhow::{Context, Result};
use eci_client::ClientConfig;

use crate::parser::Cli;

/// Client configuration from the environment, with CLI overrides applied.
pub fn client_config(cli: &Cli) -> ClientConfig {
    let mut config = ClientConfig::from_env();
    if let Some(command) = &cli.host_command {
        config.host_command = Some(command.clone());
    }
    config
}

/// The engine library path, which must be given one way or another.
pub fn engine_path(cli: &Cli) -> Result<PathBuf> {
    cli.engine
        .clone()
        .context("no engine library given (use --engine or ECI_ENGINE_PATH)")
}
