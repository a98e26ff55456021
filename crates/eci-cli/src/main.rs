//! CLI entry point.

mod commands;
mod handlers;
mod parser;

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::commands::Commands;
use crate::parser::Cli;

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let Some(command) = &cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match command {
        Commands::Say(args) => handlers::say::execute(&cli, args),
        Commands::Check => handlers::check::execute(&cli),
    }
}
