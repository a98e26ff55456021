//! Root CLI structure with global options.

use std::path::PathBuf;

use clap::Parser;

use crate::commands::Commands;

/// Speak text through an out-of-process speech engine host.
#[derive(Parser)]
#[command(name = "eci")]
#[command(about = "Speak through an out-of-process speech engine")]
#[command(version)]
pub struct Cli {
    /// Engine library the host should load
    #[arg(long, env = "ECI_ENGINE_PATH", global = true)]
    pub engine: Option<PathBuf>,

    /// Override the host command line (same as ECI_HOST_COMMAND)
    #[arg(long = "host-command", global = true)]
    pub host_command: Option<String>,

    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}
