//! Available subcommands.

use clap::{Args, Subcommand, ValueEnum};
use eci_client::PauseMode;

#[derive(Subcommand)]
pub enum Commands {
    /// Speak text and wait for playback to finish
    Say(SayArgs),

    /// Check that the engine library and host executable can be found
    Check,
}

#[derive(Args, Debug)]
pub struct SayArgs {
    /// Text to speak; multiple words are joined with spaces
    #[arg(required = true)]
    pub text: Vec<String>,

    /// Three-letter language code
    #[arg(short, long, default_value = "enu")]
    pub language: String,

    /// Voice variant (0-7)
    #[arg(long, default_value_t = 0)]
    pub variant: i32,

    /// Speaking rate (0-250)
    #[arg(long)]
    pub rate: Option<i32>,

    /// Pitch (0-100)
    #[arg(long)]
    pub pitch: Option<i32>,

    /// Volume (0-100)
    #[arg(long)]
    pub volume: Option<i32>,

    /// Pause appended after text without final punctuation
    #[arg(long, value_enum, default_value_t = PauseArg::Legacy)]
    pub pause_mode: PauseArg,

    /// Pass backquote annotations in the text through to the engine
    #[arg(long)]
    pub backquote_tags: bool,

    /// Enable the abbreviation dictionary
    #[arg(long)]
    pub abbreviations: bool,

    /// Enable phrase prediction
    #[arg(long)]
    pub phrase_prediction: bool,

    /// Give up waiting for playback after this many seconds
    #[arg(long, default_value_t = 60)]
    pub timeout_secs: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum PauseArg {
    Legacy,
    Shortened,
}

impl From<PauseArg> for PauseMode {
    fn from(arg: PauseArg) -> Self {
        match arg {
            PauseArg::Legacy => Self::Legacy,
            PauseArg::Shortened => Self::Shortened,
        }
    }
}
