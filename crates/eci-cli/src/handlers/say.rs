//! Say command handler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::RecvTimeoutError;
use eci_client::{
    EngineOptions, IndexCallback, IndexMark, SpeechItem, SpeechStyle, Synthesizer, VoiceParam,
};
use tracing::debug;

use crate::commands::SayArgs;
use crate::handlers::{client_config, engine_path};
use crate::parser::Cli;

/// Speak the text and block until playback finishes or the timeout passes.
pub fn execute(cli: &Cli, args: &SayArgs) -> Result<()> {
    let mut options = EngineOptions::new(engine_path(cli)?);
    options.language.clone_from(&args.language);
    options.voice_variant = args.variant;
    options.style = SpeechStyle {
        pause_mode: args.pause_mode.into(),
        backquote_tags: args.backquote_tags,
        abbreviation_dict: args.abbreviations,
        phrase_prediction: args.phrase_prediction,
    };

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let on_index: IndexCallback = Arc::new(move |mark: IndexMark| {
        debug!(?mark, "Index reached");
        if mark == IndexMark::Done {
            let _ = done_tx.try_send(());
        }
    });

    let synth = Synthesizer::start(client_config(cli), &options, Some(on_index))
        .context("failed to start the engine host")?;

    for (param, value) in [
        (VoiceParam::Rate, args.rate),
        (VoiceParam::Pitch, args.pitch),
        (VoiceParam::Volume, args.volume),
    ] {
        if let Some(value) = value {
            synth.set_voice_param(param, value);
        }
    }

    synth.speak(vec![SpeechItem::Text(args.text.join(" "))])?;

    let outcome = done_rx.recv_timeout(Duration::from_secs(args.timeout_secs));
    synth.terminate();
    match outcome {
        Ok(()) => Ok(()),
        Err(RecvTimeoutError::Timeout) => {
            bail!("playback did not finish within {}s", args.timeout_secs)
        }
        Err(RecvTimeoutError::Disconnected) => bail!("engine host went away"),
    }
}
