//! Client runtime for an out-of-process speech engine host.
//!
//! The engine runs in a separate host process reached over an authenticated
//! loopback connection. This crate launches and supervises that process,
//! multiplexes request/response commands with the audio event stream on the
//! one connection, plays the audio as it arrives and cancels in-flight speech
//! through a shared epoch counter.
//!
//! Most callers only need [`Synthesizer`]:
//!
//! ```no_run
//! use eci_client::{ClientConfig, EngineOptions, SpeechItem, Synthesizer};
//!
//! let synth = Synthesizer::start(
//!     ClientConfig::from_env(),
//!     &EngineOptions::new("/opt/eci/eci.so"),
//!     None,
//! )?;
//! synth.speak(vec![SpeechItem::from("Hello."), SpeechItem::Index(1)])?;
//! # Ok::<(), eci_client::ClientError>(())
//! ```

pub mod audio;
pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod epoch;
pub mod error;
pub mod host;
pub mod params;
pub mod protocol;
mod receiver;
pub mod session;
pub mod speech;
pub mod synth_queue;
pub mod synthesizer;
pub mod transport;
mod worker;

pub use client::{ClientState, EngineClient};
pub use config::{ClientConfig, HostCommand, HostSource};
pub use error::{ClientError, Result};
pub use host::{HostLink, HostProcess};
pub use params::{ENGINE_VOICE_PARAM, VoiceParam};
pub use session::{IndexCallback, IndexMark, Session};
pub use speech::{
    Latin1Encoder, PauseMode, ProsodyChange, SpeechItem, SpeechStyle, TextEncoder,
};
pub use synthesizer::{EngineOptions, Synthesizer, engine_available};
