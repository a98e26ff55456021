//! Message shapes exchanged with the engine host.
//!
//! Every frame on the wire is one JSON document tagged by `type`:
//!
//! ```text
//! {"type":"command",  "id":7, "command":"addText", "payload":{...}}
//! {"type":"response", "id":7, "payload":{...}}      or  {"type":"response","id":7,"error":"..."}
//! {"type":"event",    "event":"audio", "payload":{"data":"<base64>","index":3,"final":false}}
//! ```
//!
//! The `challenge` / `answer` / `welcome` variants only appear during the
//! connection handshake (see [`crate::auth`]). Byte fields travel as base64.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, Result};

/// Free-form command/response/event arguments.
pub type Payload = serde_json::Map<String, Value>;

/// Command names understood by the engine host.
pub mod commands {
    pub const INITIALIZE: &str = "initialize";
    pub const ADD_TEXT: &str = "addText";
    pub const INSERT_INDEX: &str = "insertIndex";
    pub const SYNTHESIZE: &str = "synthesize";
    pub const STOP: &str = "stop";
    pub const SET_PARAM: &str = "setParam";
    pub const SET_VOICE_PARAM: &str = "setVoiceParam";
    pub const COPY_VOICE: &str = "copyVoice";
    pub const DELETE: &str = "delete";
}

/// Event names pushed by the engine host.
pub mod events {
    pub const AUDIO: &str = "audio";
    pub const STOPPED: &str = "stopped";
}

/// One frame's worth of protocol traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Client → host request.
    Command {
        id: u64,
        command: String,
        #[serde(default)]
        payload: Payload,
    },

    /// Host → client reply correlated by `id`.
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Host → client push notification.
    Event {
        event: String,
        #[serde(default)]
        payload: Payload,
    },

    /// Handshake: client → host nonce.
    Challenge { nonce: String },

    /// Handshake: host → client keyed digest of the nonce.
    Answer { digest: String },

    /// Handshake: client accepted the answer.
    Welcome,

    /// Any `type` this build does not know about.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Build a command frame.
    pub fn command(id: u64, command: impl Into<String>, payload: Payload) -> Self {
        Self::Command {
            id,
            command: command.into(),
            payload,
        }
    }

    /// Build a successful response frame.
    pub const fn reply(id: u64, payload: Payload) -> Self {
        Self::Response {
            id,
            payload: Some(payload),
            error: None,
        }
    }

    /// Build an error response frame.
    pub fn reply_error(id: u64, error: impl Into<String>) -> Self {
        Self::Response {
            id,
            payload: None,
            error: Some(error.into()),
        }
    }

    /// Build an event frame.
    pub fn event(event: impl Into<String>, payload: Payload) -> Self {
        Self::Event {
            event: event.into(),
            payload,
        }
    }

    /// Short label for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Response { .. } => "response",
            Self::Event { .. } => "event",
            Self::Challenge { .. } => "challenge",
            Self::Answer { .. } => "answer",
            Self::Welcome => "welcome",
            Self::Unknown => "unknown",
        }
    }
}

// ── Typed payloads ─────────────────────────────────────────────────

/// Arguments of `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArgs {
    /// Path of the engine library the host should load.
    #[serde(rename = "eciPath")]
    pub engine_path: String,
    /// Directory holding voice data and dictionaries.
    pub data_directory: String,
    /// Three-letter language/voice code, e.g. `enu`.
    pub language: String,
    pub enable_abbreviation_dict: bool,
    pub enable_phrase_prediction: bool,
    pub voice_variant: i32,
}

/// Arguments of `addText`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTextArgs {
    #[serde(with = "base64_bytes")]
    pub text: Vec<u8>,
}

/// Arguments of `insertIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertIndexArgs {
    pub value: u32,
}

/// Arguments of `setParam`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetParamArgs {
    pub param_id: u32,
    pub value: i32,
}

/// Arguments of `setVoiceParam`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVoiceParamArgs {
    pub param_id: u32,
    pub value: i32,
    #[serde(default)]
    pub temporary: bool,
}

/// Arguments of `copyVoice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyVoiceArgs {
    pub variant: i32,
}

/// Parameter tables carried by `initialize`, `setParam`, `setVoiceParam`
/// and `copyVoice` replies. Either table may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsReply {
    #[serde(default)]
    pub params: BTreeMap<u32, i32>,
    #[serde(default, rename = "voiceParams")]
    pub voice_params: BTreeMap<u32, i32>,
}

/// Payload of the `audio` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioEvent {
    /// PCM bytes; empty for index-only / end-of-utterance markers.
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

/// Serialize a typed argument struct into a [`Payload`].
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(ClientError::Protocol(format!(
            "payload must be an object, got {other}"
        ))),
    }
}

/// Decode a [`Payload`] into a typed struct.
pub fn from_payload<T: DeserializeOwned>(payload: Payload) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(payload))?)
}

/// `serde(with)` adapter storing bytes as standard base64 text.
pub mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
