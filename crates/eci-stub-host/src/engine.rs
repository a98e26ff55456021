//! Synthetic engine: parameter tables, staged text and a tone generator.
//!
//! Each spoken character becomes a slice of sine tone whose pitch follows
//! the pitch parameter, loudness the volume parameter and length the rate
//! parameter. Inline backquote annotations are not spoken.

use std::collections::BTreeMap;
use std::f64::consts::TAU;

use eci_client::audio::SAMPLE_RATE;
use eci_client::protocol::{
    AddTextArgs, AudioEvent, CopyVoiceArgs, InitializeArgs, InsertIndexArgs, ParamsReply, Payload,
    SetParamArgs, SetVoiceParamArgs, commands, from_payload, to_payload,
};
use eci_client::{ENGINE_VOICE_PARAM, VoiceParam};
use tracing::{debug, info};

/// Language codes and their voice ids.
const LANGUAGES: &[(&str, i32)] = &[
    ("enu", 65_536),
    ("eng", 65_537),
    ("esp", 131_072),
    ("esm", 131_073),
    ("fra", 196_608),
    ("frc", 196_609),
    ("deu", 262_144),
    ("ita", 327_680),
    ("chs", 393_216),
    ("ptb", 458_752),
    ("jpn", 524_288),
    ("fin", 589_824),
    ("kor", 655_360),
];

/// Voice presets selectable with `copyVoice`, as
/// `[head size, pitch, inflection, roughness, breathiness, rate, volume]`.
const VARIANTS: [[i32; 7]; 8] = [
    [50, 65, 30, 0, 0, 50, 92],
    [50, 81, 30, 0, 50, 50, 95],
    [22, 93, 35, 0, 0, 50, 95],
    [86, 56, 47, 0, 0, 50, 93],
    [50, 69, 34, 0, 0, 70, 92],
    [56, 89, 35, 0, 40, 70, 95],
    [45, 68, 30, 3, 0, 50, 90],
    [30, 61, 44, 18, 0, 50, 90],
];

/// Milliseconds per spoken character at rate 50.
const MS_PER_CHAR_AT_BASE_RATE: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Index(u32),
}

/// Audio for one `synthesize`, in playback order.
#[derive(Debug, Default)]
pub struct Utterance {
    pub frames: Vec<AudioEvent>,
}

impl Utterance {
    /// Total PCM bytes across all frames.
    pub fn pcm_len(&self) -> usize {
        self.frames.iter().map(|f| f.data.len()).sum()
    }
}

/// What the server should do with a command.
#[derive(Debug)]
pub enum Outcome {
    Reply(Payload),
    Failed(String),
    /// Reply, then stream the utterance.
    Speak(Utterance),
    /// Fire-and-forget: abandon audio in flight.
    Stop,
    /// Reply, then end the session.
    Exit,
}

pub struct StubEngine {
    params: BTreeMap<u32, i32>,
    voice_params: BTreeMap<u32, i32>,
    staged: Vec<Segment>,
    chunk_ms: u32,
}

impl StubEngine {
    pub fn new(chunk_ms: u32) -> Self {
        Self {
            params: BTreeMap::new(),
            voice_params: preset(0),
            staged: Vec::new(),
            chunk_ms: chunk_ms.max(1),
        }
    }

    pub fn handle(&mut self, command: &str, payload: Payload) -> Outcome {
        let result = match command {
            commands::INITIALIZE => from_payload(payload).map(|args| self.initialize(&args)),
            commands::ADD_TEXT => from_payload(payload).map(|args: AddTextArgs| {
                self.staged.push(Segment::Text(decode_text(&args.text)));
                Outcome::Reply(Payload::new())
            }),
            commands::INSERT_INDEX => from_payload(payload).map(|args: InsertIndexArgs| {
                self.staged.push(Segment::Index(args.value));
                Outcome::Reply(Payload::new())
            }),
            commands::SYNTHESIZE => Ok(Outcome::Speak(self.synthesize())),
            commands::STOP => {
                self.staged.clear();
                Ok(Outcome::Stop)
            }
            commands::SET_PARAM => from_payload(payload).map(|args: SetParamArgs| {
                self.params.insert(args.param_id, args.value);
                self.tables_reply()
            }),
            commands::SET_VOICE_PARAM => from_payload(payload).map(|args| self.set_voice_param(&args)),
            commands::COPY_VOICE => from_payload(payload).map(|args: CopyVoiceArgs| {
                match usize::try_from(args.variant).ok().filter(|v| *v < VARIANTS.len()) {
                    Some(variant) => {
                        self.voice_params = preset(variant);
                        self.tables_reply()
                    }
                    None => Outcome::Failed(format!("unknown variant {}", args.variant)),
                }
            }),
            commands::DELETE => Ok(Outcome::Exit),
            other => Ok(Outcome::Failed(format!("unknown command {other}"))),
        };
        result.unwrap_or_else(|e| Outcome::Failed(e.to_string()))
    }

    fn initialize(&mut self, args: &InitializeArgs) -> Outcome {
        let Some(voice) = voice_for(&args.language) else {
            return Outcome::Failed(format!("unsupported language {}", args.language));
        };
        let variant = usize::try_from(args.voice_variant)
            .ok()
            .filter(|v| *v < VARIANTS.len())
            .unwrap_or(0);
        info!(
            engine = %args.engine_path,
            language = %args.language,
            variant,
            "Stub engine initialized"
        );
        self.params.insert(ENGINE_VOICE_PARAM, voice);
        self.voice_params = preset(variant);
        self.staged.clear();
        self.tables_reply()
    }

    fn set_voice_param(&mut self, args: &SetVoiceParamArgs) -> Outcome {
        let Some(param) = VoiceParam::from_id(args.param_id) else {
            return Outcome::Failed(format!("unknown voice parameter {}", args.param_id));
        };
        // Like the real engine, a temporary value is still the live value.
        self.voice_params.insert(args.param_id, param.clamp(args.value));
        self.tables_reply()
    }

    fn tables_reply(&self) -> Outcome {
        let reply = ParamsReply {
            params: self.params.clone(),
            voice_params: self.voice_params.clone(),
        };
        match to_payload(&reply) {
            Ok(payload) => Outcome::Reply(payload),
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    fn voice(&self, param: VoiceParam) -> i32 {
        self.voice_params.get(&param.id()).copied().unwrap_or(0)
    }

    /// Render everything staged since the last `synthesize`.
    pub fn synthesize(&mut self) -> Utterance {
        let mut tone = Tone::new(
            self.voice(VoiceParam::Pitch),
            self.voice(VoiceParam::Volume),
        );
        let ms_per_char = ms_per_char(self.voice(VoiceParam::Rate));
        let chunk_bytes = pcm_bytes(self.chunk_ms);
        let mut frames = Vec::new();

        for segment in self.staged.drain(..) {
            match segment {
                Segment::Index(index) => frames.push(AudioEvent {
                    data: Vec::new(),
                    index: Some(index),
                    is_final: false,
                }),
                Segment::Text(text) => {
                    let spoken = u32::try_from(spoken_chars(&text)).unwrap_or(u32::MAX);
                    let pcm = tone.render(spoken.saturating_mul(ms_per_char));
                    frames.extend(pcm.chunks(chunk_bytes).map(|chunk| AudioEvent {
                        data: chunk.to_vec(),
                        index: None,
                        is_final: false,
                    }));
                }
            }
        }
        frames.push(AudioEvent {
            data: Vec::new(),
            index: None,
            is_final: true,
        });
        debug!(frames = frames.len(), "Utterance rendered");
        Utterance { frames }
    }
}

fn preset(variant: usize) -> BTreeMap<u32, i32> {
    VoiceParam::ALL
        .iter()
        .zip(VARIANTS[variant])
        .map(|(param, value)| (param.id(), value))
        .collect()
}

fn voice_for(language: &str) -> Option<i32> {
    LANGUAGES
        .iter()
        .find(|(code, _)| code.eq_ignore_ascii_case(language))
        .map(|(_, voice)| *voice)
}

/// Text arrives in a single-byte encoding.
fn decode_text(bytes: &[u8]) -> String {
    bytes.iter().map(|b| char::from(*b)).collect()
}

/// Characters that would be voiced: whitespace and `` `tag `` annotations
/// are not.
fn spoken_chars(text: &str) -> usize {
    let mut count = 0;
    let mut in_tag = false;
    for c in text.chars() {
        if c == '`' {
            in_tag = true;
        } else if c.is_whitespace() {
            in_tag = false;
        } else if !in_tag {
            count += 1;
        }
    }
    count
}

fn ms_per_char(rate: i32) -> u32 {
    let rate = u32::try_from(rate.max(1)).unwrap_or(1);
    (MS_PER_CHAR_AT_BASE_RATE * 50 / rate).max(5)
}

fn pcm_bytes(ms: u32) -> usize {
    let samples = u64::from(SAMPLE_RATE) * u64::from(ms) / 1000;
    usize::try_from(samples * 2).unwrap_or(usize::MAX).max(2)
}

/// Phase-continuous sine generator.
struct Tone {
    frequency: f64,
    amplitude: f64,
    phase: f64,
}

impl Tone {
    fn new(pitch: i32, volume: i32) -> Self {
        Self {
            frequency: 80.0 + 2.0 * f64::from(pitch.clamp(0, 100)),
            amplitude: f64::from(i16::MAX) * 0.25 * f64::from(volume.clamp(0, 100)) / 100.0,
            phase: 0.0,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn render(&mut self, ms: u32) -> Vec<u8> {
        let samples = u64::from(SAMPLE_RATE) * u64::from(ms) / 1000;
        let step = TAU * self.frequency / f64::from(SAMPLE_RATE);
        let mut pcm = Vec::with_capacity(usize::try_from(samples * 2).unwrap_or(0));
        for _ in 0..samples {
            let sample = (self.phase.sin() * self.amplitude) as i16;
            pcm.extend_from_slice(&sample.to_le_bytes());
            self.phase = (self.phase + step) % TAU;
        }
        pcm
    }
}
