//! Turning a caller's speech sequence into one synthesis batch.
//!
//! Text is wrapped in the engine's inline annotations (phrase prediction,
//! abbreviation dictionary, volume) and encoded to bytes here; nothing in this
//! module talks to the host.

use crate::params::VoiceParam;
use crate::synth_queue::SynthOp;

/// Index appended to every spoken batch.
pub const SENTINEL_INDEX: u32 = 0xFFFF;

/// Characters after which the engine already pauses on its own.
const PAUSING_PUNCTUATION: &[char] = &[',', '.', '?', ':', ';', ')', '(', '!'];

/// Rate parameter range mapped onto 0..=100 percent.
const MIN_RATE: i32 = 40;
const MAX_RATE: i32 = 150;

/// Measured pause-length multipliers at given rate percentages. Break
/// durations are scaled by the value interpolated from this table because
/// the engine does not honour milliseconds directly.
const BREAK_FACTORS: [(i32, f64); 5] = [(10, 1.0), (43, 2.0), (60, 3.0), (75, 4.0), (85, 5.0)];

/// A relative prosody change, applied against the base value at execution
/// time: `base * multiplier + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProsodyChange {
    pub multiplier: f64,
    pub offset: i32,
}

impl ProsodyChange {
    /// Back to the base value.
    pub const RESET: Self = Self {
        multiplier: 1.0,
        offset: 0,
    };

    pub const fn offset(offset: i32) -> Self {
        Self {
            multiplier: 1.0,
            offset,
        }
    }

    pub const fn multiplier(multiplier: f64) -> Self {
        Self {
            multiplier,
            offset: 0,
        }
    }
}

impl Default for ProsodyChange {
    fn default() -> Self {
        Self::RESET
    }
}

/// One element of a speak request.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechItem {
    Text(String),
    /// Reported through the index callback once playback reaches it.
    Index(u32),
    /// Silence of roughly this many milliseconds.
    Break { ms: u32 },
    Pitch(ProsodyChange),
    Rate(ProsodyChange),
    Volume(ProsodyChange),
    /// Switch to another engine voice/language id.
    Voice(i32),
}

impl From<&str> for SpeechItem {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for SpeechItem {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Pause appended after text that does not end in punctuation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PauseMode {
    /// `` `p0 ``: the engine's shortest pause.
    #[default]
    Legacy,
    /// `` `p1 ``.
    Shortened,
}

impl PauseMode {
    const fn tag(self) -> &'static str {
        match self {
            Self::Legacy => "`p0 ",
            Self::Shortened => "`p1 ",
        }
    }
}

/// Options that shape outgoing text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechStyle {
    pub pause_mode: PauseMode,
    /// Pass backquote annotations in caller text through to the engine.
    /// When off, every backquote becomes a space.
    pub backquote_tags: bool,
    pub abbreviation_dict: bool,
    pub phrase_prediction: bool,
}

/// Encodes outgoing text into the engine's byte encoding.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u8>;
}

/// ISO-8859-1; anything outside it becomes `?`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Latin1Encoder;

impl TextEncoder for Latin1Encoder {
    fn encode(&self, text: &str) -> Vec<u8> {
        text.chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect()
    }
}

/// Live values the plan depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext {
    pub style: SpeechStyle,
    /// Base volume, announced inline with each text run.
    pub volume: i32,
    /// Base rate as a percentage, for break scaling.
    pub rate_percent: i32,
}

/// Operations built from one speak request.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechPlan {
    pub ops: Vec<SynthOp>,
    /// Caller indexes in order of appearance.
    pub indexes: Vec<u32>,
    /// Whether any text or break made it into the plan.
    pub has_speech: bool,
}

impl SpeechPlan {
    /// Build the plan for `items`.
    ///
    /// Prosody is reset to base first. Adjacent text items are merged. A
    /// plan with speech ends with a trailing pause when the last text does
    /// not end in punctuation, then the sentinel index and `Synthesize`.
    pub fn build(items: Vec<SpeechItem>, ctx: &PlanContext, encoder: &dyn TextEncoder) -> Self {
        let mut ops: Vec<SynthOp> = [VoiceParam::Rate, VoiceParam::Pitch, VoiceParam::Volume]
            .into_iter()
            .map(|param| SynthOp::Prosody {
                param,
                multiplier: 1.0,
                offset: 0,
            })
            .collect();
        let mut indexes = Vec::new();
        let mut last_text: Option<String> = None;
        let mut has_speech = false;

        for item in combine_text(items) {
            match item {
                SpeechItem::Text(text) => {
                    let shaped = shape_text(&text, ctx);
                    ops.push(SynthOp::AddText(encoder.encode(&shaped)));
                    last_text = Some(shaped);
                    has_speech = true;
                }
                SpeechItem::Index(index) => {
                    indexes.push(index);
                    ops.push(SynthOp::InsertIndex(index));
                }
                SpeechItem::Break { ms } => {
                    let pause = scaled_break(ms, ctx.rate_percent);
                    ops.push(SynthOp::AddText(encoder.encode(&format!("`p{pause}."))));
                    has_speech = true;
                }
                SpeechItem::Pitch(change) => ops.push(prosody(VoiceParam::Pitch, change)),
                SpeechItem::Rate(change) => ops.push(prosody(VoiceParam::Rate, change)),
                SpeechItem::Volume(change) => ops.push(prosody(VoiceParam::Volume, change)),
                SpeechItem::Voice(voice) => ops.push(SynthOp::SetVoice(voice)),
            }
        }

        if has_speech {
            if let Some(text) = last_text
                && needs_trailing_pause(&text)
            {
                ops.push(SynthOp::AddText(encoder.encode(ctx.style.pause_mode.tag())));
            }
            ops.push(SynthOp::InsertIndex(SENTINEL_INDEX));
            ops.push(SynthOp::Synthesize);
        }

        Self {
            ops,
            indexes,
            has_speech,
        }
    }
}

const fn prosody(param: VoiceParam, change: ProsodyChange) -> SynthOp {
    SynthOp::Prosody {
        param,
        multiplier: change.multiplier,
        offset: change.offset,
    }
}

fn combine_text(items: Vec<SpeechItem>) -> Vec<SpeechItem> {
    let mut out: Vec<SpeechItem> = Vec::with_capacity(items.len());
    for item in items {
        match (out.last_mut(), item) {
            (Some(SpeechItem::Text(run)), SpeechItem::Text(text)) => run.push_str(&text),
            (_, item) => out.push(item),
        }
    }
    out
}

fn shape_text(text: &str, ctx: &PlanContext) -> String {
    let body = if ctx.style.backquote_tags {
        text.to_owned()
    } else {
        text.replace('`', " ")
    };
    format!(
        "`pp{} `da{} `vv{} {body}",
        u8::from(ctx.style.phrase_prediction),
        u8::from(ctx.style.abbreviation_dict),
        ctx.volume,
    )
}

fn needs_trailing_pause(text: &str) -> bool {
    text.trim_end()
        .chars()
        .next_back()
        .is_some_and(|c| !PAUSING_PUNCTUATION.contains(&c))
}

/// Rate parameter as a 0..=100 percentage.
#[allow(clippy::cast_possible_truncation)]
pub fn rate_percent(rate: i32) -> i32 {
    let percent = f64::from(rate - MIN_RATE) * 100.0 / f64::from(MAX_RATE - MIN_RATE);
    (percent.round() as i32).clamp(0, 100)
}

/// Pause multiplier for a rate percentage: linear between the measured
/// points, flat beyond either end.
///
/// A percentage that lands exactly on a measured point yields that point's
/// own factor. It does not fall back to the first factor, so the curve has
/// no dips at 43, 60, 75 or 85.
pub fn break_factor(rate_percent: i32) -> f64 {
    let (first_rate, first_factor) = BREAK_FACTORS[0];
    let (last_rate, last_factor) = BREAK_FACTORS[BREAK_FACTORS.len() - 1];
    if rate_percent <= first_rate {
        return first_factor;
    }
    if rate_percent >= last_rate {
        return last_factor;
    }
    BREAK_FACTORS
        .windows(2)
        .find(|w| rate_percent <= w[1].0)
        .map_or(last_factor, |w| {
            let ((ra, fa), (rb, fb)) = (w[0], w[1]);
            fa + (fb - fa) * f64::from(rate_percent - ra) / f64::from(rb - ra)
        })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scaled_break(ms: u32, rate_percent: i32) -> u64 {
    (break_factor(rate_percent) * f64::from(ms)) as u64
}
