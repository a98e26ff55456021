//! Engine and voice parameter identifiers plus their local mirrors.

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Engine parameter holding the active voice/language id.
pub const ENGINE_VOICE_PARAM: u32 = 9;

/// Voice parameters addressable through `setVoiceParam`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoiceParam {
    HeadSize,
    Pitch,
    Inflection,
    Roughness,
    Breathiness,
    Rate,
    Volume,
}

impl VoiceParam {
    pub const ALL: [Self; 7] = [
        Self::HeadSize,
        Self::Pitch,
        Self::Inflection,
        Self::Roughness,
        Self::Breathiness,
        Self::Rate,
        Self::Volume,
    ];

    /// Wire id.
    pub const fn id(self) -> u32 {
        match self {
            Self::HeadSize => 1,
            Self::Pitch => 2,
            Self::Inflection => 3,
            Self::Roughness => 4,
            Self::Breathiness => 5,
            Self::Rate => 6,
            Self::Volume => 7,
        }
    }

    pub const fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            1 => Self::HeadSize,
            2 => Self::Pitch,
            3 => Self::Inflection,
            4 => Self::Roughness,
            5 => Self::Breathiness,
            6 => Self::Rate,
            7 => Self::Volume,
            _ => return None,
        })
    }

    /// Highest value the engine accepts.
    pub const fn ceiling(self) -> i32 {
        match self {
            Self::Rate => 250,
            _ => 100,
        }
    }

    /// Clamp to `[0, ceiling]`.
    pub fn clamp(self, value: i32) -> i32 {
        value.clamp(0, self.ceiling())
    }

    /// `base * multiplier + offset`, truncated toward zero and clamped.
    #[allow(clippy::cast_possible_truncation)]
    pub fn scaled(self, base: i32, multiplier: f64, offset: i32) -> i32 {
        let raw = (f64::from(base) * multiplier).trunc() as i32;
        self.clamp(raw.saturating_add(offset))
    }
}

/// Thread-safe `id -> value` mirror of an engine parameter table.
#[derive(Debug, Default)]
pub struct ParamTable {
    values: RwLock<BTreeMap<u32, i32>>,
}

impl ParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known value; unknown ids read as 0.
    pub fn get(&self, id: u32) -> i32 {
        self.values.read().get(&id).copied().unwrap_or(0)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.values.read().contains_key(&id)
    }

    pub fn set(&self, id: u32, value: i32) {
        self.values.write().insert(id, value);
    }

    /// Overlay every entry of `values`.
    pub fn merge(&self, values: &BTreeMap<u32, i32>) {
        if values.is_empty() {
            return;
        }
        self.values
            .write()
            .extend(values.iter().map(|(k, v)| (*k, *v)));
    }

    pub fn snapshot(&self) -> BTreeMap<u32, i32> {
        self.values.read().clone()
    }
}
