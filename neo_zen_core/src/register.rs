// Register guard: per-voice pitch bands.
//
// Each canonical voice owns a band of MIDI notes it may sound in, with a
// generic band for anything else. At construction every default band moves
// by the tuning plan's register shift (limited to ±12 semitones), then
// per-voice overrides from configuration replace the shifted band outright.
// Override keys go through the voice alias table, and an override written
// with min above max is swapped rather than discarded.
//
// `clamp` is total: any integer pitch comes back inside the voice's band.

use crate::voice::Voice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Largest register shift applied to the default bands, in semitones.
pub const MAX_REGISTER_SHIFT: i32 = 12;

/// An inclusive MIDI pitch range with `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBand {
    pub min: i32,
    pub max: i32,
}

impl RegisterBand {
    /// Build a band, swapping the ends if they arrive reversed.
    pub fn new(a: i32, b: i32) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    pub fn shifted(self, semitones: i32) -> Self {
        Self {
            min: self.min + semitones,
            max: self.max + semitones,
        }
    }

    pub fn clamp(self, pitch: i32) -> i32 {
        pitch.clamp(self.min, self.max)
    }

    pub fn contains(self, pitch: i32) -> bool {
        (self.min..=self.max).contains(&pitch)
    }
}

/// Band a voice uses before shift and overrides.
pub fn default_band(voice: Voice) -> RegisterBand {
    let (min, max) = match voice {
        Voice::Drone => (36, 52),
        Voice::Bass => (36, 60),
        Voice::Harmony => (48, 76),
        Voice::Melody => (60, 96),
        Voice::Chime => (65, 100),
        Voice::Air => (60, 100),
        Voice::Handpan => (60, 88),
        Voice::Pulse => (48, 76),
        Voice::Nature => (48, 88),
        Voice::Vocal => (48, 80),
        Voice::Binaural => (24, 48),
        Voice::Generic => (36, 96),
    };
    RegisterBand { min, max }
}

/// Per-voice override as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandOverride {
    pub min: i32,
    pub max: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    /// Overrides keyed by voice name (aliases allowed).
    pub overrides: BTreeMap<String, BandOverride>,
}

#[derive(Debug, Clone)]
pub struct RegisterGuard {
    bands: [RegisterBand; Voice::COUNT],
    shift: i32,
}

impl Default for RegisterGuard {
    fn default() -> Self {
        Self::new(0, &RegisterConfig::default())
    }
}

impl RegisterGuard {
    pub fn new(register_shift: i32, config: &RegisterConfig) -> Self {
        let shift = register_shift.clamp(-MAX_REGISTER_SHIFT, MAX_REGISTER_SHIFT);
        if shift != register_shift {
            debug!(register_shift, shift, "register shift clamped");
        }

        let mut bands = [default_band(Voice::Generic).shifted(shift); Voice::COUNT];
        for voice in Voice::CANONICAL {
            bands[voice.index()] = default_band(voice).shifted(shift);
        }
        for (name, o) in &config.overrides {
            let voice = Voice::from_name(name);
            let band = RegisterBand::new(o.min.clamp(0, 127), o.max.clamp(0, 127));
            debug!(%name, %voice, min = band.min, max = band.max, "register override");
            bands[voice.index()] = band;
        }

        Self { bands, shift }
    }

    /// The register shift actually applied to the defaults.
    pub fn shift(&self) -> i32 {
        self.shift
    }

    pub fn band(&self, voice: Voice) -> RegisterBand {
        self.bands[voice.index()]
    }

    /// Band for a free-form voice name.
    pub fn band_named(&self, name: &str) -> RegisterBand {
        self.band(Voice::from_name(name))
    }

    pub fn clamp(&self, voice: Voice, pitch: i32) -> i32 {
        self.band(voice).clamp(pitch)
    }
}
