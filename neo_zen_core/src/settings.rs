// Run settings: one JSON document configures a whole generation run.
//
// Top-level keys describe the piece (key, scale, tuning mode and anchors,
// tempo, length, chord script). Nested sections carry each component's own
// config struct (`phases`, `breath`, `tuning`, `register`, `arbiter`,
// `safety`, `humanize`, `voices`). Every field has a default and unknown keys
// are ignored, so `{}` is a valid settings file.
//
// `normalized()` turns any document into one the run can use: unparseable
// names fall back to C / major / pure_key, non-finite or non-positive numbers
// fall back to their defaults, anchors outside (0, 20 kHz) are dropped and at
// most two are kept. The arbiter and safety sections are normalized by their
// own `normalized()`. Each substitution is logged at debug level. It never
// fails; the only hard failures of a run come from the timeline itself (see
// `error.rs`).

use crate::arbiter::ArbiterConfig;
use crate::breath::BreathConfig;
use crate::humanize::HumanizeConfig;
use crate::phase::PhaseConfig;
use crate::register::RegisterConfig;
use crate::safety::SafetyConfig;
use crate::structure::tokenize;
use crate::theory::{Key, Scale, Tonality};
use crate::tuning::{TuningConfig, TuningMode};
use crate::voices::VoicesConfig;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use tracing::debug;

const DEFAULT_KEY: &str = "C";
const DEFAULT_SCALE: &str = "major";
const DEFAULT_REF_A_HZ: f64 = 440.0;
const DEFAULT_BREATH_BARS: f64 = 2.0;
const DEFAULT_TEMPO: f64 = 60.0;
const DEFAULT_DURATION_SECONDS: f64 = 300.0;
const DEFAULT_PPQ: u32 = 480;
const DEFAULT_BREATHS_PER_CHORD: u32 = 2;
const MAX_ANCHORS: usize = 2;
const MAX_ANCHOR_HZ: f64 = 20_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub key: String,
    pub scale: String,
    pub tuning_mode: String,
    /// Anchor frequencies in Hz; the first is primary.
    pub anchors: Vec<f64>,
    pub ref_a_hz: f64,
    pub breath_cycle_bars: f64,
    /// Tempo in quarter notes per minute.
    pub base_tempo: f64,
    pub total_duration_seconds: f64,
    pub ppq: u32,
    pub seed: u64,
    pub chord_script: Option<String>,
    pub breaths_per_chord: u32,
    /// Recompute the duration so the chord script plays through exactly once.
    pub auto_duration_from_chords: bool,
    pub simplify_breakdown_harmony: bool,

    pub phases: PhaseConfig,
    pub breath: BreathConfig,
    pub tuning: TuningConfig,
    pub register: RegisterConfig,
    pub arbiter: ArbiterConfig,
    pub safety: SafetyConfig,
    pub humanize: HumanizeConfig,
    pub voices: VoicesConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            key: DEFAULT_KEY.to_string(),
            scale: DEFAULT_SCALE.to_string(),
            tuning_mode: TuningMode::PureKey.name().to_string(),
            anchors: Vec::new(),
            ref_a_hz: DEFAULT_REF_A_HZ,
            breath_cycle_bars: DEFAULT_BREATH_BARS,
            base_tempo: DEFAULT_TEMPO,
            total_duration_seconds: DEFAULT_DURATION_SECONDS,
            ppq: DEFAULT_PPQ,
            seed: 42,
            chord_script: None,
            breaths_per_chord: DEFAULT_BREATHS_PER_CHORD,
            auto_duration_from_chords: false,
            simplify_breakdown_harmony: false,
            phases: PhaseConfig::default(),
            breath: BreathConfig::default(),
            tuning: TuningConfig::default(),
            register: RegisterConfig::default(),
            arbiter: ArbiterConfig::default(),
            safety: SafetyConfig::default(),
            humanize: HumanizeConfig::default(),
            voices: VoicesConfig::default(),
        }
    }
}

/// `value` if it is finite and strictly positive, else `default`.
fn positive_or(field: &'static str, value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        debug!(field, value, default, "setting out of range, using default");
        default
    }
}

/// `value` if it is finite and inside `range`, else `default`.
pub(crate) fn in_range_or(
    field: &'static str,
    value: f64,
    range: RangeInclusive<f64>,
    default: f64,
) -> f64 {
    if value.is_finite() && range.contains(&value) {
        value
    } else {
        debug!(field, value, default, "setting out of range, using default");
        default
    }
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Settings, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// A copy with every out-of-range value replaced by its default.
    pub fn normalized(&self) -> Settings {
        let mut s = self.clone();

        s.key = match Key::parse(&s.key) {
            Some(key) => key.name().to_string(),
            None => {
                debug!(key = %self.key, "unknown key, using C");
                DEFAULT_KEY.to_string()
            }
        };
        s.scale = match Scale::parse(&s.scale) {
            Some(scale) => scale.name().to_string(),
            None => {
                debug!(scale = %self.scale, "unknown scale, using major");
                DEFAULT_SCALE.to_string()
            }
        };
        s.tuning_mode = match TuningMode::parse(&s.tuning_mode) {
            Some(mode) => mode.name().to_string(),
            None => {
                debug!(tuning_mode = %self.tuning_mode, "unknown tuning mode, using pure_key");
                TuningMode::PureKey.name().to_string()
            }
        };

        let before = s.anchors.len();
        s.anchors
            .retain(|&hz| hz.is_finite() && hz > 0.0 && hz < MAX_ANCHOR_HZ);
        s.anchors.truncate(MAX_ANCHORS);
        if s.anchors.len() != before {
            debug!(before, after = s.anchors.len(), "anchors filtered");
        }

        s.ref_a_hz = positive_or("ref_a_hz", s.ref_a_hz, DEFAULT_REF_A_HZ);
        s.breath_cycle_bars =
            positive_or("breath_cycle_bars", s.breath_cycle_bars, DEFAULT_BREATH_BARS);
        s.base_tempo = positive_or("base_tempo", s.base_tempo, DEFAULT_TEMPO);
        s.total_duration_seconds = positive_or(
            "total_duration_seconds",
            s.total_duration_seconds,
            DEFAULT_DURATION_SECONDS,
        );
        if s.ppq == 0 {
            debug!("ppq of zero, using 480");
            s.ppq = DEFAULT_PPQ;
        }
        if s.breaths_per_chord == 0 {
            debug!("breaths_per_chord of zero, using 2");
            s.breaths_per_chord = DEFAULT_BREATHS_PER_CHORD;
        }
        if s.chord_script.as_deref().is_some_and(|c| c.trim().is_empty()) {
            s.chord_script = None;
        }

        let chords = match (&s.chord_script, s.auto_duration_from_chords) {
            (Some(script), true) => tokenize(script).len(),
            _ => 0,
        };
        if chords > 0 {
            let beats =
                chords as f64 * f64::from(s.breaths_per_chord) * s.breath_cycle_bars * 4.0;
            s.total_duration_seconds = beats * 60.0 / s.base_tempo;
            debug!(chords, seconds = s.total_duration_seconds, "duration from chord script");
        }

        s.arbiter = s.arbiter.normalized();
        s.safety = s.safety.normalized();
        s
    }

    pub fn tonality(&self) -> Tonality {
        Tonality::new(
            Key::parse(&self.key).unwrap_or_default(),
            Scale::parse(&self.scale).unwrap_or_default(),
        )
    }

    pub fn mode(&self) -> TuningMode {
        TuningMode::parse(&self.tuning_mode).unwrap_or(TuningMode::PureKey)
    }

    pub fn ticks_per_beat(&self) -> i64 {
        i64::from(self.ppq)
    }

    pub fn ticks_per_bar(&self) -> i64 {
        4 * i64::from(self.ppq)
    }

    /// Length of the run in ticks, rounded to the nearest tick.
    pub fn total_ticks(&self) -> i64 {
        let ticks = self.total_duration_seconds * self.base_tempo / 60.0 * f64::from(self.ppq);
        if ticks.is_finite() { ticks.round() as i64 } else { 0 }
    }
}
