// Tuning planner: resolves key, scale and anchor frequencies into a plan.
//
// Four modes decide how external anchor frequencies (e.g. 396 Hz, 528 Hz)
// relate to the equal-tempered key the piece is composed in:
//
// - `pure_key`: anchors are ignored. The drone sits on the tonic.
// - `solf_root`: one anchor becomes the primary drone note.
// - `solf_dual`: two anchors, each becoming a drone note.
// - `key_plus_solf_drone`: the key drives everything; the anchor only adds a
//   secondary drone note.
//
// An anchor maps to the nearest MIDI note (69 + 12·log2(f / A4)), folded by
// octaves into [36, 72]. The planned ratio is the anchor over that note's
// equal-tempered frequency. A global pitch shift derived from it is opt-in
// (`enable_global_shift`, off by default), comes from the primary anchor only
// and is clamped to `max_global_shift` semitones.
//
// Unknown key, scale or mode strings fall back to C, major and pure_key.

use crate::theory::{Key, Scale, Tonality};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lowest note an anchor may fold to (C2).
pub const ANCHOR_FOLD_LOW: u8 = 36;
/// Highest note an anchor may fold to (C5).
pub const ANCHOR_FOLD_HIGH: u8 = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningMode {
    #[default]
    PureKey,
    SolfRoot,
    SolfDual,
    KeyPlusSolfDrone,
}

impl TuningMode {
    pub fn parse(name: &str) -> Option<TuningMode> {
        let norm = name.trim().to_ascii_lowercase().replace('-', "_");
        Some(match norm.as_str() {
            "pure" | "key" | "pure_key" => TuningMode::PureKey,
            "solf" | "solf_root" | "follow_solf" => TuningMode::SolfRoot,
            "solf_dual" | "dual_solf" => TuningMode::SolfDual,
            "key_plus_solf_drone" | "key+solf_drone" | "key_solf_drone" => {
                TuningMode::KeyPlusSolfDrone
            }
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            TuningMode::PureKey => "pure_key",
            TuningMode::SolfRoot => "solf_root",
            TuningMode::SolfDual => "solf_dual",
            TuningMode::KeyPlusSolfDrone => "key_plus_solf_drone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub enable_global_shift: bool,
    /// Clamp for the rounded global shift, in semitones.
    pub max_global_shift: i32,
    /// Register shift passed on to the register guard. `None` means 0.
    pub register_shift_override: Option<i32>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enable_global_shift: false,
            max_global_shift: 6,
            register_shift_override: None,
        }
    }
}

/// Resolved tuning for one run. Read-only after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningPlan {
    pub mode: TuningMode,
    pub tonality: Tonality,
    pub ref_a_hz: f64,
    /// Accepted anchors, at most two, all positive.
    pub anchors: Vec<f64>,
    /// Drone notes in priority order.
    pub drone_anchor_notes: Vec<u8>,
    pub planned_ratio: f64,
    pub planned_semitone_shift: f64,
    pub register_shift: i32,
    pub max_global_shift: i32,
}

impl TuningPlan {
    /// Integer shift for exporters: the planned shift rounded and clamped.
    pub fn global_shift(&self) -> i32 {
        let max = self.max_global_shift.clamp(0, 24);
        (self.planned_semitone_shift.round() as i32).clamp(-max, max)
    }

    pub fn primary_drone_note(&self) -> u8 {
        self.drone_anchor_notes
            .first()
            .copied()
            .unwrap_or(ANCHOR_FOLD_LOW + self.tonality.key.pc)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TuningPlanner {
    config: TuningConfig,
}

impl TuningPlanner {
    pub fn new(config: &TuningConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Build a plan. Never fails; bad inputs resolve to documented defaults.
    pub fn plan(
        &self,
        key: &str,
        scale: &str,
        mode: &str,
        anchors: &[f64],
        ref_a_hz: f64,
    ) -> TuningPlan {
        let key = Key::parse(key).unwrap_or_else(|| {
            debug!(key, "unknown key, using C");
            Key::C
        });
        let scale = Scale::parse(scale).unwrap_or_else(|| {
            debug!(scale, "unknown scale, using major");
            Scale::Major
        });
        let mode = TuningMode::parse(mode).unwrap_or_else(|| {
            debug!(mode, "unknown tuning mode, using pure_key");
            TuningMode::PureKey
        });
        let ref_a_hz = if ref_a_hz.is_finite() && ref_a_hz > 0.0 {
            ref_a_hz
        } else {
            440.0
        };
        let anchors: Vec<f64> = anchors
            .iter()
            .copied()
            .filter(|f| f.is_finite() && *f > 0.0)
            .take(2)
            .collect();

        let tonic_drone = ANCHOR_FOLD_LOW + key.pc;
        let fold = |f: f64| fold_note(nearest_midi(f, ref_a_hz));

        let (anchors, drone_anchor_notes) = match (mode, anchors.as_slice()) {
            (TuningMode::PureKey, _) | (_, []) => (Vec::new(), vec![tonic_drone]),
            (TuningMode::SolfRoot, [a, ..]) => (vec![*a], vec![fold(*a)]),
            (TuningMode::SolfDual, [a]) => (vec![*a], vec![fold(*a)]),
            (TuningMode::SolfDual, [a, b, ..]) => (vec![*a, *b], vec![fold(*a), fold(*b)]),
            (TuningMode::KeyPlusSolfDrone, [a, ..]) => (vec![*a], vec![tonic_drone, fold(*a)]),
        };

        let (mut planned_ratio, mut planned_semitone_shift) = (1.0, 0.0);
        let shifting_mode = matches!(mode, TuningMode::SolfRoot | TuningMode::SolfDual);
        if shifting_mode && self.config.enable_global_shift {
            if let (Some(&f), Some(&note)) = (anchors.first(), drone_anchor_notes.first()) {
                planned_ratio = f / midi_to_hz(note, ref_a_hz);
                planned_semitone_shift = 12.0 * planned_ratio.log2();
            }
        }

        let plan = TuningPlan {
            mode,
            tonality: Tonality::new(key, scale),
            ref_a_hz,
            anchors,
            drone_anchor_notes,
            planned_ratio,
            planned_semitone_shift,
            register_shift: self.config.register_shift_override.unwrap_or(0),
            max_global_shift: self.config.max_global_shift,
        };
        debug!(
            mode = plan.mode.name(),
            key = key.name(),
            scale = scale.name(),
            drones = ?plan.drone_anchor_notes,
            shift = plan.planned_semitone_shift,
            "tuning plan"
        );
        plan
    }
}

/// Equal-tempered frequency of a MIDI note.
pub fn midi_to_hz(note: u8, ref_a_hz: f64) -> f64 {
    ref_a_hz * 2f64.powf((note as f64 - 69.0) / 12.0)
}

/// Nearest MIDI note to `freq_hz`, clamped to 0..=127.
pub fn nearest_midi(freq_hz: f64, ref_a_hz: f64) -> u8 {
    if freq_hz.is_nan() || freq_hz <= 0.0 || ref_a_hz.is_nan() || ref_a_hz <= 0.0 {
        return 69;
    }
    let n = 69.0 + 12.0 * (freq_hz / ref_a_hz).log2();
    n.round().clamp(0.0, 127.0) as u8
}

/// Move a note by octaves into the anchor fold range.
pub fn fold_note(mut note: u8) -> u8 {
    while note > ANCHOR_FOLD_HIGH {
        note -= 12;
    }
    while note < ANCHOR_FOLD_LOW {
        note += 12;
    }
    note
}
