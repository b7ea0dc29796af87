// Narrative energy curve: the five phases of a piece.
//
// A piece moves through grounding, immersion, breakdown, awakening and
// integration. Each phase covers a slice of normalized time [0, 1] and
// carries four biases that other components read: base energy (section
// loudness), movement (how often voices act), brightness and tension.
//
// The matrix is immutable after construction. Configuration may move the four
// internal boundaries; a boundary set that does not partition [0, 1] strictly
// is rejected in favour of the defaults. Per-phase, per-voice layer profiles
// (density/velocity multipliers and movement/register biases) are looked up
// here too, with a neutral profile for anything unconfigured.

use crate::voice::Voice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// One of the five narrative phases, in timeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Grounding,
    Immersion,
    Breakdown,
    Awakening,
    Integration,
}

impl PhaseName {
    pub const ALL: [PhaseName; 5] = [
        PhaseName::Grounding,
        PhaseName::Immersion,
        PhaseName::Breakdown,
        PhaseName::Awakening,
        PhaseName::Integration,
    ];

    /// 1-based position in the timeline.
    pub fn index(self) -> u8 {
        self as u8 + 1
    }

    pub fn name(self) -> &'static str {
        match self {
            PhaseName::Grounding => "grounding",
            PhaseName::Immersion => "immersion",
            PhaseName::Breakdown => "breakdown",
            PhaseName::Awakening => "awakening",
            PhaseName::Integration => "integration",
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A phase with its resolved boundaries and biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: PhaseName,
    pub index: u8,
    pub start_ratio: f64,
    pub end_ratio: f64,
    pub base_energy: f64,
    pub movement_bias: f64,
    pub brightness_bias: f64,
    pub tension_bias: f64,
}

impl Phase {
    pub fn contains(&self, ratio: f64) -> bool {
        ratio >= self.start_ratio && ratio < self.end_ratio
    }
}

/// Default internal boundaries between consecutive phases.
pub const DEFAULT_BOUNDARIES: [f64; 4] = [0.18, 0.42, 0.58, 0.82];

/// (base_energy, movement_bias, brightness_bias, tension_bias) per phase.
const PHASE_BIASES: [(f64, f64, f64, f64); 5] = [
    (0.2, 0.2, 0.3, 0.1),
    (0.4, 0.4, 0.5, 0.3),
    (0.3, 0.2, 0.25, 0.2),
    (0.8, 0.8, 0.8, 0.5),
    (0.25, 0.3, 0.4, 0.1),
];

/// Per-phase, per-voice multipliers and biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerProfile {
    pub density_mul: f64,
    pub velocity_mul: f64,
    pub movement_bias: f64,
    pub register_bias: f64,
}

impl Default for LayerProfile {
    fn default() -> Self {
        Self {
            density_mul: 1.0,
            velocity_mul: 1.0,
            movement_bias: 0.5,
            register_bias: 0.5,
        }
    }
}

/// Configuration for the phase matrix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Four strictly increasing internal boundaries in (0, 1). `None` keeps
    /// the defaults.
    pub boundaries: Option<Vec<f64>>,
    /// Layer profiles keyed by phase, then by voice name (aliases allowed).
    pub layer_profiles: BTreeMap<PhaseName, BTreeMap<String, LayerProfile>>,
}

/// Phase information resolved for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseContext {
    pub phase: PhaseName,
    /// Normalized position of the tick in the piece.
    pub ratio: f64,
    /// Energy at this point; the phase's base energy unless a caller
    /// substitutes a segment-level value.
    pub energy: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseMatrix {
    phases: [Phase; 5],
    profiles: BTreeMap<(PhaseName, Voice), LayerProfile>,
}

impl Default for PhaseMatrix {
    fn default() -> Self {
        Self::new(&PhaseConfig::default())
    }
}

impl PhaseMatrix {
    pub fn new(config: &PhaseConfig) -> Self {
        let boundaries = match config.boundaries.as_deref() {
            Some(b) if valid_boundaries(b) => [b[0], b[1], b[2], b[3]],
            Some(b) => {
                debug!(?b, "phase boundaries do not partition [0, 1]; using defaults");
                DEFAULT_BOUNDARIES
            }
            None => DEFAULT_BOUNDARIES,
        };

        let phases = std::array::from_fn(|i| {
            let (base_energy, movement_bias, brightness_bias, tension_bias) = PHASE_BIASES[i];
            let name = PhaseName::ALL[i];
            Phase {
                name,
                index: name.index(),
                start_ratio: if i == 0 { 0.0 } else { boundaries[i - 1] },
                end_ratio: if i == 4 { 1.0 } else { boundaries[i] },
                base_energy,
                movement_bias,
                brightness_bias,
                tension_bias,
            }
        });

        let mut profiles = BTreeMap::new();
        for (&phase, by_voice) in &config.layer_profiles {
            for (voice_name, profile) in by_voice {
                profiles.insert((phase, Voice::from_name(voice_name)), *profile);
            }
        }

        Self { phases, profiles }
    }

    /// All phases in timeline order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase(&self, name: PhaseName) -> &Phase {
        &self.phases[name as usize]
    }

    /// Phase covering `ratio`. Input is clamped to [0, 1]; NaN counts as 0.
    ///
    /// A ratio exactly on a boundary belongs to the later phase, and 1.0
    /// belongs to the last phase.
    pub fn phase_at(&self, ratio: f64) -> &Phase {
        let r = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        self.phases
            .iter()
            .rev()
            .find(|p| r >= p.start_ratio)
            .unwrap_or(&self.phases[0])
    }

    /// Phase context for an absolute tick in a timeline of `total_ticks`.
    pub fn context_at(&self, tick: i64, total_ticks: i64) -> PhaseContext {
        let ratio = if total_ticks > 0 {
            (tick as f64 / total_ticks as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let phase = self.phase_at(ratio);
        PhaseContext {
            phase: phase.name,
            ratio,
            energy: phase.base_energy,
        }
    }

    pub fn layer_profile(&self, phase: PhaseName, voice: Voice) -> LayerProfile {
        self.profiles
            .get(&(phase, voice))
            .copied()
            .unwrap_or_default()
    }
}

fn valid_boundaries(b: &[f64]) -> bool {
    b.len() == 4
        && b.iter().all(|x| x.is_finite() && *x > 0.0 && *x < 1.0)
        && b.windows(2).all(|w| w[0] < w[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_boundaries() {
        let m = PhaseMatrix::default();
        assert_eq!(m.phase_at(0.0).name, PhaseName::Grounding);
        assert_eq!(m.phase_at(0.17).name, PhaseName::Grounding);
        assert_eq!(m.phase_at(0.5).name, PhaseName::Breakdown);
        assert_eq!(m.phase_at(0.7).name, PhaseName::Awakening);
        assert_eq!(m.phase_at(0.99).name, PhaseName::Integration);
    }

    #[test]
    fn boundary_ties_go_to_later_phase() {
        let m = PhaseMatrix::default();
        assert_eq!(m.phase_at(0.18).name, PhaseName::Immersion);
        assert_eq!(m.phase_at(0.42).name, PhaseName::Breakdown);
        assert_eq!(m.phase_at(0.58).name, PhaseName::Awakening);
        assert_eq!(m.phase_at(0.82).name, PhaseName::Integration);
        assert_eq!(m.phase_at(1.0).name, PhaseName::Integration);
    }

    #[test]
    fn out_of_range_ratios_clamp() {
        let m = PhaseMatrix::default();
        assert_eq!(m.phase_at(-3.0).name, PhaseName::Grounding);
        assert_eq!(m.phase_at(7.0).name, PhaseName::Integration);
        assert_eq!(m.phase_at(f64::NAN).name, PhaseName::Grounding);
    }

    #[test]
    fn phases_are_contiguous() {
        let m = PhaseMatrix::default();
        let phases = m.phases();
        assert_eq!(phases[0].start_ratio, 0.0);
        assert_eq!(phases[4].end_ratio, 1.0);
        for w in phases.windows(2) {
            assert_eq!(w[0].end_ratio, w[1].start_ratio);
        }
        for (i, p) in phases.iter().enumerate() {
            assert_eq!(p.index as usize, i + 1);
        }
    }

    #[test]
    fn custom_boundaries_accepted_when_valid() {
        let config = PhaseConfig {
            boundaries: Some(vec![0.1, 0.2, 0.3, 0.4]),
            ..Default::default()
        };
        let m = PhaseMatrix::new(&config);
        assert_eq!(m.phase_at(0.35).name, PhaseName::Awakening);
        assert_eq!(m.phase_at(0.5).name, PhaseName::Integration);
    }

    #[test]
    fn invalid_boundaries_fall_back() {
        for bad in [
            vec![0.5, 0.4, 0.6, 0.7],
            vec![0.0, 0.2, 0.3, 0.4],
            vec![0.1, 0.2, 0.3],
            vec![0.1, 0.2, 0.3, f64::NAN],
            vec![0.1, 0.1, 0.3, 0.4],
        ] {
            let config = PhaseConfig {
                boundaries: Some(bad),
                ..Default::default()
            };
            assert_eq!(PhaseMatrix::new(&config), PhaseMatrix::default());
        }
    }

    #[test]
    fn context_at_ticks() {
        let m = PhaseMatrix::default();
        let ctx = m.context_at(500, 1000);
        assert_eq!(ctx.phase, PhaseName::Breakdown);
        assert!((ctx.ratio - 0.5).abs() < 1e-12);
        assert_eq!(ctx.energy, 0.3);
        assert_eq!(m.context_at(1000, 1000).phase, PhaseName::Integration);
        assert_eq!(m.context_at(5, 0).phase, PhaseName::Grounding);
    }

    #[test]
    fn layer_profile_lookup_uses_aliases() {
        let json = r#"{
            "layer_profiles": {
                "awakening": { "lead": { "density_mul": 1.4, "velocity_mul": 1.2 } }
            }
        }"#;
        let config: PhaseConfig = serde_json::from_str(json).unwrap();
        let m = PhaseMatrix::new(&config);
        let p = m.layer_profile(PhaseName::Awakening, Voice::Melody);
        assert_eq!(p.density_mul, 1.4);
        assert_eq!(p.velocity_mul, 1.2);
        assert_eq!(p.movement_bias, 0.5);
        assert_eq!(
            m.layer_profile(PhaseName::Grounding, Voice::Melody),
            LayerProfile::default()
        );
    }
}
