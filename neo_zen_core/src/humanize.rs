// Humanizer: micro timing and velocity imperfection.
//
// A note's start tick moves by a few milliseconds and its velocity by a few
// steps. How far depends on the product of three factors, clamped to [0, 1]:
//
//   global_strength * voice profile strength * phase multiplier
//
// and, for each axis, the voice profile's focus on that axis (timing or
// velocity). The jitter is the product of two uniform draws, which keeps most
// offsets near zero. Velocity also receives a fixed accent by breath tag.
//
// Pitch is never touched. Every draw comes from the `ZenRng` the caller
// passes in; a disabled humanizer (or a voice whose focus on an axis is zero)
// consumes no draws for that axis.

use crate::breath::BreathTag;
use crate::phase::PhaseName;
use crate::voice::Voice;
use neo_zen_prng::ZenRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// How strongly one voice is humanized, per axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanizeProfile {
    pub strength: f64,
    pub timing_focus: f64,
    pub velocity_focus: f64,
}

impl Default for HumanizeProfile {
    fn default() -> Self {
        Self {
            strength: 0.5,
            timing_focus: 0.7,
            velocity_focus: 0.7,
        }
    }
}

impl HumanizeProfile {
    const fn of(strength: f64, timing_focus: f64, velocity_focus: f64) -> Self {
        Self {
            strength,
            timing_focus,
            velocity_focus,
        }
    }

    fn clamped(self) -> Self {
        let unit = |x: f64| if x.is_finite() { x.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            strength: unit(self.strength),
            timing_focus: unit(self.timing_focus),
            velocity_focus: unit(self.velocity_focus),
        }
    }
}

/// Built-in profile for a voice.
pub fn default_profile(voice: Voice) -> HumanizeProfile {
    match voice {
        Voice::Melody => HumanizeProfile::of(0.9, 1.0, 1.0),
        Voice::Harmony => HumanizeProfile::of(0.3, 0.5, 0.4),
        Voice::Drone => HumanizeProfile::of(0.1, 0.2, 0.0),
        Voice::Chime => HumanizeProfile::of(0.7, 0.6, 0.8),
        Voice::Air => HumanizeProfile::of(0.5, 0.4, 0.6),
        Voice::Pulse => HumanizeProfile::of(0.8, 0.9, 0.7),
        _ => HumanizeProfile::default(),
    }
}

/// Built-in multiplier for a phase.
pub fn default_phase_multiplier(phase: PhaseName) -> f64 {
    match phase {
        PhaseName::Grounding => 0.4,
        PhaseName::Immersion => 0.7,
        PhaseName::Breakdown => 0.4,
        PhaseName::Awakening => 1.0,
        PhaseName::Integration => 0.5,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanizeConfig {
    pub enabled: bool,
    /// Master strength in [0, 1].
    pub global_strength: f64,
    /// Timing offset at full strength, in milliseconds.
    pub max_timing_jitter_ms: f64,
    /// Velocity offset at full strength.
    pub max_velocity_jitter: i32,
    pub accent_valley: i32,
    pub accent_peak: i32,
    pub accent_end: i32,
    /// Overrides of the built-in phase multipliers.
    pub phase_multipliers: BTreeMap<PhaseName, f64>,
    /// Overrides of the built-in profiles, keyed by voice name.
    pub profiles: BTreeMap<String, HumanizeProfile>,
}

impl Default for HumanizeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_strength: 0.5,
            max_timing_jitter_ms: 20.0,
            max_velocity_jitter: 6,
            accent_valley: -2,
            accent_peak: 3,
            accent_end: -5,
            phase_multipliers: BTreeMap::new(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Humanizer {
    enabled: bool,
    global_strength: f64,
    max_timing_jitter_ms: f64,
    max_velocity_jitter: i32,
    accents: [i32; 3],
    phase_multipliers: [f64; 5],
    profiles: [HumanizeProfile; Voice::COUNT],
    ticks_per_ms: f64,
}

impl Humanizer {
    /// Build a humanizer for a run at `tempo_bpm` with `ppq` ticks per beat.
    /// A non-positive tempo falls back to 60 bpm.
    pub fn new(config: &HumanizeConfig, ppq: u32, tempo_bpm: f64) -> Self {
        let tempo = if tempo_bpm.is_finite() && tempo_bpm > 0.0 {
            tempo_bpm
        } else {
            debug!(tempo_bpm, "humanizer tempo invalid, using 60");
            60.0
        };
        // One tick lasts 60 / (tempo * ppq) seconds.
        let ticks_per_ms = tempo * f64::from(ppq) / 60_000.0;

        let mut profiles = [HumanizeProfile::default(); Voice::COUNT];
        for voice in Voice::CANONICAL {
            profiles[voice.index()] = default_profile(voice);
        }
        for (name, profile) in &config.profiles {
            let voice = Voice::from_name(name);
            profiles[voice.index()] = profile.clamped();
        }

        let mut phase_multipliers = PhaseName::ALL.map(default_phase_multiplier);
        for (phase, &m) in &config.phase_multipliers {
            if m.is_finite() && m >= 0.0 {
                phase_multipliers[*phase as usize] = m;
            }
        }

        let global_strength = if config.global_strength.is_finite() {
            config.global_strength.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Self {
            enabled: config.enabled,
            global_strength,
            max_timing_jitter_ms: config.max_timing_jitter_ms.max(0.0),
            max_velocity_jitter: config.max_velocity_jitter.max(0),
            accents: [config.accent_valley, config.accent_peak, config.accent_end],
            phase_multipliers,
            profiles,
            ticks_per_ms,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.global_strength > 0.0
    }

    pub fn profile(&self, voice: Voice) -> HumanizeProfile {
        self.profiles[voice.index()]
    }

    fn strength(&self, voice: Voice, phase: PhaseName, focus: f64) -> f64 {
        let p = self.profile(voice);
        (self.global_strength * p.strength * focus * self.phase_multipliers[phase as usize])
            .clamp(0.0, 1.0)
    }

    /// Product of two uniform draws in [-1, 1), centered on zero.
    fn shaped(rng: &mut ZenRng) -> f64 {
        let raw = rng.jitter_f64(1.0);
        raw * rng.jitter_f64(1.0).abs()
    }

    /// Jittered start tick, never below zero.
    pub fn timing(&self, voice: Voice, tick: i64, phase: PhaseName, rng: &mut ZenRng) -> i64 {
        let focus = self.profile(voice).timing_focus;
        if !self.is_enabled() || focus <= 0.0 {
            return tick;
        }
        let range = self.max_timing_jitter_ms
            * self.ticks_per_ms
            * self.strength(voice, phase, focus);
        if range <= 0.0 {
            return tick;
        }
        let offset = (Self::shaped(rng) * range).round() as i64;
        (tick + offset).max(0)
    }

    /// Jittered and accented velocity in [0, 127].
    pub fn velocity(
        &self,
        voice: Voice,
        velocity: i32,
        phase: PhaseName,
        tag: BreathTag,
        rng: &mut ZenRng,
    ) -> i32 {
        let v = velocity.clamp(0, 127);
        let focus = self.profile(voice).velocity_focus;
        if !self.is_enabled() || focus <= 0.0 {
            return v;
        }
        let range = f64::from(self.max_velocity_jitter) * self.strength(voice, phase, focus);
        let jitter = (Self::shaped(rng) * range).round() as i32;
        let accent = match tag {
            BreathTag::Valley => self.accents[0],
            BreathTag::Peak => self.accents[1],
            BreathTag::End => self.accents[2],
            BreathTag::Free => 0,
        };
        (v + jitter + accent).clamp(0, 127)
    }

    /// Humanize both axes, timing first.
    pub fn apply(
        &self,
        voice: Voice,
        tick: i64,
        velocity: i32,
        phase: PhaseName,
        tag: BreathTag,
        rng: &mut ZenRng,
    ) -> (i64, i32) {
        let t = self.timing(voice, tick, phase, rng);
        let v = self.velocity(voice, velocity, phase, tag, rng);
        (t, v)
    }
}
