// Safety pipeline: the last word on every note before it exists.
//
// A candidate passes through eight stages in a fixed order:
//
//   1. absolute pitch clamp to 0..=127
//   2. register clamp for the voice
//   3. velocity clamp to 1..=vel_max with a soft knee above `knee_ceiling`
//   4. step limiter        (guards.rs)
//   5. shock guard         (guards.rs)
//   6. density guard       (guards.rs)
//   7. timbre guard        (guards.rs)
//   8. mix energy guard    (guards.rs)
//
// A velocity at or below zero is refused before stage 3. A note that survives
// every stage with a positive velocity is accepted, lifted to `vel_min` if it
// fell below, and only then committed to every stateful stage. Rejections
// are ordinary values, never errors.
//
// Ordering precondition: ticks for one voice must be non-decreasing between
// resets. Violations are logged and asserted in debug builds.

use crate::guards::{
    DensityGuard, DensityPolicy, GuardNote, GuardOutcome, MixEnergyGuard, NoteGuard, PassGuard,
    RejectReason, SafetyContext, ShockGuard, StepLimiter, TimbreGuard, TimbreRule,
    default_timbre_rules,
};
use crate::register::RegisterGuard;
use crate::settings::in_range_or;
use crate::voice::Voice;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Floor for accepted notes.
    pub vel_min: u8,
    pub vel_max: u8,
    /// Velocities above this are compressed toward it.
    pub knee_ceiling: u8,
    pub step_up_max: f64,
    pub step_down_max: f64,
    pub shock_threshold: f64,
    pub shock_window_beats: f64,
    pub shock_damping: f64,
    pub density_window_breaths: f64,
    pub density_soft: usize,
    pub density_hard: usize,
    pub density_policy: DensityPolicy,
    pub timbre_rules: Vec<TimbreRule>,
    pub mix_window_bars: f64,
    pub mix_max_energy: f64,
    pub mix_soften: f64,
    pub mix_floor: f64,
    /// Names of stateful stages to replace with a pass-through
    /// (`step_limit`, `shock`, `density`, `timbre`, `mix_energy`).
    pub disabled_guards: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            vel_min: 10,
            vel_max: 127,
            knee_ceiling: 105,
            step_up_max: 35.0,
            step_down_max: 80.0,
            shock_threshold: 40.0,
            shock_window_beats: 1.0,
            shock_damping: 0.6,
            density_window_breaths: 2.0,
            density_soft: 16,
            density_hard: 32,
            density_policy: DensityPolicy::Drop,
            timbre_rules: default_timbre_rules(),
            mix_window_bars: 0.5,
            mix_max_energy: 12.0,
            mix_soften: 0.65,
            mix_floor: 8.0,
            disabled_guards: Vec::new(),
        }
    }
}

impl SafetyConfig {
    /// A copy with every out-of-range field replaced by its default.
    ///
    /// Velocity bounds keep `1 <= vel_min <= knee_ceiling <= vel_max`, the
    /// density soft limit stays below the hard one, and timbre rules with a
    /// non-finite or negative scale are dropped.
    pub fn normalized(&self) -> Self {
        let d = Self::default();
        let fraction = |field: &'static str, value: f64, default: f64| {
            in_range_or(field, value, 0.0..=1.0, default)
        };
        let non_negative = |field: &'static str, value: f64, default: f64| {
            in_range_or(field, value, 0.0..=f64::MAX, default)
        };

        let mut c = self.clone();
        c.vel_max = self.vel_max.clamp(1, 127);
        let vel_min = if self.vel_min == 0 { d.vel_min } else { self.vel_min };
        c.vel_min = vel_min.min(c.vel_max);
        c.knee_ceiling = self.knee_ceiling.clamp(c.vel_min, c.vel_max);
        c.step_up_max = non_negative("safety.step_up_max", self.step_up_max, d.step_up_max);
        c.step_down_max =
            non_negative("safety.step_down_max", self.step_down_max, d.step_down_max);
        c.shock_threshold =
            non_negative("safety.shock_threshold", self.shock_threshold, d.shock_threshold);
        c.shock_window_beats = non_negative(
            "safety.shock_window_beats",
            self.shock_window_beats,
            d.shock_window_beats,
        );
        c.shock_damping = fraction("safety.shock_damping", self.shock_damping, d.shock_damping);
        c.density_window_breaths = in_range_or(
            "safety.density_window_breaths",
            self.density_window_breaths,
            f64::MIN_POSITIVE..=f64::MAX,
            d.density_window_breaths,
        );
        c.density_hard = self.density_hard.max(self.density_soft.saturating_add(1));
        c.mix_window_bars =
            non_negative("safety.mix_window_bars", self.mix_window_bars, d.mix_window_bars);
        c.mix_max_energy =
            non_negative("safety.mix_max_energy", self.mix_max_energy, d.mix_max_energy);
        c.mix_soften = fraction("safety.mix_soften", self.mix_soften, d.mix_soften);
        c.mix_floor = in_range_or("safety.mix_floor", self.mix_floor, 0.0..=127.0, d.mix_floor);
        c.timbre_rules.retain(|r| r.scale.is_finite() && r.scale >= 0.0);
        if c.timbre_rules.len() != self.timbre_rules.len() {
            debug!(
                before = self.timbre_rules.len(),
                after = c.timbre_rules.len(),
                "timbre rules with bad scales dropped"
            );
        }
        c
    }
}

/// A note a voice would like to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteCandidate {
    pub voice: Voice,
    pub pitch: i32,
    pub velocity: i32,
    pub tick: i64,
    pub duration: i64,
}

/// One stage's effect on the velocity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diagnostic {
    pub stage: &'static str,
    pub before: f64,
    pub after: f64,
}

/// Outcome of the pipeline for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteResult {
    pub voice: Voice,
    /// In 0..=127 whether or not the note is allowed.
    pub pitch: u8,
    /// In 0..=127; 0 only for refused notes.
    pub velocity: u8,
    pub tick: i64,
    pub duration: i64,
    pub allow: bool,
    pub reject: Option<RejectReason>,
    /// Stages that changed the velocity, in order.
    pub diagnostics: Vec<Diagnostic>,
}

/// Tick lengths the guards need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyTiming {
    pub beat_ticks: i64,
    pub breath_ticks: i64,
}

#[derive(Debug)]
pub struct SafetyPipeline {
    config: SafetyConfig,
    register: RegisterGuard,
    guards: Vec<Box<dyn NoteGuard>>,
    last_tick: [Option<i64>; Voice::COUNT],
}

impl SafetyPipeline {
    pub fn new(config: &SafetyConfig, register: RegisterGuard, timing: SafetyTiming) -> Self {
        let beat = timing.beat_ticks.max(1);
        let bar = beat * 4;
        let enabled = |name: &str| !config.disabled_guards.iter().any(|d| d == name);
        let pass = |label: &'static str| -> Box<dyn NoteGuard> { Box::new(PassGuard { label }) };

        let mut guards: Vec<Box<dyn NoteGuard>> = Vec::with_capacity(5);
        guards.push(if enabled("step_limit") {
            Box::new(StepLimiter::new(
                config.step_up_max,
                config.step_down_max,
                config.vel_min as f64,
            ))
        } else {
            pass("step_limit")
        });
        guards.push(if enabled("shock") {
            Box::new(ShockGuard::new(
                config.shock_threshold,
                (config.shock_window_beats * beat as f64) as i64,
                config.shock_damping,
            ))
        } else {
            pass("shock")
        });
        guards.push(if enabled("density") {
            Box::new(DensityGuard::new(
                (config.density_window_breaths * timing.breath_ticks as f64) as i64,
                config.density_soft,
                config.density_hard,
                config.density_policy,
            ))
        } else {
            pass("density")
        });
        guards.push(if enabled("timbre") {
            Box::new(TimbreGuard::new(config.timbre_rules.clone(), beat))
        } else {
            pass("timbre")
        });
        guards.push(if enabled("mix_energy") {
            Box::new(MixEnergyGuard::new(
                (config.mix_window_bars * bar as f64) as i64,
                config.mix_max_energy,
                config.mix_soften,
                config.mix_floor,
            ))
        } else {
            pass("mix_energy")
        });

        Self {
            config: config.clone(),
            register,
            guards,
            last_tick: [None; Voice::COUNT],
        }
    }

    pub fn register(&self) -> &RegisterGuard {
        &self.register
    }

    /// Names of the stateful stages in chain order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.guards.iter().map(|g| g.name()).collect()
    }

    /// Run a candidate through every stage. Accepted notes update state.
    pub fn apply(&mut self, candidate: &NoteCandidate, ctx: &SafetyContext) -> NoteResult {
        let voice = candidate.voice;
        let pitch = candidate.pitch.clamp(0, 127);
        let pitch = self.register.clamp(voice, pitch).clamp(0, 127) as u8;

        let mut result = NoteResult {
            voice,
            pitch,
            velocity: 0,
            tick: candidate.tick,
            duration: candidate.duration.max(1),
            allow: false,
            reject: None,
            diagnostics: Vec::new(),
        };

        if candidate.velocity <= 0 {
            result.reject = Some(RejectReason::NonPositiveVelocity);
            trace!(%voice, tick = candidate.tick, "safety: non-positive velocity");
            return result;
        }

        let mut note = GuardNote {
            voice,
            pitch,
            velocity: self.shape_velocity(candidate.velocity),
            tick: candidate.tick,
        };
        if note.velocity != candidate.velocity as f64 {
            result.diagnostics.push(Diagnostic {
                stage: "velocity_clamp",
                before: candidate.velocity as f64,
                after: note.velocity,
            });
        }

        for guard in &self.guards {
            let before = note.velocity;
            let outcome = guard.apply(&mut note, ctx);
            if note.velocity != before {
                result.diagnostics.push(Diagnostic {
                    stage: guard.name(),
                    before,
                    after: note.velocity,
                });
            }
            if let GuardOutcome::Reject(reason) = outcome {
                result.reject = Some(reason);
                trace!(%voice, tick = note.tick, stage = guard.name(), ?reason, "safety: rejected");
                return result;
            }
        }

        let velocity = note.velocity.round();
        if velocity.is_nan() || velocity <= 0.0 {
            result.reject = Some(RejectReason::Silenced);
            return result;
        }
        note.velocity = velocity.max(self.config.vel_min as f64).min(127.0);

        self.check_order(voice, note.tick);
        for guard in &mut self.guards {
            guard.commit(&note);
        }

        result.velocity = note.velocity as u8;
        result.allow = true;
        result
    }

    /// Velocity clamp with a soft knee: above the ceiling, the excess is
    /// compressed progressively so `vel_max` maps to halfway up the knee.
    fn shape_velocity(&self, velocity: i32) -> f64 {
        let vel_max = self.config.vel_max.clamp(1, 127) as f64;
        let ceiling = (self.config.knee_ceiling as f64).min(vel_max);
        let v = (velocity as f64).clamp(1.0, vel_max);
        if v <= ceiling {
            return v;
        }
        let span = (vel_max - ceiling).max(1.0);
        let over = v - ceiling;
        ceiling + over * (1.0 - 0.5 * over / span)
    }

    fn check_order(&mut self, voice: Voice, tick: i64) {
        let slot = &mut self.last_tick[voice.index()];
        if let Some(prev) = *slot {
            debug_assert!(tick >= prev, "{voice}: safety tick {tick} after {prev}");
            if tick < prev {
                warn!(%voice, tick, prev, "safety pipeline called out of tick order");
                return;
            }
        }
        *slot = Some(tick);
    }

    /// Clear every stage's history for a new run.
    pub fn reset(&mut self) {
        for guard in &mut self.guards {
            guard.reset();
        }
        self.last_tick = [None; Voice::COUNT];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseName;
    use crate::register::RegisterConfig;
    use crate::structure::SectionKind;

    fn pipeline(config: &SafetyConfig) -> SafetyPipeline {
        SafetyPipeline::new(
            config,
            RegisterGuard::default(),
            SafetyTiming {
                beat_ticks: 480,
                breath_ticks: 3840,
            },
        )
    }

    fn candidate(voice: Voice, pitch: i32, velocity: i32, tick: i64) -> NoteCandidate {
        NoteCandidate {
            voice,
            pitch,
            velocity,
            tick,
            duration: 240,
        }
    }

    #[test]
    fn stage_order() {
        let p = pipeline(&SafetyConfig::default());
        assert_eq!(
            p.stage_names(),
            vec!["step_limit", "shock", "density", "timbre", "mix_energy"]
        );
    }

    #[test]
    fn pitch_is_clamped_to_register() {
        let mut p = pipeline(&SafetyConfig::default());
        let ctx = SafetyContext::neutral();
        let r = p.apply(&candidate(Voice::Drone, 90, 60, 0), &ctx);
        assert!(r.allow);
        assert_eq!(r.pitch, 52);
        let r = p.apply(&candidate(Voice::Melody, -40, 60, 0), &ctx);
        assert_eq!(r.pitch, 60);
    }

    #[test]
    fn non_positive_velocity_is_refused() {
        let mut p = pipeline(&SafetyConfig::default());
        let ctx = SafetyContext::neutral();
        let r = p.apply(&candidate(Voice::Melody, 200, 0, 0), &ctx);
        assert!(!r.allow);
        assert_eq!(r.velocity, 0);
        assert_eq!(r.pitch, 96);
        assert_eq!(r.reject, Some(RejectReason::NonPositiveVelocity));
        let r = p.apply(&candidate(Voice::Melody, 60, -30, 0), &ctx);
        assert!(!r.allow);
    }

    #[test]
    fn soft_knee_compresses_loud_notes() {
        let p = pipeline(&SafetyConfig::default());
        assert_eq!(p.shape_velocity(100), 100.0);
        assert_eq!(p.shape_velocity(105), 105.0);
        assert_eq!(p.shape_velocity(127), 116.0);
        assert_eq!(p.shape_velocity(500), 116.0);
        assert_eq!(p.shape_velocity(-3), 1.0);
    }

    #[test]
    fn quiet_notes_lift_to_floor() {
        let mut p = pipeline(&SafetyConfig::default());
        let r = p.apply(&candidate(Voice::Air, 70, 3, 0), &SafetyContext::neutral());
        assert!(r.allow);
        assert_eq!(r.velocity, 10);
    }

    #[test]
    fn rejected_notes_leave_no_history() {
        let config = SafetyConfig {
            density_soft: 0,
            density_hard: 1,
            ..Default::default()
        };
        let mut p = pipeline(&config);
        let ctx = SafetyContext::neutral();
        assert!(p.apply(&candidate(Voice::Chime, 80, 60, 0), &ctx).allow);
        let r = p.apply(&candidate(Voice::Chime, 80, 60, 10), &ctx);
        assert_eq!(r.reject, Some(RejectReason::DensityHard));
        p.reset();
        assert!(p.apply(&candidate(Voice::Chime, 80, 60, 20), &ctx).allow);
    }

    #[test]
    fn step_limit_follows_accepted_velocity() {
        let mut p = pipeline(&SafetyConfig::default());
        let ctx = SafetyContext::neutral();
        p.apply(&candidate(Voice::Melody, 72, 30, 0), &ctx);
        let r = p.apply(&candidate(Voice::Melody, 72, 120, 4000), &ctx);
        assert_eq!(r.velocity, 65);
        assert!(r.diagnostics.iter().any(|d| d.stage == "step_limit"));
    }

    #[test]
    fn disabled_stage_is_pass_through() {
        let config = SafetyConfig {
            disabled_guards: vec!["step_limit".into()],
            ..Default::default()
        };
        let mut p = pipeline(&config);
        let ctx = SafetyContext::neutral();
        p.apply(&candidate(Voice::Melody, 72, 30, 0), &ctx);
        let r = p.apply(&candidate(Voice::Melody, 72, 100, 4000), &ctx);
        assert_eq!(r.velocity, 100);
    }

    #[test]
    fn chime_softens_in_breakdown() {
        let mut p = pipeline(&SafetyConfig::default());
        let ctx = SafetyContext {
            phase: PhaseName::Breakdown,
            ..SafetyContext::neutral()
        };
        let r = p.apply(&candidate(Voice::Chime, 80, 100, 0), &ctx);
        assert_eq!(r.velocity, 70);
    }

    #[test]
    fn register_overrides_flow_through() {
        let json = r#"{ "overrides": { "lead": { "min": 70, "max": 80 } } }"#;
        let reg: RegisterConfig = serde_json::from_str(json).unwrap();
        let mut p = SafetyPipeline::new(
            &SafetyConfig::default(),
            RegisterGuard::new(0, &reg),
            SafetyTiming {
                beat_ticks: 480,
                breath_ticks: 3840,
            },
        );
        let r = p.apply(&candidate(Voice::Melody, 60, 60, 0), &SafetyContext::neutral());
        assert_eq!(r.pitch, 70);
    }

    #[test]
    fn normalized_config_keeps_bounds_ordered() {
        let mut config = SafetyConfig {
            vel_min: 0,
            vel_max: 200,
            knee_ceiling: 3,
            shock_damping: -0.5,
            density_window_breaths: 0.0,
            density_soft: 40,
            density_hard: 8,
            mix_max_energy: f64::NAN,
            mix_floor: 500.0,
            ..SafetyConfig::default()
        };
        config.timbre_rules[0].scale = f64::INFINITY;
        let c = config.normalized();
        let d = SafetyConfig::default();
        assert_eq!((c.vel_min, c.vel_max, c.knee_ceiling), (10, 127, 10));
        assert_eq!(c.shock_damping, d.shock_damping);
        assert_eq!(c.density_window_breaths, d.density_window_breaths);
        assert_eq!((c.density_soft, c.density_hard), (40, 41));
        assert_eq!(c.mix_max_energy, d.mix_max_energy);
        assert_eq!(c.mix_floor, d.mix_floor);
        assert_eq!(c.timbre_rules.len(), d.timbre_rules.len() - 1);

        assert_eq!(SafetyConfig::default().normalized(), SafetyConfig::default());
    }

    #[test]
    fn chime_in_bridge_is_softened() {
        let mut p = pipeline(&SafetyConfig::default());
        let ctx = SafetyContext {
            phase: PhaseName::Immersion,
            phase_energy: 0.6,
            section: SectionKind::Bridge,
            is_breakdown: false,
        };
        let r = p.apply(&candidate(Voice::Chime, 80, 100, 0), &ctx);
        assert!(r.allow);
        assert_eq!(r.velocity, 70);
        assert_eq!(r.diagnostics.len(), 1);
        assert_eq!(r.diagnostics[0].stage, "timbre");
    }
}
