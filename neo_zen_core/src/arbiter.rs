// Activity arbiter: cross-voice density and admission control.
//
// Time is cut into fixed bins (`bin_size_ticks`, default 120). One weight
// array covers all voices together and one more covers each voice, both
// spanning the whole run. A voice about to act asks `query`; the answer says
// whether it may, how much to scale its density and velocity, and how urgent
// it is. If the note is then actually emitted, the caller `commit`s its
// weight so later queries over the same region see it.
//
// A query runs these stages in order:
//
//   1. movement ratio from the phase's movement bias, scaled per phase and
//      per breath tag
//   2. smoothed densities: mean of the bins within ±1 of the tick
//   3. hard limits (global or per-voice): deny outright
//   4. soft limits: scale density and velocity toward their floors as the
//      density approaches its hard limit; shrink movement up to 50%
//   5. stillness gate: two uniform draws; the second blends randomness into
//      the gate, the first must fall under it
//   6. priority from importance, movement bias and global density
//
// Both draws are consumed whenever stage 5 is reached, so the random stream
// depends only on the sequence of queries, not on their outcomes.
//
// `commit` must only follow an admitting decision. The orchestration layer
// enforces this with a move-only admission token.

use crate::breath::{BreathClock, BreathTag};
use crate::phase::{PhaseMatrix, PhaseName};
use crate::settings::in_range_or;
use crate::voice::Voice;
use neo_zen_prng::ZenRng;
use serde::{Deserialize, Serialize};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub bin_size_ticks: i64,
    /// Bins on each side of the query bin included in the density mean.
    pub window_bins: usize,
    pub base_movement_ratio: f64,
    pub movement_gain: f64,
    /// Weight of the random term in the stillness gate.
    pub randomness: f64,
    pub soft_global: f64,
    pub hard_global: f64,
    pub soft_voice: f64,
    pub hard_voice: f64,
    /// `density_mul` reached at the hard limit.
    pub soft_density_floor: f64,
    /// `velocity_mul` reached at the hard limit.
    pub soft_velocity_floor: f64,
    /// Largest fractional movement reduction from soft limiting.
    pub movement_shrink: f64,
    /// Exponential priority decay per unit of global density.
    pub priority_decay: f64,
    /// Requests at or above this importance skip the stillness gate.
    pub stillness_exempt_importance: f64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            bin_size_ticks: 120,
            window_bins: 1,
            base_movement_ratio: 0.12,
            movement_gain: 0.2,
            randomness: 0.25,
            soft_global: 0.75,
            hard_global: 1.15,
            soft_voice: 1.0,
            hard_voice: 1.5,
            soft_density_floor: 0.25,
            soft_velocity_floor: 0.6,
            movement_shrink: 0.5,
            priority_decay: 0.7,
            stillness_exempt_importance: 0.95,
        }
    }
}

/// Widest smoothing window accepted from configuration, in bins per side.
pub const MAX_WINDOW_BINS: usize = 64;

impl ArbiterConfig {
    /// A copy with every out-of-range field replaced by its default.
    /// Limits and thresholds must be finite and non-negative, fractions lie
    /// in [0, 1], and each soft limit is lowered to its hard limit if above.
    pub fn normalized(&self) -> Self {
        let d = Self::default();
        let fraction = |field: &'static str, value: f64, default: f64| {
            in_range_or(field, value, 0.0..=1.0, default)
        };
        let non_negative = |field: &'static str, value: f64, default: f64| {
            in_range_or(field, value, 0.0..=f64::MAX, default)
        };

        let mut c = Self {
            bin_size_ticks: if self.bin_size_ticks > 0 {
                self.bin_size_ticks
            } else {
                d.bin_size_ticks
            },
            window_bins: self.window_bins.min(MAX_WINDOW_BINS),
            base_movement_ratio: fraction(
                "arbiter.base_movement_ratio",
                self.base_movement_ratio,
                d.base_movement_ratio,
            ),
            movement_gain: non_negative(
                "arbiter.movement_gain",
                self.movement_gain,
                d.movement_gain,
            ),
            randomness: fraction("arbiter.randomness", self.randomness, d.randomness),
            soft_global: non_negative("arbiter.soft_global", self.soft_global, d.soft_global),
            hard_global: non_negative("arbiter.hard_global", self.hard_global, d.hard_global),
            soft_voice: non_negative("arbiter.soft_voice", self.soft_voice, d.soft_voice),
            hard_voice: non_negative("arbiter.hard_voice", self.hard_voice, d.hard_voice),
            soft_density_floor: fraction(
                "arbiter.soft_density_floor",
                self.soft_density_floor,
                d.soft_density_floor,
            ),
            soft_velocity_floor: fraction(
                "arbiter.soft_velocity_floor",
                self.soft_velocity_floor,
                d.soft_velocity_floor,
            ),
            movement_shrink: fraction(
                "arbiter.movement_shrink",
                self.movement_shrink,
                d.movement_shrink,
            ),
            priority_decay: non_negative(
                "arbiter.priority_decay",
                self.priority_decay,
                d.priority_decay,
            ),
            stillness_exempt_importance: non_negative(
                "arbiter.stillness_exempt_importance",
                self.stillness_exempt_importance,
                d.stillness_exempt_importance,
            ),
        };
        c.soft_global = c.soft_global.min(c.hard_global);
        c.soft_voice = c.soft_voice.min(c.hard_voice);
        c
    }
}

/// Why a query came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Admitted,
    /// Admitted with density/velocity scaled down.
    SoftLimited,
    HardGlobal,
    HardVoice,
    /// The stillness gate held the voice back.
    Stillness,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivityDecision {
    pub allow: bool,
    pub density_mul: f64,
    /// In [0, 2].
    pub velocity_mul: f64,
    /// In [0, 1].
    pub priority: f64,
    pub phase_name: PhaseName,
    pub breath_phase: f64,
    pub breath_tag: BreathTag,
    pub movement_ratio: f64,
    pub global_density: f64,
    pub voice_density: f64,
    pub reason: DecisionReason,
}

#[derive(Debug, Clone)]
pub struct ActivityArbiter {
    config: ArbiterConfig,
    phases: PhaseMatrix,
    /// Used for positions and tags only; slot state is never touched.
    breath: BreathClock,
    total_ticks: i64,
    global: Vec<f64>,
    voices: Vec<Vec<f64>>,
}

impl ActivityArbiter {
    pub fn new(
        config: &ArbiterConfig,
        phases: &PhaseMatrix,
        breath: &BreathClock,
        total_ticks: i64,
    ) -> Self {
        let mut config = config.clone();
        config.bin_size_ticks = config.bin_size_ticks.max(1);
        let bins = (total_ticks.max(1) as usize).div_ceil(config.bin_size_ticks as usize);
        Self {
            phases: phases.clone(),
            breath: breath.clone(),
            total_ticks: total_ticks.max(1),
            global: vec![0.0; bins],
            voices: vec![vec![0.0; bins]; Voice::COUNT],
            config,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.global.len()
    }

    pub fn bin_of(&self, tick: i64) -> usize {
        let idx = (tick.max(0) / self.config.bin_size_ticks) as usize;
        idx.min(self.global.len() - 1)
    }

    /// Smoothed global density around `tick`.
    pub fn global_density(&self, tick: i64) -> f64 {
        self.window_mean(&self.global, tick)
    }

    /// Smoothed density of `voice` alone around `tick`, unweighted.
    pub fn voice_density(&self, voice: Voice, tick: i64) -> f64 {
        self.window_mean(&self.voices[voice.index()], tick)
    }

    fn window_mean(&self, bins: &[f64], tick: i64) -> f64 {
        let center = self.bin_of(tick);
        let lo = center.saturating_sub(self.config.window_bins);
        let hi = center
            .saturating_add(self.config.window_bins)
            .min(bins.len() - 1);
        let window = &bins[lo..=hi];
        window.iter().sum::<f64>() / window.len() as f64
    }

    /// Decide whether `voice` may act at `tick`.
    pub fn query(
        &self,
        voice: Voice,
        tick: i64,
        importance: f64,
        rng: &mut ZenRng,
    ) -> ActivityDecision {
        let c = &self.config;
        let importance = if importance.is_finite() {
            importance.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let ratio = (tick.max(0) as f64 / self.total_ticks as f64).clamp(0.0, 1.0);
        let phase = self.phases.phase_at(ratio);
        let breath = self.breath.position(tick);
        let breath_tag = self.breath.phase_tag(breath.phase);
        let profile = self.phases.layer_profile(phase.name, voice);

        let mut movement = c.base_movement_ratio + c.movement_gain * phase.movement_bias;
        movement *= match phase.name {
            PhaseName::Grounding => 0.6,
            PhaseName::Breakdown => 0.3,
            PhaseName::Integration => 0.5,
            PhaseName::Awakening => 1.1,
            PhaseName::Immersion => 1.0,
        };
        movement *= match breath_tag {
            BreathTag::Peak => 1.1,
            BreathTag::Valley | BreathTag::End => 0.7,
            BreathTag::Free => 1.0,
        };
        movement = movement.clamp(0.0, 1.0);

        let global_density = self.global_density(tick);
        let voice_density = self.voice_density(voice, tick) * voice.energy_weight();

        let mut decision = ActivityDecision {
            allow: false,
            density_mul: 1.0,
            velocity_mul: 1.0,
            priority: 0.0,
            phase_name: phase.name,
            breath_phase: breath.phase,
            breath_tag,
            movement_ratio: movement,
            global_density,
            voice_density,
            reason: DecisionReason::Admitted,
        };

        if global_density > c.hard_global {
            decision.reason = DecisionReason::HardGlobal;
            trace!(%voice, tick, global_density, "arbiter: hard global limit");
            return decision;
        }
        if voice_density > c.hard_voice {
            decision.reason = DecisionReason::HardVoice;
            trace!(%voice, tick, voice_density, "arbiter: hard voice limit");
            return decision;
        }

        let over_global = soft_fraction(global_density, c.soft_global, c.hard_global);
        let over_voice = soft_fraction(voice_density, c.soft_voice, c.hard_voice);
        let mut softened = false;
        for t in [over_global, over_voice] {
            if t > 0.0 {
                softened = true;
                decision.density_mul *= lerp(1.0, c.soft_density_floor, t);
                decision.velocity_mul *= lerp(1.0, c.soft_velocity_floor, t);
            }
        }
        let closeness = over_global.max(over_voice);
        movement *= 1.0 - c.movement_shrink * closeness;
        decision.movement_ratio = movement;

        decision.density_mul = (decision.density_mul * profile.density_mul).max(0.0);
        decision.velocity_mul = (decision.velocity_mul * profile.velocity_mul).clamp(0.0, 2.0);

        let draw = rng.next_f64();
        let noise = rng.next_f64();
        let gate = (1.0 - c.randomness) * movement + c.randomness * noise;
        if draw > gate && importance < c.stillness_exempt_importance {
            decision.reason = DecisionReason::Stillness;
            trace!(%voice, tick, draw, gate, "arbiter: stillness");
            return decision;
        }

        decision.allow = true;
        decision.reason = if softened {
            DecisionReason::SoftLimited
        } else {
            DecisionReason::Admitted
        };
        decision.priority = (importance
            * (0.4 + 0.6 * phase.movement_bias)
            * (-c.priority_decay * global_density).exp())
        .clamp(0.0, 1.0);
        trace!(%voice, tick, priority = decision.priority, reason = ?decision.reason, "arbiter: admit");
        decision
    }

    /// Spread `weight` evenly over the bins spanned by the note, for the
    /// global array and the voice's own array.
    pub fn commit(&mut self, voice: Voice, start_tick: i64, duration_ticks: i64, weight: f64) {
        if !weight.is_finite() || weight <= 0.0 {
            return;
        }
        let first = self.bin_of(start_tick);
        let last = self.bin_of(start_tick.max(0) + duration_ticks.max(1) - 1);
        let share = weight / (last - first + 1) as f64;
        let own = &mut self.voices[voice.index()];
        for bin in first..=last {
            self.global[bin] += share;
            own[bin] += share;
        }
    }

    /// Zero every bin for a new run.
    pub fn reset(&mut self) {
        self.global.iter_mut().for_each(|b| *b = 0.0);
        for bins in &mut self.voices {
            bins.iter_mut().for_each(|b| *b = 0.0);
        }
    }
}

/// How far `density` sits between `soft` and `hard`, in [0, 1].
fn soft_fraction(density: f64, soft: f64, hard: f64) -> f64 {
    if density <= soft || hard <= soft {
        return 0.0;
    }
    ((density - soft) / (hard - soft)).clamp(0.0, 1.0)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breath::BreathConfig;

    const TOTAL: i64 = 28800;

    fn arbiter() -> ActivityArbiter {
        let phases = PhaseMatrix::default();
        let breath = BreathClock::new(480, 2.0, &BreathConfig::default());
        ActivityArbiter::new(&ArbiterConfig::default(), &phases, &breath, TOTAL)
    }

    #[test]
    fn bins_cover_run() {
        let a = arbiter();
        assert_eq!(a.bin_count(), 240);
        assert_eq!(a.bin_of(-5), 0);
        assert_eq!(a.bin_of(119), 0);
        assert_eq!(a.bin_of(120), 1);
        assert_eq!(a.bin_of(TOTAL * 2), 239);
    }

    #[test]
    fn committed_weight_averages_over_window() {
        let mut a = arbiter();
        for _ in 0..5 {
            a.commit(Voice::Melody, 1200, 60, 0.2);
        }
        assert!((a.global_density(1200) - 1.0 / 3.0).abs() < 1e-12);
        assert!((a.voice_density(Voice::Melody, 1200) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(a.voice_density(Voice::Pulse, 1200), 0.0);
        // Edge bin averages over two bins.
        a.commit(Voice::Melody, 0, 10, 1.0);
        assert!((a.global_density(0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn commit_spreads_across_spanned_bins() {
        let mut a = arbiter();
        a.commit(Voice::Drone, 1200, 480, 1.0);
        for bin in 10..14 {
            assert!((a.global[bin] - 0.25).abs() < 1e-12);
        }
        assert_eq!(a.global[14], 0.0);
        a.commit(Voice::Drone, 1200, 480, f64::NAN);
        a.commit(Voice::Drone, 1200, 480, -1.0);
        assert!((a.global[10] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn hard_limits_deny_without_drawing() {
        let mut a = arbiter();
        for _ in 0..10 {
            a.commit(Voice::Pulse, 6000, 100, 1.0);
        }
        let mut rng = ZenRng::new(1);
        let before = rng.clone();
        let d = a.query(Voice::Melody, 6000, 1.0, &mut rng);
        assert!(!d.allow);
        assert_eq!(d.reason, DecisionReason::HardGlobal);
        assert_eq!(rng, before);
    }

    #[test]
    fn hard_voice_limit() {
        let mut a = arbiter();
        // Raw handpan density 2.0 weighs 2.4 against the 1.5 voice limit.
        a.config.hard_global = 100.0;
        a.config.soft_global = 99.0;
        for _ in 0..6 {
            a.commit(Voice::Handpan, 6000, 100, 1.0);
        }
        let mut rng = ZenRng::new(1);
        let d = a.query(Voice::Handpan, 6000, 1.0, &mut rng);
        assert_eq!(d.reason, DecisionReason::HardVoice);
        let d = a.query(Voice::Melody, 6000, 1.0, &mut rng);
        assert!(d.allow);
    }

    #[test]
    fn soft_limit_scales_multipliers() {
        let mut a = arbiter();
        // Global density 0.95: halfway between soft 0.75 and hard 1.15.
        for _ in 0..3 {
            a.commit(Voice::Nature, 6000, 100, 0.95);
        }
        let mut rng = ZenRng::new(3);
        let d = a.query(Voice::Melody, 6000, 1.0, &mut rng);
        assert!(d.allow);
        assert_eq!(d.reason, DecisionReason::SoftLimited);
        assert!((d.density_mul - 0.625).abs() < 1e-9);
        assert!((d.velocity_mul - 0.8).abs() < 1e-9);
    }

    #[test]
    fn stillness_mostly_holds_low_importance() {
        let a = arbiter();
        let mut rng = ZenRng::new(42);
        let mut allowed = 0;
        for i in 0..1000 {
            if a.query(Voice::Chime, (i * 28) % TOTAL, 0.5, &mut rng).allow {
                allowed += 1;
            }
        }
        assert!(allowed > 50 && allowed < 500, "allowed {allowed}");
    }

    #[test]
    fn important_requests_skip_stillness() {
        let a = arbiter();
        let mut rng = ZenRng::new(42);
        for i in 0..200 {
            let d = a.query(Voice::Drone, i * 100, 1.0, &mut rng);
            assert!(d.allow);
            assert!((0.0..=1.0).contains(&d.priority));
        }
    }

    #[test]
    fn reset_clears_bins() {
        let mut a = arbiter();
        a.commit(Voice::Bass, 0, 1000, 3.0);
        a.reset();
        assert_eq!(a.global_density(500), 0.0);
        assert_eq!(a.voice_density(Voice::Bass, 500), 0.0);
    }

    fn expected_movement(phase: PhaseName, tag: BreathTag) -> f64 {
        let (bias, phase_mul): (f64, f64) = match phase {
            PhaseName::Grounding => (0.2, 0.6),
            PhaseName::Immersion => (0.4, 1.0),
            PhaseName::Breakdown => (0.2, 0.3),
            PhaseName::Awakening => (0.8, 1.1),
            PhaseName::Integration => (0.3, 0.5),
        };
        let tag_mul = match tag {
            BreathTag::Peak => 1.1,
            BreathTag::Valley | BreathTag::End => 0.7,
            BreathTag::Free => 1.0,
        };
        ((0.12 + 0.2 * bias) * phase_mul * tag_mul).min(1.0)
    }

    #[test]
    fn movement_follows_phase_and_breath_tag() {
        let a = arbiter();
        let mut rng = ZenRng::new(5);
        let mut seen = std::collections::BTreeSet::new();
        for tick in (0..TOTAL).step_by(60) {
            let d = a.query(Voice::Melody, tick, 0.5, &mut rng);
            let expected = expected_movement(d.phase_name, d.breath_tag);
            assert!(
                (d.movement_ratio - expected).abs() < 1e-12,
                "tick {tick}: {:?}/{:?} gave {} not {expected}",
                d.phase_name,
                d.breath_tag,
                d.movement_ratio
            );
            seen.insert((d.phase_name, d.breath_tag));
        }
        assert_eq!(seen.len(), 5 * 4);

        // Spot values: awakening peak and breakdown valley.
        let d = a.query(Voice::Melody, 19200 + 1920, 0.5, &mut rng);
        assert_eq!((d.phase_name, d.breath_tag), (PhaseName::Awakening, BreathTag::Peak));
        assert!((d.movement_ratio - 0.28 * 1.1 * 1.1).abs() < 1e-12);
        let d = a.query(Voice::Melody, 11520 + 700, 0.5, &mut rng);
        assert_eq!((d.phase_name, d.breath_tag), (PhaseName::Breakdown, BreathTag::Valley));
        assert!((d.movement_ratio - 0.16 * 0.3 * 0.7).abs() < 1e-12);
    }

    #[test]
    fn soft_limits_shrink_movement_by_at_most_half() {
        let free = arbiter()
            .query(Voice::Melody, 6000, 0.5, &mut ZenRng::new(1))
            .movement_ratio;

        // Halfway into the soft band: 25% less movement.
        let mut a = arbiter();
        for _ in 0..3 {
            a.commit(Voice::Nature, 6000, 100, 0.95);
        }
        let d = a.query(Voice::Melody, 6000, 0.5, &mut ZenRng::new(1));
        assert!((d.movement_ratio - 0.75 * free).abs() < 1e-9);

        // At the hard limit the shrink bottoms out at 50%.
        let mut a = arbiter();
        for _ in 0..3 {
            a.commit(Voice::Nature, 6000, 100, 1.15);
        }
        let d = a.query(Voice::Melody, 6000, 0.5, &mut ZenRng::new(1));
        assert!((d.movement_ratio - 0.5 * free).abs() < 1e-9);

        for step in 0..=23 {
            let mut a = arbiter();
            a.commit(Voice::Nature, 6000, 100, 3.0 * f64::from(step) * 0.05);
            let d = a.query(Voice::Melody, 6000, 0.5, &mut ZenRng::new(1));
            let kept = d.movement_ratio / free;
            assert!((0.5 - 1e-9..=1.0 + 1e-9).contains(&kept), "step {step}: {kept}");
        }
    }

    #[test]
    fn huge_window_covers_whole_run() {
        let phases = PhaseMatrix::default();
        let breath = BreathClock::new(480, 2.0, &BreathConfig::default());
        let config = ArbiterConfig {
            window_bins: usize::MAX,
            ..ArbiterConfig::default()
        };
        let mut a = ActivityArbiter::new(&config, &phases, &breath, TOTAL);
        a.commit(Voice::Bass, 0, 120, 240.0);
        assert!((a.global_density(TOTAL - 1) - 1.0).abs() < 1e-12);
        let d = a.query(Voice::Melody, 14_000, 1.0, &mut ZenRng::new(1));
        assert!(d.allow);
    }

    #[test]
    fn normalized_config_falls_back_and_orders_limits() {
        let config = ArbiterConfig {
            bin_size_ticks: 0,
            window_bins: usize::MAX,
            randomness: 3.0,
            hard_global: -1.0,
            soft_global: 5.0,
            soft_voice: 2.0,
            hard_voice: f64::NAN,
            movement_shrink: f64::INFINITY,
            ..ArbiterConfig::default()
        }
        .normalized();
        let d = ArbiterConfig::default();
        assert_eq!(config.bin_size_ticks, d.bin_size_ticks);
        assert_eq!(config.window_bins, MAX_WINDOW_BINS);
        assert_eq!(config.randomness, d.randomness);
        assert_eq!(config.hard_global, d.hard_global);
        assert_eq!(config.soft_global, d.hard_global);
        assert_eq!(config.hard_voice, d.hard_voice);
        assert_eq!(config.soft_voice, d.hard_voice);
        assert_eq!(config.movement_shrink, d.movement_shrink);

        assert_eq!(ArbiterConfig::default().normalized(), ArbiterConfig::default());
    }
}
