// Stateful stages of the note safety chain.
//
// Each stage implements `NoteGuard`: `apply` inspects and may rescale (or
// reject) an in-flight note without changing any state, and `commit` records
// a note only once the whole chain has accepted it. This split keeps a note
// that some later stage rejects from polluting the history of earlier ones.
//
// Stages here, in chain order:
//
// - `StepLimiter`: bounds the velocity change from the voice's previous note.
// - `ShockGuard`: damps large velocity jumps that land within a short window.
// - `DensityGuard`: counts the voice's notes over a breath window.
// - `TimbreGuard`: data-driven, context-sensitive softening rules.
// - `MixEnergyGuard`: caps summed loudness across all voices.
//
// A stage disabled by configuration is replaced by `PassGuard` when the
// pipeline is built.
//
// Histories assume non-decreasing ticks per voice. The mix energy and timbre
// histories are keyed by tick and stay correct when different voices arrive
// out of order relative to each other. Voices are generated one after
// another, so these two histories span the whole run; the timbre history
// only holds notes some rule listens for.

use crate::phase::PhaseName;
use crate::structure::{SectionKind, Segment};
use crate::voice::Voice;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Musical context a note is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyContext {
    pub phase: PhaseName,
    /// Loudness of the surrounding material, usually the segment's energy.
    pub phase_energy: f64,
    pub section: SectionKind,
    pub is_breakdown: bool,
}

impl SafetyContext {
    /// Context with no phase-specific behavior.
    pub fn neutral() -> Self {
        Self {
            phase: PhaseName::Immersion,
            phase_energy: 0.5,
            section: SectionKind::Verse,
            is_breakdown: false,
        }
    }
}

impl From<&Segment> for SafetyContext {
    fn from(seg: &Segment) -> Self {
        Self {
            phase: seg.phase_name,
            phase_energy: seg.energy_bias,
            section: seg.section_kind,
            is_breakdown: seg.is_breakdown,
        }
    }
}

/// A note moving through the chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardNote {
    pub voice: Voice,
    pub pitch: u8,
    pub velocity: f64,
    pub tick: i64,
}

/// Why the chain refused a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The submitted velocity was zero or negative.
    NonPositiveVelocity,
    /// The voice's density window is full and the policy drops excess notes.
    DensityHard,
    /// Scaling drove the velocity to zero.
    Silenced,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardOutcome {
    Pass,
    Reject(RejectReason),
}

pub trait NoteGuard: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Examine `note`, possibly rescaling its velocity. Must not change state.
    fn apply(&self, note: &mut GuardNote, ctx: &SafetyContext) -> GuardOutcome;

    /// Record a note the whole chain accepted.
    fn commit(&mut self, _note: &GuardNote) {}

    /// Forget all history.
    fn reset(&mut self) {}
}

/// Stand-in for a disabled stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassGuard {
    pub label: &'static str,
}

impl NoteGuard for PassGuard {
    fn name(&self) -> &'static str {
        self.label
    }

    fn apply(&self, _note: &mut GuardNote, _ctx: &SafetyContext) -> GuardOutcome {
        GuardOutcome::Pass
    }
}

// ---------------------------------------------------------------------------
// Step limiter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StepLimiter {
    step_up_max: f64,
    step_down_max: f64,
    vel_min: f64,
    last: [Option<f64>; Voice::COUNT],
}

impl StepLimiter {
    pub fn new(step_up_max: f64, step_down_max: f64, vel_min: f64) -> Self {
        Self {
            step_up_max,
            step_down_max,
            vel_min,
            last: [None; Voice::COUNT],
        }
    }
}

impl NoteGuard for StepLimiter {
    fn name(&self) -> &'static str {
        "step_limit"
    }

    fn apply(&self, note: &mut GuardNote, _ctx: &SafetyContext) -> GuardOutcome {
        if let Some(last) = self.last[note.voice.index()] {
            let delta = note.velocity - last;
            if delta > self.step_up_max {
                note.velocity = last + self.step_up_max;
            } else if delta < -self.step_down_max {
                note.velocity = (last - self.step_down_max).max(self.vel_min);
            }
        }
        GuardOutcome::Pass
    }

    fn commit(&mut self, note: &GuardNote) {
        self.last[note.voice.index()] = Some(note.velocity);
    }

    fn reset(&mut self) {
        self.last = [None; Voice::COUNT];
    }
}

// ---------------------------------------------------------------------------
// Shock guard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ShockGuard {
    threshold: f64,
    window_ticks: i64,
    damping: f64,
    last: [Option<(i64, f64)>; Voice::COUNT],
}

impl ShockGuard {
    pub fn new(threshold: f64, window_ticks: i64, damping: f64) -> Self {
        Self {
            threshold,
            window_ticks,
            damping,
            last: [None; Voice::COUNT],
        }
    }
}

impl NoteGuard for ShockGuard {
    fn name(&self) -> &'static str {
        "shock"
    }

    fn apply(&self, note: &mut GuardNote, _ctx: &SafetyContext) -> GuardOutcome {
        if let Some((tick, vel)) = self.last[note.voice.index()] {
            let dt = (note.tick - tick).abs();
            let dv = (note.velocity - vel).abs();
            if dt <= self.window_ticks && dv >= self.threshold {
                note.velocity *= self.damping;
            }
        }
        GuardOutcome::Pass
    }

    fn commit(&mut self, note: &GuardNote) {
        self.last[note.voice.index()] = Some((note.tick, note.velocity));
    }

    fn reset(&mut self) {
        self.last = [None; Voice::COUNT];
    }
}

// ---------------------------------------------------------------------------
// Density guard
// ---------------------------------------------------------------------------

/// What the density guard does with a note once the window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DensityPolicy {
    /// Reject the note.
    #[default]
    Drop,
    /// Keep the note, scaled hard; the pipeline's velocity floor applies.
    Floor,
}

#[derive(Debug, Clone)]
pub struct DensityGuard {
    window_ticks: i64,
    soft: usize,
    hard: usize,
    policy: DensityPolicy,
    events: Vec<VecDeque<i64>>,
}

/// Velocity scale applied under `DensityPolicy::Floor` once the window is full.
const DENSITY_HARD_SCALE: f64 = 0.3;

impl DensityGuard {
    pub fn new(window_ticks: i64, soft: usize, hard: usize, policy: DensityPolicy) -> Self {
        Self {
            window_ticks: window_ticks.max(1),
            soft,
            hard: hard.max(soft + 1),
            policy,
            events: vec![VecDeque::new(); Voice::COUNT],
        }
    }

    /// Notes of `voice` inside the window ending at `tick`.
    pub fn count(&self, voice: Voice, tick: i64) -> usize {
        let cutoff = tick - self.window_ticks;
        self.events[voice.index()]
            .iter()
            .rev()
            .take_while(|&&t| t > cutoff)
            .count()
    }
}

impl NoteGuard for DensityGuard {
    fn name(&self) -> &'static str {
        "density"
    }

    fn apply(&self, note: &mut GuardNote, _ctx: &SafetyContext) -> GuardOutcome {
        let count = self.count(note.voice, note.tick);
        if count <= self.soft {
            return GuardOutcome::Pass;
        }
        if count >= self.hard {
            return match self.policy {
                DensityPolicy::Drop => GuardOutcome::Reject(RejectReason::DensityHard),
                DensityPolicy::Floor => {
                    note.velocity *= DENSITY_HARD_SCALE;
                    GuardOutcome::Pass
                }
            };
        }
        let ratio = (count - self.soft) as f64 / (self.hard - self.soft) as f64;
        note.velocity *= (1.0 - 0.6 * ratio).max(0.4);
        GuardOutcome::Pass
    }

    fn commit(&mut self, note: &GuardNote) {
        let cutoff = note.tick - self.window_ticks;
        let events = &mut self.events[note.voice.index()];
        while events.front().is_some_and(|&t| t <= cutoff) {
            events.pop_front();
        }
        events.push_back(note.tick);
    }

    fn reset(&mut self) {
        self.events.iter_mut().for_each(VecDeque::clear);
    }
}

// ---------------------------------------------------------------------------
// Timbre guard
// ---------------------------------------------------------------------------

/// When a timbre rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimbreCondition {
    /// Context energy strictly above the value.
    EnergyAbove(f64),
    /// Inside the named phase.
    InPhase(PhaseName),
    /// Inside a section of the named kind.
    InSection(SectionKind),
    /// Inside a breakdown segment.
    InBreakdown,
    /// Any one of the listed conditions.
    AnyOf(Vec<TimbreCondition>),
    /// Another voice sounded at or above `min_velocity` within
    /// `within_beats` of this note.
    RecentLoud {
        voice: Voice,
        min_velocity: f64,
        within_beats: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimbreRule {
    pub voice: Voice,
    pub when: TimbreCondition,
    pub scale: f64,
}

/// Built-in rules: airy textures back off at high energy, chimes soften in
/// breakdowns and bridges, pulse ducks under a loud melody.
pub fn default_timbre_rules() -> Vec<TimbreRule> {
    vec![
        TimbreRule {
            voice: Voice::Air,
            when: TimbreCondition::EnergyAbove(0.8),
            scale: 0.8,
        },
        TimbreRule {
            voice: Voice::Chime,
            when: TimbreCondition::AnyOf(vec![
                TimbreCondition::InBreakdown,
                TimbreCondition::InSection(SectionKind::Bridge),
            ]),
            scale: 0.7,
        },
        TimbreRule {
            voice: Voice::Pulse,
            when: TimbreCondition::RecentLoud {
                voice: Voice::Melody,
                min_velocity: 90.0,
                within_beats: 1.0,
            },
            scale: 0.85,
        },
    ]
}

/// Voices some `RecentLoud` condition listens to, with the quietest
/// velocity any of them cares about.
fn watched_voices(cond: &TimbreCondition, out: &mut [Option<f64>; Voice::COUNT]) {
    match cond {
        TimbreCondition::RecentLoud {
            voice,
            min_velocity,
            ..
        } => {
            let slot = &mut out[voice.index()];
            *slot = Some(slot.map_or(*min_velocity, |v| v.min(*min_velocity)));
        }
        TimbreCondition::AnyOf(conds) => {
            for c in conds {
                watched_voices(c, out);
            }
        }
        _ => {}
    }
}

#[derive(Debug, Clone)]
pub struct TimbreGuard {
    rules: Vec<TimbreRule>,
    beat_ticks: i64,
    /// Quietest velocity worth remembering for each watched voice.
    watch: [Option<f64>; Voice::COUNT],
    /// Loudest accepted velocity per tick, for watched voices only. Kept for
    /// the whole run: a voice generated later looks back and ahead in time.
    history: Vec<BTreeMap<i64, f64>>,
}

impl TimbreGuard {
    pub fn new(rules: Vec<TimbreRule>, beat_ticks: i64) -> Self {
        let mut watch = [None; Voice::COUNT];
        for rule in &rules {
            watched_voices(&rule.when, &mut watch);
        }
        Self {
            rules,
            beat_ticks: beat_ticks.max(1),
            watch,
            history: vec![BTreeMap::new(); Voice::COUNT],
        }
    }

    /// Ticks remembered for `voice`.
    pub fn history_len(&self, voice: Voice) -> usize {
        self.history[voice.index()].len()
    }

    fn fires(&self, cond: &TimbreCondition, note: &GuardNote, ctx: &SafetyContext) -> bool {
        match cond {
            TimbreCondition::EnergyAbove(e) => ctx.phase_energy > *e,
            TimbreCondition::InPhase(p) => ctx.phase == *p,
            TimbreCondition::InSection(kind) => ctx.section == *kind,
            TimbreCondition::InBreakdown => ctx.is_breakdown || ctx.phase == PhaseName::Breakdown,
            TimbreCondition::AnyOf(conds) => conds.iter().any(|c| self.fires(c, note, ctx)),
            TimbreCondition::RecentLoud {
                voice,
                min_velocity,
                within_beats,
            } => {
                let w = ((within_beats * self.beat_ticks as f64) as i64).max(0);
                self.history[voice.index()]
                    .range(note.tick - w..=note.tick + w)
                    .any(|(_, &v)| v >= *min_velocity)
            }
        }
    }
}

impl NoteGuard for TimbreGuard {
    fn name(&self) -> &'static str {
        "timbre"
    }

    fn apply(&self, note: &mut GuardNote, ctx: &SafetyContext) -> GuardOutcome {
        for rule in self.rules.iter().filter(|r| r.voice == note.voice) {
            if self.fires(&rule.when, note, ctx) {
                note.velocity *= rule.scale;
            }
        }
        GuardOutcome::Pass
    }

    fn commit(&mut self, note: &GuardNote) {
        match self.watch[note.voice.index()] {
            Some(min) if note.velocity >= min => {}
            _ => return,
        }
        let slot = self.history[note.voice.index()]
            .entry(note.tick)
            .or_insert(0.0);
        *slot = slot.max(note.velocity);
    }

    fn reset(&mut self) {
        self.history.iter_mut().for_each(BTreeMap::clear);
    }
}

// ---------------------------------------------------------------------------
// Mix energy guard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MixEnergyGuard {
    window_ticks: i64,
    max_energy: f64,
    soften: f64,
    floor: f64,
    /// Summed normalized velocity per tick, all voices together.
    energy: BTreeMap<i64, f64>,
}

impl MixEnergyGuard {
    pub fn new(window_ticks: i64, max_energy: f64, soften: f64, floor: f64) -> Self {
        Self {
            window_ticks,
            max_energy,
            soften,
            floor,
            energy: BTreeMap::new(),
        }
    }

    /// Energy already committed in the window ending at `tick`.
    pub fn window_energy(&self, tick: i64) -> f64 {
        self.energy
            .range(tick - self.window_ticks.max(0)..=tick)
            .map(|(_, e)| e)
            .sum()
    }
}

impl NoteGuard for MixEnergyGuard {
    fn name(&self) -> &'static str {
        "mix_energy"
    }

    fn apply(&self, note: &mut GuardNote, _ctx: &SafetyContext) -> GuardOutcome {
        if self.window_ticks <= 0 || self.max_energy <= 0.0 {
            return GuardOutcome::Pass;
        }
        let projected = self.window_energy(note.tick) + (note.velocity / 127.0).clamp(0.0, 1.0);
        if projected > self.max_energy {
            note.velocity = (note.velocity * self.soften).max(self.floor);
        }
        GuardOutcome::Pass
    }

    fn commit(&mut self, note: &GuardNote) {
        *self.energy.entry(note.tick).or_insert(0.0) += (note.velocity / 127.0).clamp(0.0, 1.0);
    }

    fn reset(&mut self) {
        self.energy.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(voice: Voice, velocity: f64, tick: i64) -> GuardNote {
        GuardNote {
            voice,
            pitch: 60,
            velocity,
            tick,
        }
    }

    #[test]
    fn step_limiter_bounds_changes() {
        let mut g = StepLimiter::new(35.0, 80.0, 10.0);
        let ctx = SafetyContext::neutral();
        let mut n = note(Voice::Melody, 120.0, 0);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 120.0);

        g.commit(&note(Voice::Melody, 40.0, 0));
        let mut n = note(Voice::Melody, 120.0, 10);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 75.0);

        g.commit(&note(Voice::Melody, 85.0, 10));
        let mut n = note(Voice::Melody, 1.0, 20);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 10.0);

        // Other voices are independent.
        let mut n = note(Voice::Pulse, 1.0, 20);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 1.0);
    }

    #[test]
    fn shock_damps_only_within_window() {
        let mut g = ShockGuard::new(40.0, 480, 0.6);
        let ctx = SafetyContext::neutral();
        g.commit(&note(Voice::Pulse, 100.0, 0));
        let mut n = note(Voice::Pulse, 50.0, 400);
        g.apply(&mut n, &ctx);
        assert!((n.velocity - 30.0).abs() < 1e-9);
        let mut n = note(Voice::Pulse, 50.0, 481);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 50.0);
        let mut n = note(Voice::Pulse, 70.0, 100);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 70.0);
    }

    #[test]
    fn density_soft_and_hard() {
        let ctx = SafetyContext::neutral();
        let mut g = DensityGuard::new(1000, 2, 4, DensityPolicy::Drop);
        for t in 0..3 {
            g.commit(&note(Voice::Chime, 64.0, t));
        }
        assert_eq!(g.count(Voice::Chime, 3), 3);
        let mut n = note(Voice::Chime, 100.0, 3);
        assert_eq!(g.apply(&mut n, &ctx), GuardOutcome::Pass);
        assert!((n.velocity - 70.0).abs() < 1e-9);

        g.commit(&note(Voice::Chime, 64.0, 3));
        let mut n = note(Voice::Chime, 100.0, 4);
        assert_eq!(
            g.apply(&mut n, &ctx),
            GuardOutcome::Reject(RejectReason::DensityHard)
        );
        // The window slides.
        assert_eq!(g.count(Voice::Chime, 1002), 1);
    }

    #[test]
    fn density_floor_policy_keeps_note() {
        let ctx = SafetyContext::neutral();
        let mut g = DensityGuard::new(1000, 0, 1, DensityPolicy::Floor);
        g.commit(&note(Voice::Air, 64.0, 0));
        let mut n = note(Voice::Air, 100.0, 1);
        assert_eq!(g.apply(&mut n, &ctx), GuardOutcome::Pass);
        assert!((n.velocity - 30.0).abs() < 1e-9);
    }

    #[test]
    fn timbre_default_rules() {
        let mut g = TimbreGuard::new(default_timbre_rules(), 480);
        let mut ctx = SafetyContext::neutral();

        ctx.phase_energy = 0.9;
        let mut n = note(Voice::Air, 100.0, 0);
        g.apply(&mut n, &ctx);
        assert!((n.velocity - 80.0).abs() < 1e-9);

        ctx = SafetyContext::neutral();
        ctx.phase = PhaseName::Breakdown;
        ctx.is_breakdown = true;
        let mut n = note(Voice::Chime, 100.0, 0);
        g.apply(&mut n, &ctx);
        assert!((n.velocity - 70.0).abs() < 1e-9);

        ctx = SafetyContext::neutral();
        g.commit(&note(Voice::Melody, 95.0, 1000));
        let mut n = note(Voice::Pulse, 100.0, 1200);
        g.apply(&mut n, &ctx);
        assert!((n.velocity - 85.0).abs() < 1e-9);
        let mut n = note(Voice::Pulse, 100.0, 3000);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 100.0);
    }

    #[test]
    fn chime_softens_in_bridge_sections() {
        let g = TimbreGuard::new(default_timbre_rules(), 480);
        let ctx = SafetyContext {
            phase: PhaseName::Immersion,
            phase_energy: 0.6,
            section: SectionKind::Bridge,
            is_breakdown: false,
        };
        let mut n = GuardNote {
            voice: Voice::Chime,
            pitch: 80,
            velocity: 100.0,
            tick: 0,
        };
        g.apply(&mut n, &ctx);
        assert!((n.velocity - 70.0).abs() < 1e-9);

        // A bridge inside the breakdown softens once, not twice.
        let ctx = SafetyContext {
            phase: PhaseName::Breakdown,
            is_breakdown: true,
            ..ctx
        };
        let mut n = note(Voice::Chime, 100.0, 0);
        g.apply(&mut n, &ctx);
        assert!((n.velocity - 70.0).abs() < 1e-9);

        // Other sections leave chimes alone.
        let ctx = SafetyContext {
            section: SectionKind::Chorus,
            ..SafetyContext::neutral()
        };
        let mut n = note(Voice::Chime, 100.0, 0);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 100.0);
    }

    #[test]
    fn timbre_history_keeps_only_watched_loud_notes() {
        let mut g = TimbreGuard::new(default_timbre_rules(), 480);
        g.commit(&note(Voice::Melody, 95.0, 0));
        g.commit(&note(Voice::Melody, 60.0, 100));
        g.commit(&note(Voice::Air, 120.0, 100));
        assert_eq!(g.history_len(Voice::Melody), 1);
        assert_eq!(g.history_len(Voice::Air), 0);
    }

    #[test]
    fn timbre_rules_deserialize() {
        let json = r#"[
            { "voice": "bass", "when": { "in_phase": "awakening" }, "scale": 0.5 },
            { "voice": "chime", "when": { "any_of": ["in_breakdown", { "in_section": "bridge" }] }, "scale": 0.7 }
        ]"#;
        let rules: Vec<TimbreRule> = serde_json::from_str(json).unwrap();
        assert_eq!(rules[0].when, TimbreCondition::InPhase(PhaseName::Awakening));
        assert_eq!(rules[1], default_timbre_rules()[1]);
    }

    #[test]
    fn mix_energy_sees_voices_generated_earlier() {
        // Voices run one after another over the whole timeline, so a later
        // voice reads energy an earlier voice committed far behind its last
        // note.
        let ctx = SafetyContext::neutral();
        let mut g = MixEnergyGuard::new(960, 1.5, 0.5, 8.0);
        g.commit(&note(Voice::Drone, 127.0, 100));
        g.commit(&note(Voice::Drone, 127.0, 20_000));
        g.commit(&note(Voice::Harmony, 127.0, 400));
        let mut n = note(Voice::Pulse, 100.0, 500);
        g.apply(&mut n, &ctx);
        assert!((n.velocity - 50.0).abs() < 1e-9);
    }

    #[test]
    fn mix_energy_softens_when_window_full() {
        let ctx = SafetyContext::neutral();
        let mut g = MixEnergyGuard::new(960, 2.0, 0.65, 8.0);
        g.commit(&note(Voice::Melody, 127.0, 100));
        g.commit(&note(Voice::Harmony, 127.0, 500));
        let mut n = note(Voice::Pulse, 100.0, 600);
        g.apply(&mut n, &ctx);
        assert!((n.velocity - 65.0).abs() < 1e-9);

        let mut n = note(Voice::Pulse, 10.0, 600);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 8.0);

        // Out of the trailing window.
        let mut n = note(Voice::Pulse, 100.0, 2000);
        g.apply(&mut n, &ctx);
        assert_eq!(n.velocity, 100.0);
    }
}
