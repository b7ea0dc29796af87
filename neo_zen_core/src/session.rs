// Generation run: the orchestration context for one piece.
//
// A `GenerationRun` owns every stateful component for the run (breath clock,
// activity arbiter, safety pipeline) together with the timeline, the tuning
// plan, the humanizer and the seeded `ZenRng`. Nothing is shared between
// runs; two runs built from the same settings produce the same events.
//
// Voices plug in through `VoiceGenerator`. The run calls each generator once,
// in `Voice::GENERATION_ORDER`, handing it a `VoiceContext` scoped to that
// voice. Inside, the generator works forward in time:
//
//   1. `ctx.align(tick)` snaps a candidate time to the breath,
//   2. `ctx.request(tick, importance)` asks the arbiter; an admitting
//      decision comes back as an `Admission`,
//   3. `ctx.emit(admission, note)` humanizes the note, clamps its tick into
//      the timeline, runs it through the safety pipeline and, if accepted,
//      commits it to the arbiter and records it.
//
// `Admission` can only be built from an admitting decision and is consumed by
// `emit`, so the arbiter never sees a commit it did not allow. Every query and
// commit is also written to an audit log that tests use to check this.
//
// Each voice draws from its own fork of the run RNG, taken in generation
// order, so the random stream of one voice does not depend on how many draws
// an earlier voice made.
//
// Time only moves forward per voice for the whole run. The last aligned and
// emitted tick of each voice live on the run, not on the context, so a second
// generator for the same voice, or a second `generate` call, continues from
// where that voice stopped. Call `reset` to start over from tick 0.

use crate::arbiter::{ActivityArbiter, ActivityDecision};
use crate::breath::{Alignment, BreathClock, BreathTag};
use crate::error::ConstructionError;
use crate::guards::SafetyContext;
use crate::humanize::Humanizer;
use crate::phase::{PhaseContext, PhaseMatrix};
use crate::register::{RegisterBand, RegisterGuard};
use crate::safety::{NoteCandidate, NoteResult, SafetyPipeline, SafetyTiming};
use crate::settings::Settings;
use crate::structure::{
    Segment, StructureSegmenter, chord_ticks_for, segment_at, simplify_breakdown_harmony,
};
use crate::theory::Tonality;
use crate::tuning::{TuningPlan, TuningPlanner};
use crate::voice::Voice;
use neo_zen_prng::ZenRng;
use tracing::{debug, trace};

/// One accepted note in the run's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NoteEvent {
    pub start_tick: i64,
    pub voice: Voice,
    pub pitch: u8,
    pub velocity: u8,
    pub duration_ticks: i64,
}

/// What a voice wants to play once admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteSpec {
    pub pitch: i32,
    pub velocity: i32,
    pub duration_ticks: i64,
}

/// Permission to emit one note, issued by an admitting arbiter decision.
///
/// Not `Clone`: each admission is spent by exactly one `emit`.
#[derive(Debug)]
#[must_use = "an admission does nothing unless passed to `emit`"]
pub struct Admission {
    voice: Voice,
    tick: i64,
    decision: ActivityDecision,
}

impl Admission {
    pub fn tick(&self) -> i64 {
        self.tick
    }

    pub fn decision(&self) -> &ActivityDecision {
        &self.decision
    }

    /// Scale a base velocity by the decision's velocity multiplier.
    pub fn scale_velocity(&self, base: i32) -> i32 {
        (f64::from(base) * self.decision.velocity_mul).round() as i32
    }
}

/// Per-voice counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceStats {
    pub requested: u32,
    pub admitted: u32,
    pub emitted: u32,
    /// Admitted by the arbiter but refused by the safety pipeline.
    pub refused: u32,
}

/// Entry in the run's audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEntry {
    Query {
        voice: Voice,
        tick: i64,
        allow: bool,
    },
    /// `admitted_tick` is the tick the admission was issued for; `start_tick`
    /// is where the note finally landed.
    Commit {
        voice: Voice,
        admitted_tick: i64,
        start_tick: i64,
    },
}

/// The creative side of a voice.
pub trait VoiceGenerator {
    fn voice(&self) -> Voice;

    /// Compose this voice's notes for the whole run through `ctx`.
    fn generate(&mut self, ctx: &mut VoiceContext<'_>);
}

pub struct GenerationRun {
    settings: Settings,
    plan: TuningPlan,
    phases: PhaseMatrix,
    segments: Vec<Segment>,
    total_ticks: i64,
    breath: BreathClock,
    arbiter: ActivityArbiter,
    safety: SafetyPipeline,
    humanizer: Humanizer,
    rng: ZenRng,
    events: Vec<NoteEvent>,
    stats: [VoiceStats; Voice::COUNT],
    audit: Vec<AuditEntry>,
    cursors: [VoiceCursor; Voice::COUNT],
}

/// Where a voice stands in the run.
#[derive(Debug, Clone, Copy, Default)]
struct VoiceCursor {
    last_align: Option<i64>,
    last_emit: Option<i64>,
    /// Generator passes so far; each pass gets its own RNG stream.
    passes: u64,
}

impl GenerationRun {
    /// Build a run from settings. Settings are normalized first, so only a
    /// timeline that cannot exist is an error.
    pub fn new(settings: &Settings) -> Result<Self, ConstructionError> {
        let settings = settings.normalized();
        let plan = TuningPlanner::new(&settings.tuning).plan(
            &settings.key,
            &settings.scale,
            &settings.tuning_mode,
            &settings.anchors,
            settings.ref_a_hz,
        );

        let phases = PhaseMatrix::new(&settings.phases);
        let total_ticks = settings.total_ticks();
        let chord_ticks = chord_ticks_for(
            settings.ppq,
            settings.breath_cycle_bars,
            settings.breaths_per_chord,
        );
        let mut segments = StructureSegmenter::new(&phases, plan.tonality, chord_ticks)
            .build(total_ticks, settings.chord_script.as_deref())?;
        if settings.simplify_breakdown_harmony {
            simplify_breakdown_harmony(&mut segments, &plan.tonality);
        }

        let breath = BreathClock::new(settings.ppq, settings.breath_cycle_bars, &settings.breath);
        let arbiter = ActivityArbiter::new(&settings.arbiter, &phases, &breath, total_ticks);
        let register = RegisterGuard::new(plan.register_shift, &settings.register);
        let safety = SafetyPipeline::new(
            &settings.safety,
            register,
            SafetyTiming {
                beat_ticks: settings.ticks_per_beat(),
                breath_ticks: breath.breath_length(),
            },
        );
        let humanizer = Humanizer::new(&settings.humanize, settings.ppq, settings.base_tempo);
        let rng = ZenRng::new(settings.seed);

        debug!(
            seed = settings.seed,
            total_ticks,
            segments = segments.len(),
            key = %settings.key,
            scale = %settings.scale,
            "generation run ready"
        );

        Ok(Self {
            settings,
            plan,
            phases,
            segments,
            total_ticks,
            breath,
            arbiter,
            safety,
            humanizer,
            rng,
            events: Vec::new(),
            stats: [VoiceStats::default(); Voice::COUNT],
            audit: Vec::new(),
            cursors: [VoiceCursor::default(); Voice::COUNT],
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn plan(&self) -> &TuningPlan {
        &self.plan
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn total_ticks(&self) -> i64 {
        self.total_ticks
    }

    pub fn arbiter(&self) -> &ActivityArbiter {
        &self.arbiter
    }

    pub fn breath(&self) -> &BreathClock {
        &self.breath
    }

    /// Accepted notes, sorted by start tick. Ties keep generation order.
    pub fn events(&self) -> &[NoteEvent] {
        &self.events
    }

    pub fn stats(&self, voice: Voice) -> VoiceStats {
        self.stats[voice.index()]
    }

    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Run every generator in generation order and return the merged,
    /// tick-sorted event stream.
    ///
    /// Generators sharing a voice run one after another against that voice's
    /// cursor, so their notes merge into one forward-moving stream.
    pub fn generate(&mut self, generators: &mut [Box<dyn VoiceGenerator>]) -> &[NoteEvent] {
        generators.sort_by_key(|g| generation_rank(g.voice()));
        for generator in generators.iter_mut() {
            let voice = generator.voice();
            let cursor = &mut self.cursors[voice.index()];
            let stream = voice.index() as u64 + cursor.passes * Voice::COUNT as u64;
            cursor.passes += 1;
            let mut rng = self.rng.fork(stream);
            let mut ctx = VoiceContext {
                voice,
                run: self,
                rng: &mut rng,
            };
            generator.generate(&mut ctx);
            let s = self.stats[voice.index()];
            debug!(
                %voice,
                requested = s.requested,
                admitted = s.admitted,
                emitted = s.emitted,
                refused = s.refused,
                "voice generated"
            );
        }
        self.events.sort_by_key(|e| e.start_tick);
        &self.events
    }

    /// Clear all run state so the same run can be generated again from its
    /// seed.
    pub fn reset(&mut self) {
        self.breath.reset();
        self.arbiter.reset();
        self.safety.reset();
        self.rng = ZenRng::new(self.settings.seed);
        self.events.clear();
        self.stats = [VoiceStats::default(); Voice::COUNT];
        self.audit.clear();
        self.cursors = [VoiceCursor::default(); Voice::COUNT];
    }
}

fn generation_rank(voice: Voice) -> usize {
    Voice::GENERATION_ORDER
        .iter()
        .position(|v| *v == voice)
        .unwrap_or(Voice::GENERATION_ORDER.len())
}

/// A generator's window onto the run, scoped to one voice.
pub struct VoiceContext<'a> {
    voice: Voice,
    run: &'a mut GenerationRun,
    rng: &'a mut ZenRng,
}

impl VoiceContext<'_> {
    pub fn voice(&self) -> Voice {
        self.voice
    }

    pub fn total_ticks(&self) -> i64 {
        self.run.total_ticks
    }

    pub fn ticks_per_beat(&self) -> i64 {
        self.run.settings.ticks_per_beat()
    }

    pub fn ticks_per_bar(&self) -> i64 {
        self.run.settings.ticks_per_bar()
    }

    pub fn breath_length(&self) -> i64 {
        self.run.breath.breath_length()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.run.segments
    }

    pub fn segment_at(&self, tick: i64) -> Option<&Segment> {
        segment_at(&self.run.segments, tick)
    }

    pub fn tonality(&self) -> Tonality {
        self.run.plan.tonality
    }

    pub fn plan(&self) -> &TuningPlan {
        &self.run.plan
    }

    pub fn phase_context(&self, tick: i64) -> PhaseContext {
        self.run.phases.context_at(tick, self.run.total_ticks)
    }

    /// The voice's register after shift and overrides.
    pub fn band(&self) -> RegisterBand {
        self.run.safety.register().band(self.voice)
    }

    /// This voice's random stream, for creative choices.
    pub fn rng(&mut self) -> &mut ZenRng {
        &mut *self.rng
    }

    /// Align `tick` to the breath under this voice's rule. Ticks earlier than
    /// the voice's previous alignment request are raised to it.
    pub fn align(&mut self, tick: i64) -> Alignment {
        let cursor = &mut self.run.cursors[self.voice.index()];
        let tick = match cursor.last_align {
            Some(prev) => tick.max(prev),
            None => tick.max(0),
        };
        cursor.last_align = Some(tick);
        self.run.breath.align_default(self.voice, tick)
    }

    /// Ask the arbiter whether this voice may act at `tick`.
    pub fn request(&mut self, tick: i64, importance: f64) -> Option<Admission> {
        let voice = self.voice;
        let decision = self.run.arbiter.query(voice, tick, importance, &mut *self.rng);
        let stats = &mut self.run.stats[voice.index()];
        stats.requested += 1;
        self.run.audit.push(AuditEntry::Query {
            voice,
            tick,
            allow: decision.allow,
        });
        if !decision.allow {
            return None;
        }
        stats.admitted += 1;
        Some(Admission {
            voice,
            tick,
            decision,
        })
    }

    /// Humanize, validate and record one admitted note.
    ///
    /// Returns the accepted event, or the safety pipeline's refusal.
    pub fn emit(&mut self, admission: Admission, note: NoteSpec) -> Result<NoteEvent, NoteResult> {
        let voice = self.voice;
        debug_assert_eq!(admission.voice, voice, "admission spent by another voice");
        let total = self.run.total_ticks;

        let phase = self.run.phases.context_at(admission.tick, total).phase;
        let tag: BreathTag = self.run.breath.tag_at(admission.tick);
        let (tick, velocity) = self.run.humanizer.apply(
            voice,
            admission.tick,
            note.velocity,
            phase,
            tag,
            &mut *self.rng,
        );

        let floor = self.run.cursors[voice.index()].last_emit.unwrap_or(0);
        let tick = tick.clamp(floor.min(total - 1), total - 1);
        let duration = note.duration_ticks.clamp(1, (total - tick).max(1));

        let ctx = segment_at(&self.run.segments, tick)
            .map(SafetyContext::from)
            .unwrap_or_else(SafetyContext::neutral);
        let candidate = NoteCandidate {
            voice,
            pitch: note.pitch,
            velocity,
            tick,
            duration,
        };
        let result = self.run.safety.apply(&candidate, &ctx);
        if !result.allow {
            self.run.stats[voice.index()].refused += 1;
            trace!(%voice, tick, reason = ?result.reject, "note refused");
            return Err(result);
        }

        let weight = f64::from(result.velocity) / 127.0;
        self.run.arbiter.commit(voice, tick, result.duration, weight);
        self.run.audit.push(AuditEntry::Commit {
            voice,
            admitted_tick: admission.tick,
            start_tick: tick,
        });
        self.run.cursors[voice.index()].last_emit = Some(tick);
        self.run.stats[voice.index()].emitted += 1;

        let event = NoteEvent {
            start_tick: tick,
            voice,
            pitch: result.pitch,
            velocity: result.velocity,
            duration_ticks: result.duration,
        };
        self.run.events.push(event);
        Ok(event)
    }
}
