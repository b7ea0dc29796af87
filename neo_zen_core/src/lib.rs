// Neo Zen governance core.
//
// Shared decision layer for procedurally composed ambient and meditation
// music. Voice generators propose notes; this crate decides whether and how
// each one may exist. It provides a narrative energy curve, a breathing
// clock, a tuning planner, per-voice register bands, cross-voice admission
// control and a note safety chain. All of it is driven by one seeded RNG so
// a run is reproducible from its settings.
//
// Architecture:
// - voice.rs: Voice identities, alias table, generation order, MIDI mapping
// - theory.rs: Keys, scales, chord symbol parsing
// - phase.rs: PhaseMatrix, the five-phase energy/movement curve
// - structure.rs: StructureSegmenter, the chord/section timeline
// - breath.rs: BreathClock, breath positions, tags and note alignment
// - tuning.rs: TuningPlanner, anchor frequencies and drone notes
// - register.rs: RegisterGuard, per-voice pitch bands
// - arbiter.rs: ActivityArbiter, density bins and the stillness gate
// - guards.rs: Individual safety stages behind the `NoteGuard` trait
// - safety.rs: SafetyPipeline, the ordered per-note validation chain
// - humanize.rs: Micro timing and velocity imperfection
// - settings.rs: JSON settings with fallback normalization
// - session.rs: GenerationRun, the per-run orchestration context
// - voices.rs: Reference voice generators that exercise the core
// - midi.rs: Standard MIDI File export of the accepted event stream
// - error.rs: Construction errors
//
// The core is deterministic given a seed and single-threaded within a run.

pub mod arbiter;
pub mod breath;
pub mod error;
pub mod guards;
pub mod humanize;
pub mod midi;
pub mod phase;
pub mod register;
pub mod safety;
pub mod session;
pub mod settings;
pub mod structure;
pub mod theory;
pub mod tuning;
pub mod voice;
pub mod voices;
