// Property tests for the governance core.
//
// Component-level properties run 10,000 cases each. Properties that build a
// whole generation run use a smaller case count.

use neo_zen_core::arbiter::{ActivityArbiter, ArbiterConfig};
use neo_zen_core::breath::{BreathClock, BreathConfig};
use neo_zen_core::guards::SafetyContext;
use neo_zen_core::phase::{PhaseMatrix, PhaseName};
use neo_zen_core::register::{RegisterConfig, RegisterGuard};
use neo_zen_core::safety::{NoteCandidate, SafetyConfig, SafetyPipeline, SafetyTiming};
use neo_zen_core::session::{AuditEntry, GenerationRun};
use neo_zen_core::settings::Settings;
use neo_zen_core::structure::{StructureSegmenter, chord_ticks_for};
use neo_zen_core::theory::Tonality;
use neo_zen_core::tuning::{TuningConfig, TuningPlanner};
use neo_zen_core::voice::Voice;
use neo_zen_core::voices::reference_voices;
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 10_000,
        ..ProptestConfig::default()
    }
}

fn run_config() -> ProptestConfig {
    ProptestConfig {
        cases: 24,
        ..ProptestConfig::default()
    }
}

fn any_voice() -> impl Strategy<Value = Voice> {
    prop::sample::select(
        Voice::CANONICAL
            .iter()
            .copied()
            .chain(std::iter::once(Voice::Generic))
            .collect::<Vec<_>>(),
    )
}

#[test]
fn phase_partition() {
    let matrix = PhaseMatrix::default();
    let phases = matrix.phases();
    assert_eq!(phases[0].start_ratio, 0.0);
    assert_eq!(phases[4].end_ratio, 1.0);
    for w in phases.windows(2) {
        assert_eq!(w[0].end_ratio, w[1].start_ratio);
    }
    assert_eq!(matrix.phase_at(1.0).name, PhaseName::Integration);

    proptest!(proptest_config(), |(ratio in 0.0f64..=1.0)| {
        let hits: Vec<_> = phases
            .iter()
            .filter(|p| {
                p.start_ratio <= ratio
                    && (ratio < p.end_ratio || (ratio == 1.0 && p.end_ratio == 1.0))
            })
            .collect();
        prop_assert_eq!(hits.len(), 1);
        prop_assert_eq!(hits[0].name, matrix.phase_at(ratio).name);
    });
}

#[test]
fn segment_coverage() {
    let matrix = PhaseMatrix::default();
    let chord_ticks = chord_ticks_for(480, 2.0, 2);
    let scripts = prop::option::of(prop::sample::select(vec![
        "C",
        "Am F C G",
        "intro Cmaj7 chorus G:bridge vi IV",
        "| I | V | vi | IV |",
    ]));
    proptest!(proptest_config(), |(total in 1i64..400_000, script in scripts)| {
        let segmenter = StructureSegmenter::new(&matrix, Tonality::default(), chord_ticks);
        let segs = segmenter.build(total, script).unwrap();
        prop_assert!(!segs.is_empty());
        prop_assert_eq!(segs[0].start_tick, 0);
        prop_assert_eq!(segs[segs.len() - 1].end_tick, total);
        for w in segs.windows(2) {
            prop_assert_eq!(w[0].end_tick, w[1].start_tick);
            prop_assert!(w[0].start_tick < w[1].start_tick);
        }
        for s in &segs {
            prop_assert!(!s.is_empty());
            prop_assert!((0.1..=1.0).contains(&s.energy_bias));
            prop_assert_eq!(s.is_breakdown, s.phase_name == PhaseName::Breakdown);
        }
    });
}

#[test]
fn register_clamp_totality() {
    proptest!(proptest_config(), |(
        voice in any_voice(),
        pitch in -50i32..=200,
        shift in -20i32..=20,
    )| {
        let guard = RegisterGuard::new(shift, &RegisterConfig::default());
        let band = guard.band(voice);
        prop_assert!(band.min <= band.max);
        prop_assert!(band.contains(guard.clamp(voice, pitch)));
    });
}

#[test]
fn safety_totality() {
    let note_seq = prop::collection::vec(
        (any_voice(), -50i32..=200, -50i32..=200, 0i64..600),
        1..40,
    );
    proptest!(proptest_config(), |(notes in note_seq)| {
        let mut pipeline = SafetyPipeline::new(
            &SafetyConfig::default(),
            RegisterGuard::default(),
            SafetyTiming { beat_ticks: 480, breath_ticks: 3840 },
        );
        let ctx = SafetyContext::neutral();
        let mut tick = 0;
        for (voice, pitch, velocity, dt) in notes {
            tick += dt;
            let result = pipeline.apply(
                &NoteCandidate { voice, pitch, velocity, tick, duration: 240 },
                &ctx,
            );
            prop_assert!(result.pitch <= 127);
            prop_assert!(result.velocity <= 127);
            if velocity <= 0 {
                prop_assert!(!result.allow);
            }
            if result.allow {
                prop_assert!(result.velocity >= 1);
                prop_assert!(pipeline.register().band(voice).contains(i32::from(result.pitch)));
            }
        }
    });
}

#[test]
fn breath_arithmetic() {
    let clock = BreathClock::new(480, 2.0, &BreathConfig::default());
    assert_eq!(clock.breath_length(), 3840);
    let p = clock.position(3840);
    assert_eq!((p.breath_index, p.phase), (1, 0.0));
    let p = clock.position(5760);
    assert_eq!((p.breath_index, p.phase), (1, 0.5));

    proptest!(proptest_config(), |(tick in 0i64..100_000_000)| {
        let p = clock.position(tick);
        prop_assert!((0.0..1.0).contains(&p.phase));
        let rebuilt = p.breath_index as f64 * 3840.0 + p.phase * 3840.0;
        prop_assert!((rebuilt - tick as f64).abs() < 1e-6 * tick.max(1) as f64);
    });
}

#[test]
fn pure_key_invariance() {
    let planner = TuningPlanner::new(&TuningConfig {
        enable_global_shift: true,
        ..TuningConfig::default()
    });
    proptest!(proptest_config(), |(
        anchors in prop::collection::vec(-100.0f64..2000.0, 0..4),
        ref_a in 400.0f64..480.0,
    )| {
        let plan = planner.plan("C", "major", "pure_key", &anchors, ref_a);
        prop_assert_eq!(plan.planned_semitone_shift, 0.0);
        prop_assert_eq!(plan.global_shift(), 0);
        prop_assert_eq!(plan.drone_anchor_notes, vec![36]);
    });
}

#[test]
fn admission_fairness() {
    let phases = PhaseMatrix::default();
    let breath = BreathClock::new(480, 2.0, &BreathConfig::default());
    let config = ArbiterConfig::default();
    let total = 120 * 100;
    proptest!(proptest_config(), |(
        n in 1usize..50,
        w in 0.01f64..2.0,
        bin in 1i64..99,
        voice in any_voice(),
    )| {
        let mut arbiter = ActivityArbiter::new(&config, &phases, &breath, total);
        let tick = bin * 120;
        for _ in 0..n {
            arbiter.commit(voice, tick, 1, w);
        }
        let expected = n as f64 * w / 3.0;
        prop_assert!((arbiter.global_density(tick) - expected).abs() < 1e-9);
        prop_assert!((arbiter.voice_density(voice, tick) - expected).abs() < 1e-9);
    });
}

#[test]
fn commit_query_causality() {
    proptest!(run_config(), |(seed in any::<u64>(), seconds in 8.0f64..40.0)| {
        let settings = Settings {
            seed,
            total_duration_seconds: seconds,
            ..Settings::default()
        };
        let mut run = GenerationRun::new(&settings).unwrap();
        let mut gens = reference_voices(&settings.voices);
        run.generate(&mut gens);

        let audit = run.audit();
        let mut commits = 0;
        for (i, entry) in audit.iter().enumerate() {
            if let AuditEntry::Commit { voice, admitted_tick, .. } = *entry {
                commits += 1;
                let prior = audit[..i].iter().rev().find_map(|e| match *e {
                    AuditEntry::Query { voice: v, tick, allow } if v == voice => Some((tick, allow)),
                    _ => None,
                });
                prop_assert_eq!(prior, Some((admitted_tick, true)));
            }
        }
        prop_assert_eq!(commits, run.events().len());
    });
}
