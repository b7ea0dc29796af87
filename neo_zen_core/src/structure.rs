// Structure generation: the chord/section timeline for a piece.
//
// Before any voice emits a note, the run lays out a gap-free sequence of
// segments covering [0, total_ticks). Each segment holds one chord for
// `breaths_per_chord` breaths and knows which section (intro, verse, chorus,
// bridge, outro) and which narrative phase it belongs to.
//
// The chord source is either a user script or, when none is given, a
// two-chord diatonic fallback (I and IV, or i and iv in minor). The token
// list repeats until the timeline is full and the last segment is cut to end
// exactly at `total_ticks`.
//
// Script grammar: tokens separated by whitespace, commas or bars. A token is
// a chord symbol, optionally tagged `chord:section`, or a bare section tag
// (`chorus`, `[bridge]`) that applies to the chords after it. Untagged chords
// start in verse.
//
// Segments are read-only to voices. The optional harmonic-simplification
// pass only rewrites `chord_symbol` of breakdown segments.

use crate::error::ConstructionError;
use crate::phase::{PhaseMatrix, PhaseName};
use crate::theory::{Chord, Tonality};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Section of the song form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Intro,
    #[default]
    Verse,
    Chorus,
    Bridge,
    Outro,
}

impl SectionKind {
    /// Nominal loudness of the section before phase blending.
    pub fn energy(self) -> f64 {
        match self {
            SectionKind::Intro => 0.3,
            SectionKind::Verse => 0.5,
            SectionKind::Chorus => 0.8,
            SectionKind::Bridge => 0.6,
            SectionKind::Outro => 0.3,
        }
    }

    /// Parse a section tag, with or without surrounding brackets.
    pub fn parse(tag: &str) -> Option<SectionKind> {
        let t = tag
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        Some(match t.as_str() {
            "intro" => SectionKind::Intro,
            "verse" => SectionKind::Verse,
            "chorus" => SectionKind::Chorus,
            "bridge" => SectionKind::Bridge,
            "outro" => SectionKind::Outro,
            _ => return None,
        })
    }
}

/// One chord of the script with the section it falls in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChordToken {
    pub chord: String,
    pub section: SectionKind,
}

/// A contiguous span of the timeline holding one chord.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_tick: i64,
    pub end_tick: i64,
    pub chord_symbol: String,
    pub section_kind: SectionKind,
    pub energy_bias: f64,
    pub phase_name: PhaseName,
    pub movement_hint: f64,
    pub stillness_hint: f64,
    pub is_breakdown: bool,
}

impl Segment {
    pub fn len(&self) -> i64 {
        self.end_tick - self.start_tick
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    pub fn contains(&self, tick: i64) -> bool {
        tick >= self.start_tick && tick < self.end_tick
    }
}

/// Split a chord script into tokens.
pub fn tokenize(script: &str) -> Vec<ChordToken> {
    let mut current = SectionKind::Verse;
    let mut out = Vec::new();
    for raw in script.split(|c: char| c.is_whitespace() || c == ',' || c == '|') {
        if raw.is_empty() {
            continue;
        }
        if let Some(section) = SectionKind::parse(raw) {
            current = section;
            continue;
        }
        match raw.split_once(':') {
            Some((chord, tag)) => {
                if let Some(section) = SectionKind::parse(tag) {
                    current = section;
                }
                if !chord.is_empty() {
                    out.push(ChordToken {
                        chord: chord.to_string(),
                        section: current,
                    });
                }
            }
            None => out.push(ChordToken {
                chord: raw.to_string(),
                section: current,
            }),
        }
    }
    out
}

/// Ticks one chord lasts: breaths per chord × bars per breath × 4 beats.
pub fn chord_ticks_for(ppq: u32, breath_cycle_bars: f64, breaths_per_chord: u32) -> i64 {
    let raw = (breaths_per_chord as f64 * breath_cycle_bars * 4.0 * ppq as f64).round();
    if raw.is_finite() && raw > 0.0 { raw as i64 } else { 0 }
}

pub struct StructureSegmenter<'a> {
    phases: &'a PhaseMatrix,
    tonality: Tonality,
    chord_ticks: i64,
}

impl<'a> StructureSegmenter<'a> {
    pub fn new(phases: &'a PhaseMatrix, tonality: Tonality, chord_ticks: i64) -> Self {
        Self {
            phases,
            tonality,
            chord_ticks,
        }
    }

    /// Build the segment list for a timeline of `total_ticks`.
    ///
    /// Fails only when the timeline cannot exist: a non-positive length, a
    /// script with no chords, or a chord that would span zero ticks.
    pub fn build(
        &self,
        total_ticks: i64,
        chord_script: Option<&str>,
    ) -> Result<Vec<Segment>, ConstructionError> {
        if total_ticks <= 0 {
            return Err(ConstructionError::NonPositiveLength { total_ticks });
        }
        if self.chord_ticks <= 0 {
            return Err(ConstructionError::ZeroLengthChord);
        }

        let tokens = match chord_script {
            Some(script) => tokenize(script),
            None => self
                .tonality
                .fallback_progression()
                .iter()
                .map(|c| ChordToken {
                    chord: c.symbol(),
                    section: SectionKind::Verse,
                })
                .collect(),
        };
        if tokens.is_empty() {
            return Err(ConstructionError::EmptyChordSource);
        }

        let mut segments = Vec::new();
        let mut start = 0;
        for token in tokens.iter().cycle() {
            if start >= total_ticks {
                break;
            }
            let end = (start + self.chord_ticks).min(total_ticks);
            segments.push(self.annotate(start, end, total_ticks, token));
            start = end;
        }

        debug!(
            segments = segments.len(),
            chords = tokens.len(),
            total_ticks,
            "structure built"
        );
        Ok(segments)
    }

    fn annotate(&self, start: i64, end: i64, total_ticks: i64, token: &ChordToken) -> Segment {
        let mid = (start + end) as f64 / 2.0 / total_ticks as f64;
        let phase = self.phases.phase_at(mid);

        let mut energy =
            (0.5 * token.section.energy() + 0.5 * phase.base_energy).clamp(0.1, 1.0);
        match phase.name {
            PhaseName::Awakening => energy *= 1.1,
            PhaseName::Breakdown => energy *= 0.7,
            _ => {}
        }

        Segment {
            start_tick: start,
            end_tick: end,
            chord_symbol: token.chord.clone(),
            section_kind: token.section,
            energy_bias: energy.clamp(0.1, 1.0),
            phase_name: phase.name,
            movement_hint: phase.movement_bias,
            stillness_hint: 1.0 - phase.movement_bias,
            is_breakdown: phase.name == PhaseName::Breakdown,
        }
    }
}

/// Strip extensions from breakdown chords, leaving the bare triad.
///
/// Symbols that do not parse are left untouched.
pub fn simplify_breakdown_harmony(segments: &mut [Segment], tonality: &Tonality) {
    for seg in segments.iter_mut().filter(|s| s.is_breakdown) {
        if let Some(chord) = Chord::parse(&seg.chord_symbol, tonality) {
            seg.chord_symbol = chord.triad_symbol();
        }
    }
}

/// Segment containing `tick`, or the last segment for ticks past the end.
pub fn segment_at(segments: &[Segment], tick: i64) -> Option<&Segment> {
    let idx = segments.partition_point(|s| s.end_tick <= tick);
    segments.get(idx).or_else(|| segments.last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theory::{Key, Scale};

    const CHORD: i64 = 7680;

    fn build(total: i64, script: Option<&str>) -> Result<Vec<Segment>, ConstructionError> {
        let phases = PhaseMatrix::default();
        StructureSegmenter::new(&phases, Tonality::default(), CHORD).build(total, script)
    }

    #[test]
    fn tokenize_sections() {
        let tokens = tokenize("C G, [chorus] Am | F:bridge G");
        let got: Vec<(&str, SectionKind)> =
            tokens.iter().map(|t| (t.chord.as_str(), t.section)).collect();
        assert_eq!(
            got,
            vec![
                ("C", SectionKind::Verse),
                ("G", SectionKind::Verse),
                ("Am", SectionKind::Chorus),
                ("F", SectionKind::Bridge),
                ("G", SectionKind::Bridge),
            ]
        );
        assert!(tokenize("  , | intro outro ").is_empty());
    }

    #[test]
    fn chord_ticks_from_breaths() {
        assert_eq!(chord_ticks_for(480, 2.0, 2), 7680);
        assert_eq!(chord_ticks_for(480, 2.0, 0), 0);
        assert_eq!(chord_ticks_for(480, f64::NAN, 2), 0);
    }

    #[test]
    fn fallback_covers_timeline() {
        let segs = build(28800, None).unwrap();
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].start_tick, 0);
        assert_eq!(segs.last().unwrap().end_tick, 28800);
        for w in segs.windows(2) {
            assert_eq!(w[0].end_tick, w[1].start_tick);
        }
        let chords: Vec<&str> = segs.iter().map(|s| s.chord_symbol.as_str()).collect();
        assert_eq!(chords, vec!["C", "F", "C", "F"]);
        assert_eq!(segs[3].len(), 28800 - 3 * CHORD);
    }

    #[test]
    fn minor_fallback() {
        let phases = PhaseMatrix::default();
        let t = Tonality::new(Key::new(9), Scale::Minor);
        let segs = StructureSegmenter::new(&phases, t, CHORD).build(CHORD * 2, None).unwrap();
        assert_eq!(segs[0].chord_symbol, "Am");
        assert_eq!(segs[1].chord_symbol, "Dm");
    }

    #[test]
    fn construction_errors() {
        assert_eq!(
            build(0, None),
            Err(ConstructionError::NonPositiveLength { total_ticks: 0 })
        );
        assert_eq!(build(100, Some(" | ")), Err(ConstructionError::EmptyChordSource));
        let phases = PhaseMatrix::default();
        let seg = StructureSegmenter::new(&phases, Tonality::default(), 0);
        assert_eq!(seg.build(100, None), Err(ConstructionError::ZeroLengthChord));
    }

    #[test]
    fn phase_annotations() {
        let segs = build(CHORD * 10, Some("Cmaj7 Fadd9 G Am7")).unwrap();
        for s in &segs {
            assert!((0.1..=1.0).contains(&s.energy_bias));
            assert!((s.movement_hint + s.stillness_hint - 1.0).abs() < 1e-12);
            assert_eq!(s.is_breakdown, s.phase_name == PhaseName::Breakdown);
        }
        // Midpoint of segment 4 is 0.45: breakdown. Verse 0.5, phase 0.3.
        assert_eq!(segs[4].phase_name, PhaseName::Breakdown);
        assert!((segs[4].energy_bias - 0.4 * 0.7).abs() < 1e-12);
        // Midpoint of segment 6 is 0.65: awakening.
        assert_eq!(segs[6].phase_name, PhaseName::Awakening);
        assert!((segs[6].energy_bias - 0.65 * 1.1).abs() < 1e-12);
    }

    #[test]
    fn breakdown_harmony_is_simplified() {
        let mut segs = build(CHORD * 10, Some("Cmaj7 Fadd9 Gsus4 Am7")).unwrap();
        simplify_breakdown_harmony(&mut segs, &Tonality::default());
        assert_eq!(segs[4].chord_symbol, "C");
        assert_eq!(segs[5].chord_symbol, "F");
        assert_eq!(segs[6].chord_symbol, "Gsus4");
        assert_eq!(segs[0].chord_symbol, "Cmaj7");
    }

    #[test]
    fn segment_lookup() {
        let segs = build(CHORD * 3, None).unwrap();
        assert_eq!(segment_at(&segs, 0).unwrap().start_tick, 0);
        assert_eq!(segment_at(&segs, CHORD).unwrap().start_tick, CHORD);
        assert_eq!(segment_at(&segs, CHORD * 5).unwrap().start_tick, CHORD * 2);
        assert!(segment_at(&[], 0).is_none());
    }
}
