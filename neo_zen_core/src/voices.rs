// Reference voice generators.
//
// Small, deliberately plain creative logic for seven voices, enough to drive
// a full run through the governance core and produce a listenable stream.
// Each generator walks its own grid forward in time and goes through the
// same three steps for every note: align to the breath, request admission,
// emit. Moving layers roll their density chance before aligning, so a skipped
// candidate never takes a breath slot. What pitch and rhythm to try is all that differs between them.
//
// Sustained layers (drone, harmony) ask with importance at or above the
// arbiter's stillness exemption so the bed is always present; moving layers
// ask with lower importance and are mostly held back by the stillness gate.

use crate::register::RegisterBand;
use crate::session::{NoteSpec, VoiceContext, VoiceGenerator};
use crate::structure::Segment;
use crate::theory::Chord;
use crate::voice::Voice;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicesConfig {
    /// Voices to generate, by name. Voices without a reference generator
    /// are skipped.
    pub enabled: Vec<String>,
    /// Scales how often the moving voices try to play.
    pub density: f64,
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            enabled: REFERENCE_VOICES.iter().map(|v| v.name().to_string()).collect(),
            density: 1.0,
        }
    }
}

/// Voices that have a reference generator.
pub const REFERENCE_VOICES: [Voice; 7] = [
    Voice::Drone,
    Voice::Bass,
    Voice::Harmony,
    Voice::Melody,
    Voice::Pulse,
    Voice::Chime,
    Voice::Air,
];

/// Build the generators named in `config`, once each.
pub fn reference_voices(config: &VoicesConfig) -> Vec<Box<dyn VoiceGenerator>> {
    let density = if config.density.is_finite() {
        config.density.clamp(0.0, 4.0)
    } else {
        1.0
    };
    let mut seen = Vec::new();
    let mut out: Vec<Box<dyn VoiceGenerator>> = Vec::new();
    for name in &config.enabled {
        let voice = Voice::from_name(name);
        if seen.contains(&voice) {
            continue;
        }
        seen.push(voice);
        let generator: Box<dyn VoiceGenerator> = match voice {
            Voice::Drone => Box::new(DroneVoice),
            Voice::Bass => Box::new(BassVoice),
            Voice::Harmony => Box::new(HarmonyVoice),
            Voice::Melody => Box::new(MelodyVoice {
                density,
                last_pitch: None,
            }),
            Voice::Pulse => Box::new(PulseVoice { density }),
            Voice::Chime => Box::new(ChimeVoice { density }),
            Voice::Air => Box::new(AirVoice),
            _ => {
                debug!(%name, %voice, "no reference generator, skipping");
                continue;
            }
        };
        out.push(generator);
    }
    out
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn chord_of(ctx: &VoiceContext<'_>, seg: &Segment) -> Chord {
    let tonality = ctx.tonality();
    Chord::parse(&seg.chord_symbol, &tonality).unwrap_or_else(|| tonality.diatonic_triad(0))
}

/// The pitch of class `pc` inside `band` nearest to `target`.
fn place(pc: u8, target: i32, band: RegisterBand) -> i32 {
    (band.min..=band.max)
        .filter(|p| p.rem_euclid(12) == i32::from(pc % 12))
        .min_by_key(|p| (p - target).abs())
        .unwrap_or_else(|| band.clamp(target))
}

fn center(band: RegisterBand) -> i32 {
    (band.min + band.max) / 2
}

// ---------------------------------------------------------------------------
// Sustained layers
// ---------------------------------------------------------------------------

/// One long tone per segment on the tuning plan's primary drone note.
#[derive(Debug)]
pub struct DroneVoice;

impl VoiceGenerator for DroneVoice {
    fn voice(&self) -> Voice {
        Voice::Drone
    }

    fn generate(&mut self, ctx: &mut VoiceContext<'_>) {
        let band = ctx.band();
        let drone = i32::from(ctx.plan().primary_drone_note());
        let pitch = place((drone % 12) as u8, drone, band);
        for seg in ctx.segments().to_vec() {
            let at = ctx.align(seg.start_tick);
            if let Some(admission) = ctx.request(at.tick, 1.0) {
                let velocity = admission.scale_velocity(48);
                let _ = ctx.emit(
                    admission,
                    NoteSpec {
                        pitch,
                        velocity,
                        duration_ticks: seg.len(),
                    },
                );
            }
        }
    }
}

/// The chord's triad, voiced upward from the middle of the band.
#[derive(Debug)]
pub struct HarmonyVoice;

impl VoiceGenerator for HarmonyVoice {
    fn voice(&self) -> Voice {
        Voice::Harmony
    }

    fn generate(&mut self, ctx: &mut VoiceContext<'_>) {
        let band = ctx.band();
        for seg in ctx.segments().to_vec() {
            let chord = chord_of(ctx, &seg);
            let at = ctx.align(seg.start_tick);
            let mut target = center(band) - 4;
            for pc in chord.pitch_classes().into_iter().take(3) {
                let pitch = place(pc, target, band);
                target = pitch + 3;
                let Some(admission) = ctx.request(at.tick, 0.95) else {
                    continue;
                };
                let velocity = admission.scale_velocity(44);
                let _ = ctx.emit(
                    admission,
                    NoteSpec {
                        pitch,
                        velocity,
                        duration_ticks: seg.len(),
                    },
                );
            }
        }
    }
}

/// Chord root twice per segment.
#[derive(Debug)]
pub struct BassVoice;

impl VoiceGenerator for BassVoice {
    fn voice(&self) -> Voice {
        Voice::Bass
    }

    fn generate(&mut self, ctx: &mut VoiceContext<'_>) {
        let band = ctx.band();
        for seg in ctx.segments().to_vec() {
            let root = chord_of(ctx, &seg).root_pc;
            let pitch = place(root, band.min + 7, band);
            let half = (seg.len() / 2).max(1);
            let mut tick = seg.start_tick;
            while tick < seg.end_tick {
                let at = ctx.align(tick);
                if let Some(admission) = ctx.request(at.tick, 0.9) {
                    let velocity = admission.scale_velocity(58);
                    let _ = ctx.emit(
                        admission,
                        NoteSpec {
                            pitch,
                            velocity,
                            duration_ticks: half,
                        },
                    );
                }
                tick += half;
            }
        }
    }
}

/// A high, quiet fifth once per breath.
#[derive(Debug)]
pub struct AirVoice;

impl VoiceGenerator for AirVoice {
    fn voice(&self) -> Voice {
        Voice::Air
    }

    fn generate(&mut self, ctx: &mut VoiceContext<'_>) {
        let band = ctx.band();
        let breath = ctx.breath_length();
        let mut tick = 0;
        while tick < ctx.total_ticks() {
            let Some(seg) = ctx.segment_at(tick).cloned() else {
                break;
            };
            let chord = chord_of(ctx, &seg);
            let fifth = chord.pitch_classes().get(2).copied().unwrap_or(chord.root_pc);
            let pitch = place(fifth, band.max - 6, band);
            let at = ctx.align(tick);
            if let Some(admission) = ctx.request(at.tick, 0.5) {
                let velocity = admission.scale_velocity(40);
                let _ = ctx.emit(
                    admission,
                    NoteSpec {
                        pitch,
                        velocity,
                        duration_ticks: breath,
                    },
                );
            }
            tick += breath;
        }
    }
}

// ---------------------------------------------------------------------------
// Moving layers
// ---------------------------------------------------------------------------

/// Stepwise scale walk on a loose beat grid.
#[derive(Debug)]
pub struct MelodyVoice {
    density: f64,
    last_pitch: Option<i32>,
}

impl VoiceGenerator for MelodyVoice {
    fn voice(&self) -> Voice {
        Voice::Melody
    }

    fn generate(&mut self, ctx: &mut VoiceContext<'_>) {
        let band = ctx.band();
        let beat = ctx.ticks_per_beat();
        let lo = band.min.clamp(0, 127) as u8;
        let hi = band.max.clamp(0, 127) as u8;
        let scale: Vec<i32> = ctx
            .tonality()
            .pitches_in_range(lo, hi)
            .into_iter()
            .map(i32::from)
            .collect();
        if scale.is_empty() {
            return;
        }

        let mut tick = 0;
        while tick < ctx.total_ticks() {
            let steps = *ctx.rng().pick(&[1, 2, 2, 3]).unwrap_or(&2);
            let gap = ((steps * beat) as f64 / self.density.max(0.25)).round() as i64;
            let movement = ctx.segment_at(tick).map_or(0.5, |s| s.movement_hint);
            let candidate = tick;
            tick += gap.max(1);

            if !ctx.rng().chance(self.density.min(1.0)) {
                continue;
            }
            let at = ctx.align(candidate);
            let Some(admission) = ctx.request(at.tick, 0.3 + 0.4 * movement) else {
                continue;
            };

            let from = self.last_pitch.unwrap_or(center(band));
            let idx = scale.partition_point(|&p| p < from).min(scale.len() - 1);
            let step = ctx.rng().jitter_i64(2);
            let next = (idx as i64 + step).clamp(0, scale.len() as i64 - 1) as usize;
            let pitch = scale[next];
            let velocity = admission.scale_velocity(72);
            let duration = beat * ctx.rng().range_u64(1, 4) as i64;
            if ctx
                .emit(
                    admission,
                    NoteSpec {
                        pitch,
                        velocity,
                        duration_ticks: duration,
                    },
                )
                .is_ok()
            {
                self.last_pitch = Some(pitch);
            }
        }
    }
}

/// Short chord-root taps on every beat, pulled to the breath peak.
#[derive(Debug)]
pub struct PulseVoice {
    density: f64,
}

impl VoiceGenerator for PulseVoice {
    fn voice(&self) -> Voice {
        Voice::Pulse
    }

    fn generate(&mut self, ctx: &mut VoiceContext<'_>) {
        let band = ctx.band();
        let beat = ctx.ticks_per_beat();
        let mut tick = 0;
        while tick < ctx.total_ticks() {
            let Some(seg) = ctx.segment_at(tick).cloned() else {
                break;
            };
            let root = chord_of(ctx, &seg).root_pc;
            let candidate = tick;
            tick += beat;
            if !ctx.rng().chance(self.density.min(1.0)) {
                continue;
            }
            let at = ctx.align(candidate);
            if let Some(admission) = ctx.request(at.tick, 0.3) {
                let velocity = admission.scale_velocity(60);
                let _ = ctx.emit(
                    admission,
                    NoteSpec {
                        pitch: place(root, center(band), band),
                        velocity,
                        duration_ticks: beat / 2,
                    },
                );
            }
        }
    }
}

/// Occasional high chord tones at the end of a breath.
#[derive(Debug)]
pub struct ChimeVoice {
    density: f64,
}

impl VoiceGenerator for ChimeVoice {
    fn voice(&self) -> Voice {
        Voice::Chime
    }

    fn generate(&mut self, ctx: &mut VoiceContext<'_>) {
        let band = ctx.band();
        let bar = ctx.ticks_per_bar();
        let beat = ctx.ticks_per_beat();
        let mut tick = 0;
        while tick < ctx.total_ticks() {
            let Some(seg) = ctx.segment_at(tick).cloned() else {
                break;
            };
            let candidate = tick;
            tick += bar;
            if !ctx.rng().chance(0.5 * self.density) {
                continue;
            }
            let at = ctx.align(candidate);
            let chord = chord_of(ctx, &seg);
            let pcs = chord.pitch_classes();
            let pc = ctx.rng().pick(&pcs).copied().unwrap_or(chord.root_pc);
            let Some(admission) = ctx.request(at.tick, 0.3) else {
                continue;
            };
            let velocity = admission.scale_velocity(52);
            let ring = ctx.rng().range_f64(1.5, 3.0);
            let _ = ctx.emit(
                admission,
                NoteSpec {
                    pitch: place(pc, center(band) + 6, band),
                    velocity,
                    duration_ticks: (beat as f64 * ring).round() as i64,
                },
            );
        }
    }
}
