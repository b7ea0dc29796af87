// MIDI output from a generation run's event stream.
//
// Converts accepted `NoteEvent`s into a Standard MIDI File (SMF Format 1).
// Track 0 carries the tempo; every voice with at least one note gets its own
// track with a name, a program change and its note on/off pairs. Run ticks
// map one-to-one onto MIDI ticks, so the file's division is the run's ppq.
//
// The tuning plan's global shift is applied here as a transposition and the
// result is clamped back into 0..=127.
//
// Uses the `midly` crate for MIDI writing.

use crate::session::NoteEvent;
use crate::voice::Voice;
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use std::path::Path;

/// Export parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiExport {
    pub ppq: u32,
    pub tempo_bpm: f64,
    /// Semitones added to every pitch.
    pub transpose: i32,
}

/// Convert events to MIDI and write them to a file.
pub fn write_midi(
    events: &[NoteEvent],
    export: &MidiExport,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let smf = events_to_smf(events, export);
    let mut buf = Vec::new();
    smf.write(&mut buf)?;
    std::fs::write(path, &buf)?;
    Ok(())
}

/// Convert events to an in-memory SMF.
pub fn events_to_smf(events: &[NoteEvent], export: &MidiExport) -> Smf<'static> {
    let ppq = export.ppq.clamp(1, 0x7FFF) as u16;
    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(ppq)),
    ));

    let bpm = if export.tempo_bpm.is_finite() && export.tempo_bpm > 0.0 {
        export.tempo_bpm
    } else {
        60.0
    };
    let tempo_us = (60_000_000.0 / bpm).round().clamp(1.0, 0xFF_FFFF as f64) as u32;
    smf.tracks.push(vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(tempo_us))),
        },
        end_of_track(0),
    ]);

    for voice in Voice::CANONICAL.iter().chain(std::iter::once(&Voice::Generic)) {
        let notes: Vec<&NoteEvent> = events.iter().filter(|e| e.voice == *voice).collect();
        if notes.is_empty() {
            continue;
        }
        smf.tracks.push(voice_track(*voice, &notes, export.transpose));
    }

    smf
}

fn end_of_track(delta: u32) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::new(delta),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    }
}

fn voice_track(voice: Voice, notes: &[&NoteEvent], transpose: i32) -> Track<'static> {
    let channel = u4::new(voice.midi_channel() & 0x0F);
    let mut track: Track<'static> = vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(voice.name().as_bytes())),
        },
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::ProgramChange {
                    program: u7::new(voice.midi_program() & 0x7F),
                },
            },
        },
    ];

    // (absolute tick, note-offs sort first, message)
    let mut timeline: Vec<(u32, u8, MidiMessage)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        let key = u7::new((i32::from(note.pitch) + transpose).clamp(0, 127) as u8);
        let start = note.start_tick.max(0) as u32;
        let end = start + note.duration_ticks.max(1) as u32;
        timeline.push((
            start,
            1,
            MidiMessage::NoteOn {
                key,
                vel: u7::new(note.velocity.clamp(1, 127)),
            },
        ));
        timeline.push((
            end,
            0,
            MidiMessage::NoteOff {
                key,
                vel: u7::new(0),
            },
        ));
    }
    timeline.sort_by_key(|(tick, order, _)| (*tick, *order));

    let mut last = 0;
    for (tick, _, message) in timeline {
        track.push(TrackEvent {
            delta: u28::new(tick - last),
            kind: TrackEventKind::Midi { channel, message },
        });
        last = tick;
    }
    track.push(end_of_track(0));
    track
}
