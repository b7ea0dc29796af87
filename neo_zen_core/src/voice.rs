// Voice identities: the musical roles that submit notes to the core.
//
// Every stateful component (arbiter bins, breath slots, safety histories) is
// keyed by `Voice`. Names arriving from configuration or from a voice
// generator are normalized here through an alias table, so "pad", "harm" and
// "strings" all land on `Voice::Harmony`, and anything unrecognized lands on
// `Voice::Generic`.
//
// The declared generation order lives here too: within one run voices are
// composed in `GENERATION_ORDER`, so a voice earlier in the list has already
// committed its density by the time a later voice queries the same region.

use serde::{Deserialize, Serialize};

/// One musical role in the piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Voice {
    Drone,
    Bass,
    Harmony,
    Melody,
    Chime,
    Air,
    Handpan,
    Pulse,
    Nature,
    Vocal,
    Binaural,
    /// Fallback for names that match no canonical voice or alias.
    Generic,
}

impl Voice {
    /// The eleven canonical voices (excludes `Generic`).
    pub const CANONICAL: [Voice; 11] = [
        Voice::Drone,
        Voice::Bass,
        Voice::Harmony,
        Voice::Melody,
        Voice::Chime,
        Voice::Air,
        Voice::Handpan,
        Voice::Pulse,
        Voice::Nature,
        Voice::Vocal,
        Voice::Binaural,
    ];

    /// Fixed order in which one generation run composes its voices.
    pub const GENERATION_ORDER: [Voice; 11] = [
        Voice::Melody,
        Voice::Pulse,
        Voice::Harmony,
        Voice::Drone,
        Voice::Air,
        Voice::Chime,
        Voice::Bass,
        Voice::Handpan,
        Voice::Nature,
        Voice::Vocal,
        Voice::Binaural,
    ];

    /// Number of distinct voice slots including `Generic`.
    pub const COUNT: usize = 12;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Voice::Drone => "drone",
            Voice::Bass => "bass",
            Voice::Harmony => "harmony",
            Voice::Melody => "melody",
            Voice::Chime => "chime",
            Voice::Air => "air",
            Voice::Handpan => "handpan",
            Voice::Pulse => "pulse",
            Voice::Nature => "nature",
            Voice::Vocal => "vocal",
            Voice::Binaural => "binaural",
            Voice::Generic => "generic",
        }
    }

    /// Resolve a free-form voice/layer name.
    ///
    /// Case-insensitive; hyphens and spaces count as underscores. Unknown
    /// names resolve to `Generic`.
    pub fn from_name(name: &str) -> Voice {
        let norm: String = name
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        match norm.as_str() {
            "drone" | "drone_low" | "drone_high" => Voice::Drone,
            "bass" | "bass_main" | "kick_bass" | "sub" => Voice::Bass,
            "harmony" | "harm" | "harm_main" | "harm_layer" | "pad" | "strings" => {
                Voice::Harmony
            }
            "melody" | "melody_main" | "lead" | "flute" => Voice::Melody,
            "chime" | "chimes" | "bell" => Voice::Chime,
            "air" | "shimmer" => Voice::Air,
            "handpan" | "hang" => Voice::Handpan,
            "pulse" | "pulse_main" | "kalimba" => Voice::Pulse,
            "nature" | "fx" | "ambient" => Voice::Nature,
            "vocal" | "chant" | "om" => Voice::Vocal,
            "binaural" => Voice::Binaural,
            _ => Voice::Generic,
        }
    }

    /// Weight applied to this voice's own density before admission limits.
    ///
    /// Sustained, quiet textures weigh little; percussive foreground voices
    /// weigh most.
    pub fn energy_weight(self) -> f64 {
        match self {
            Voice::Drone => 0.3,
            Voice::Binaural => 0.3,
            Voice::Nature => 0.4,
            Voice::Air => 0.5,
            Voice::Bass => 0.6,
            Voice::Chime => 0.7,
            Voice::Harmony => 0.8,
            Voice::Vocal => 0.8,
            Voice::Pulse => 0.9,
            Voice::Melody => 1.0,
            Voice::Handpan => 1.2,
            Voice::Generic => 0.7,
        }
    }

    /// MIDI channel used by the export adapter (channel 9 is left to drums).
    pub fn midi_channel(self) -> u8 {
        match self {
            Voice::Melody => 0,
            Voice::Harmony => 1,
            Voice::Drone => 2,
            Voice::Pulse => 3,
            Voice::Bass => 4,
            Voice::Air => 5,
            Voice::Chime => 6,
            Voice::Nature => 7,
            Voice::Vocal => 8,
            Voice::Handpan => 10,
            Voice::Binaural => 11,
            Voice::Generic => 12,
        }
    }

    /// General MIDI program for the export adapter.
    pub fn midi_program(self) -> u8 {
        match self {
            Voice::Melody => 73,   // flute
            Voice::Harmony => 89,  // warm pad
            Voice::Drone => 95,    // sweep pad
            Voice::Pulse => 108,   // kalimba
            Voice::Bass => 32,     // acoustic bass
            Voice::Air => 91,      // choir pad
            Voice::Chime => 14,    // tubular bells
            Voice::Nature => 122,  // seashore
            Voice::Vocal => 52,    // choir aahs
            Voice::Handpan => 114, // steel drums
            Voice::Binaural => 80, // square lead
            Voice::Generic => 0,
        }
    }
}

impl std::fmt::Display for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_normalize_to_canonical_voices() {
        assert_eq!(Voice::from_name("PAD"), Voice::Harmony);
        assert_eq!(Voice::from_name("harm_layer"), Voice::Harmony);
        assert_eq!(Voice::from_name("Lead"), Voice::Melody);
        assert_eq!(Voice::from_name("kick-bass"), Voice::Bass);
        assert_eq!(Voice::from_name(" FX "), Voice::Nature);
        assert_eq!(Voice::from_name("theremin"), Voice::Generic);
        assert_eq!(Voice::from_name(""), Voice::Generic);
    }

    #[test]
    fn canonical_names_round_trip() {
        for voice in Voice::CANONICAL {
            assert_eq!(Voice::from_name(voice.name()), voice);
        }
    }

    #[test]
    fn indices_are_unique_and_dense() {
        let mut seen = [false; Voice::COUNT];
        for voice in Voice::CANONICAL.iter().chain(std::iter::once(&Voice::Generic)) {
            assert!(!seen[voice.index()]);
            seen[voice.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn energy_weights_stay_in_documented_band() {
        for voice in Voice::CANONICAL {
            let w = voice.energy_weight();
            assert!((0.3..=1.2).contains(&w), "{voice}: {w}");
        }
    }

    #[test]
    fn generation_order_covers_every_canonical_voice_once() {
        let mut order = Voice::GENERATION_ORDER.to_vec();
        order.sort();
        let mut canon = Voice::CANONICAL.to_vec();
        canon.sort();
        assert_eq!(order, canon);
    }
}
