// Keys, scales and chord symbols.
//
// The core only needs enough theory to (a) normalize the configured key and
// scale, (b) synthesize a diatonic fallback progression when no chord script
// is given, and (c) let voice generators turn a segment's chord symbol into
// pitch classes. Scales are interval patterns from the tonic in the same
// shape as church-mode tables; chords accept either letter names ("Am7",
// "Fmaj7", "Csus4") or roman numerals relative to the key ("IV", "vi7").
//
// Parsing is forgiving by contract: anything unrecognized returns `None` and
// callers substitute a documented default.

use serde::{Deserialize, Serialize};

/// Pitch-class names used when writing chord symbols.
const PC_NAMES: [&str; 12] = [
    "C", "C#", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B",
];

/// Name of a pitch class (0 = C).
pub fn pc_name(pc: u8) -> &'static str {
    PC_NAMES[(pc % 12) as usize]
}

/// Parse a note name ("C", "f#", "Db", "Bb") into a pitch class.
pub fn parse_pc(name: &str) -> Option<u8> {
    let mut chars = name.trim().chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let base: i16 = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let accidental: i16 = match chars.as_str() {
        "" => 0,
        "#" | "s" | "sharp" => 1,
        "b" | "flat" => -1,
        _ => return None,
    };
    Some((base + accidental).rem_euclid(12) as u8)
}

/// The configured tonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub pc: u8,
}

impl Key {
    pub const C: Key = Key { pc: 0 };

    pub fn new(pc: u8) -> Self {
        Key { pc: pc % 12 }
    }

    pub fn parse(name: &str) -> Option<Key> {
        parse_pc(name).map(Key::new)
    }

    pub fn name(self) -> &'static str {
        pc_name(self.pc)
    }
}

impl Default for Key {
    fn default() -> Self {
        Key::C
    }
}

/// Supported scale types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    #[default]
    Major,
    Minor,
    Dorian,
    Phrygian,
    Lydian,
    Mixolydian,
    PentatonicMajor,
    PentatonicMinor,
}

impl Scale {
    /// Semitone offsets of each degree from the tonic.
    pub fn intervals(self) -> &'static [u8] {
        match self {
            Scale::Major => &[0, 2, 4, 5, 7, 9, 11],
            Scale::Minor => &[0, 2, 3, 5, 7, 8, 10],
            Scale::Dorian => &[0, 2, 3, 5, 7, 9, 10],
            Scale::Phrygian => &[0, 1, 3, 5, 7, 8, 10],
            Scale::Lydian => &[0, 2, 4, 6, 7, 9, 11],
            Scale::Mixolydian => &[0, 2, 4, 5, 7, 9, 10],
            Scale::PentatonicMajor => &[0, 2, 4, 7, 9],
            Scale::PentatonicMinor => &[0, 3, 5, 7, 10],
        }
    }

    /// Seven-note scale used to build triads. Pentatonic scales borrow
    /// their parent mode.
    pub fn harmonic_parent(self) -> Scale {
        match self {
            Scale::PentatonicMajor => Scale::Major,
            Scale::PentatonicMinor => Scale::Minor,
            s => s,
        }
    }

    /// Parse a scale name, including common aliases.
    pub fn parse(name: &str) -> Option<Scale> {
        let norm = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Some(match norm.as_str() {
            "major" | "ionian" | "maj" => Scale::Major,
            "minor" | "aeolian" | "natural_minor" | "min" => Scale::Minor,
            "dorian" => Scale::Dorian,
            "phrygian" => Scale::Phrygian,
            "lydian" => Scale::Lydian,
            "mixolydian" => Scale::Mixolydian,
            "pentatonic" | "pentatonic_major" | "major_pentatonic" => Scale::PentatonicMajor,
            "pentatonic_minor" | "minor_pentatonic" => Scale::PentatonicMinor,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Scale::Major => "major",
            Scale::Minor => "minor",
            Scale::Dorian => "dorian",
            Scale::Phrygian => "phrygian",
            Scale::Lydian => "lydian",
            Scale::Mixolydian => "mixolydian",
            Scale::PentatonicMajor => "pentatonic_major",
            Scale::PentatonicMinor => "pentatonic_minor",
        }
    }
}

/// A key plus a scale: the pitch material of the piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tonality {
    pub key: Key,
    pub scale: Scale,
}

impl Tonality {
    pub fn new(key: Key, scale: Scale) -> Self {
        Tonality { key, scale }
    }

    pub fn contains(&self, pitch: u8) -> bool {
        let offset = (pitch % 12 + 12 - self.key.pc) % 12;
        self.scale.intervals().contains(&offset)
    }

    /// In-scale pitches in `low..=high`.
    pub fn pitches_in_range(&self, low: u8, high: u8) -> Vec<u8> {
        (low..=high).filter(|&p| self.contains(p)).collect()
    }

    /// Nearest in-scale pitch, preferring the lower neighbour on ties.
    pub fn snap(&self, pitch: u8) -> u8 {
        if self.contains(pitch) {
            return pitch;
        }
        for offset in 1u8..=6 {
            if pitch >= offset && self.contains(pitch - offset) {
                return pitch - offset;
            }
            if pitch <= 127 - offset && self.contains(pitch + offset) {
                return pitch + offset;
            }
        }
        pitch
    }

    /// Triad built on a scale degree of the harmonic parent scale.
    pub fn diatonic_triad(&self, degree: usize) -> Chord {
        let iv = self.scale.harmonic_parent().intervals();
        let n = iv.len();
        let at = |d: usize| -> u8 { iv[d % n] + if d >= n { 12 } else { 0 } };
        let root = at(degree % n);
        let third = at(degree % n + 2) - root;
        let fifth = at(degree % n + 4) - root;
        let quality = match (third, fifth) {
            (3, 6) => ChordQuality::Diminished,
            (4, 8) => ChordQuality::Augmented,
            (3, _) => ChordQuality::Minor,
            _ => ChordQuality::Major,
        };
        Chord {
            root_pc: (self.key.pc + root) % 12,
            quality,
            seventh: None,
            add_ninth: false,
        }
    }

    /// Two-chord fallback progression (tonic, then subdominant).
    pub fn fallback_progression(&self) -> [Chord; 2] {
        [self.diatonic_triad(0), self.diatonic_triad(3)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChordQuality {
    Major,
    Minor,
    Diminished,
    Augmented,
    Sus2,
    Sus4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seventh {
    Major,
    Minor,
}

/// A parsed chord symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chord {
    pub root_pc: u8,
    pub quality: ChordQuality,
    pub seventh: Option<Seventh>,
    pub add_ninth: bool,
}

impl Chord {
    /// Parse a letter-name or roman-numeral chord symbol.
    pub fn parse(symbol: &str, tonality: &Tonality) -> Option<Chord> {
        let s = symbol.trim();
        let first = s.chars().next()?;
        if !first.is_ascii_alphabetic() {
            return None;
        }
        let (root_pc, minor_from_case, rest) = if matches!(first.to_ascii_uppercase(), 'I' | 'V') {
            let numeral_len = s
                .chars()
                .take_while(|c| matches!(c, 'I' | 'V' | 'i' | 'v'))
                .count();
            let numeral = &s[..numeral_len];
            let degree = match numeral.to_ascii_uppercase().as_str() {
                "I" => 0,
                "II" => 1,
                "III" => 2,
                "IV" => 3,
                "V" => 4,
                "VI" => 5,
                "VII" => 6,
                _ => return None,
            };
            let iv = tonality.scale.harmonic_parent().intervals();
            let pc = (tonality.key.pc + iv[degree % iv.len()]) % 12;
            let lower = numeral.chars().all(|c| c.is_ascii_lowercase());
            (pc, lower, &s[numeral_len..])
        } else {
            let mut root_len = 1;
            if let Some(acc) = s[1..].chars().next() {
                if acc == '#' || acc == 'b' {
                    root_len = 2;
                }
            }
            let pc = parse_pc(&s[..root_len])?;
            (pc, false, &s[root_len..])
        };

        let mut quality = if minor_from_case {
            ChordQuality::Minor
        } else {
            ChordQuality::Major
        };
        let mut seventh = None;
        let mut add_ninth = false;
        let mut rest = rest;

        while !rest.is_empty() {
            if let Some(r) = rest.strip_prefix("maj7") {
                seventh = Some(Seventh::Major);
                rest = r;
            } else if let Some(r) = rest.strip_prefix("maj") {
                quality = ChordQuality::Major;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("min") {
                quality = ChordQuality::Minor;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("dim").or_else(|| rest.strip_prefix('°')) {
                quality = ChordQuality::Diminished;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("aug").or_else(|| rest.strip_prefix('+')) {
                quality = ChordQuality::Augmented;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("sus2") {
                quality = ChordQuality::Sus2;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("sus4").or_else(|| rest.strip_prefix("sus")) {
                quality = ChordQuality::Sus4;
                rest = r;
            } else if let Some(r) = rest.strip_prefix("add9") {
                add_ninth = true;
                rest = r;
            } else if let Some(r) = rest.strip_prefix('m') {
                quality = ChordQuality::Minor;
                rest = r;
            } else if let Some(r) = rest.strip_prefix('7') {
                seventh.get_or_insert(Seventh::Minor);
                rest = r;
            } else if let Some(r) = rest.strip_prefix('9') {
                seventh.get_or_insert(Seventh::Minor);
                add_ninth = true;
                rest = r;
            } else {
                return None;
            }
        }

        Some(Chord {
            root_pc,
            quality,
            seventh,
            add_ninth,
        })
    }

    /// Semitone offsets of the chord tones from the root.
    pub fn intervals(&self) -> Vec<u8> {
        let mut out: Vec<u8> = match self.quality {
            ChordQuality::Major => vec![0, 4, 7],
            ChordQuality::Minor => vec![0, 3, 7],
            ChordQuality::Diminished => vec![0, 3, 6],
            ChordQuality::Augmented => vec![0, 4, 8],
            ChordQuality::Sus2 => vec![0, 2, 7],
            ChordQuality::Sus4 => vec![0, 5, 7],
        };
        match self.seventh {
            Some(Seventh::Major) => out.push(11),
            Some(Seventh::Minor) => out.push(10),
            None => {}
        }
        if self.add_ninth {
            out.push(14);
        }
        out
    }

    /// Pitch classes of the chord tones, root first.
    pub fn pitch_classes(&self) -> Vec<u8> {
        self.intervals()
            .into_iter()
            .map(|iv| (self.root_pc + iv) % 12)
            .collect()
    }

    /// Letter-name symbol of the full chord.
    pub fn symbol(&self) -> String {
        let mut out = self.triad_symbol();
        match (self.quality, self.seventh) {
            (ChordQuality::Major, Some(Seventh::Major)) => out.push_str("maj7"),
            (_, Some(Seventh::Major)) => out.push_str("(maj7)"),
            (_, Some(Seventh::Minor)) => out.push('7'),
            (_, None) => {}
        }
        if self.add_ninth {
            out.push_str("add9");
        }
        out
    }

    /// Bare triad symbol: extensions dropped, suspensions resolved to major.
    pub fn triad_symbol(&self) -> String {
        let suffix = match self.quality {
            ChordQuality::Minor => "m",
            ChordQuality::Diminished => "dim",
            ChordQuality::Augmented => "aug",
            ChordQuality::Major | ChordQuality::Sus2 | ChordQuality::Sus4 => "",
        };
        format!("{}{}", pc_name(self.root_pc), suffix)
    }
}
