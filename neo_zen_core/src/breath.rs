// Breath clock: maps absolute ticks onto a repeating inhale/exhale cycle.
//
// One breath lasts `breath_cycle_bars` bars of 4/4. A tick's position in its
// breath is a phase in [0, 1), classified into a tag by three configurable
// bands (valley near the start, peak in the middle, end near the close) with
// everything outside the bands tagged `free`.
//
// Voices may ask for their notes to be pulled toward a band center. The pull
// never exceeds `max_shift_ratio` of a breath, and a slot allocator keyed by
// (breath, tag) staggers successive notes landing in the same slot so they do
// not stack on one tick. Slot counts persist until `reset()`.
//
// Ordering precondition: for any one voice, ticks must arrive in
// non-decreasing order between resets. Debug builds assert it.

use crate::voice::Voice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// Classification of a breath phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreathTag {
    Valley,
    Peak,
    End,
    Free,
}

/// How a voice's notes relate to the breath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignMode {
    /// Pull toward the valley center.
    Valley,
    /// Pull toward the peak center.
    Peak,
    /// Pull toward the end center.
    End,
    /// Leave the tick alone; the tag is still reported.
    Follow,
    /// Leave the tick alone.
    Free,
}

impl AlignMode {
    fn target_tag(self) -> Option<BreathTag> {
        match self {
            AlignMode::Valley => Some(BreathTag::Valley),
            AlignMode::Peak => Some(BreathTag::Peak),
            AlignMode::End => Some(BreathTag::End),
            AlignMode::Follow | AlignMode::Free => None,
        }
    }

    /// Built-in rule for a voice when configuration names none.
    pub fn default_for(voice: Voice) -> AlignMode {
        match voice {
            Voice::Pulse => AlignMode::Peak,
            Voice::Melody => AlignMode::Valley,
            Voice::Chime => AlignMode::End,
            Voice::Air | Voice::Drone | Voice::Harmony | Voice::Binaural => AlignMode::Follow,
            _ => AlignMode::Free,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreathConfig {
    /// When false, `align` never moves a tick.
    pub enabled: bool,
    pub valley_center: f64,
    pub peak_center: f64,
    pub end_center: f64,
    /// Full width of each band; a phase matches within center ± width/2.
    pub width: f64,
    /// Largest allowed shift as a fraction of one breath.
    pub max_shift_ratio: f64,
    /// A breath is split into this many slots for collision staggering.
    pub slot_division: u32,
    /// Per-voice rule overrides keyed by voice name (aliases allowed).
    pub rules: BTreeMap<String, AlignMode>,
}

impl Default for BreathConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            valley_center: 0.15,
            peak_center: 0.50,
            end_center: 0.85,
            width: 0.30,
            max_shift_ratio: 0.25,
            slot_division: 64,
            rules: BTreeMap::new(),
        }
    }
}

/// Where a tick sits in the breath cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreathPosition {
    pub breath_index: u64,
    /// Position inside the breath, in [0, 1).
    pub phase: f64,
}

/// Result of aligning one note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub tick: i64,
    pub tag: BreathTag,
    pub breath_index: u64,
}

#[derive(Debug, Clone)]
pub struct BreathClock {
    config: BreathConfig,
    breath_length: i64,
    rules: [AlignMode; Voice::COUNT],
    slots: BTreeMap<(u64, BreathTag), u32>,
    last_tick: [Option<i64>; Voice::COUNT],
}

impl BreathClock {
    pub fn new(ppq: u32, breath_cycle_bars: f64, config: &BreathConfig) -> Self {
        let raw = (breath_cycle_bars * 4.0 * ppq as f64).round();
        let breath_length = if raw.is_finite() { (raw as i64).max(1) } else { 1 };

        let mut rules = [AlignMode::Free; Voice::COUNT];
        for voice in Voice::CANONICAL.iter().chain(std::iter::once(&Voice::Generic)) {
            rules[voice.index()] = AlignMode::default_for(*voice);
        }
        for (name, mode) in &config.rules {
            rules[Voice::from_name(name).index()] = *mode;
        }

        Self {
            config: config.clone(),
            breath_length,
            rules,
            slots: BTreeMap::new(),
            last_tick: [None; Voice::COUNT],
        }
    }

    pub fn breath_length(&self) -> i64 {
        self.breath_length
    }

    pub fn rule(&self, voice: Voice) -> AlignMode {
        self.rules[voice.index()]
    }

    /// Breath index and phase of `tick`. Negative ticks count as 0.
    pub fn position(&self, tick: i64) -> BreathPosition {
        let t = tick.max(0);
        BreathPosition {
            breath_index: (t / self.breath_length) as u64,
            phase: (t % self.breath_length) as f64 / self.breath_length as f64,
        }
    }

    /// Tag of a phase; bands are checked valley, peak, end in that order.
    pub fn phase_tag(&self, phase: f64) -> BreathTag {
        let half = self.config.width * 0.5;
        let in_band = |center: f64| (center - half) <= phase && phase <= (center + half);
        if in_band(self.config.valley_center) {
            BreathTag::Valley
        } else if in_band(self.config.peak_center) {
            BreathTag::Peak
        } else if in_band(self.config.end_center) {
            BreathTag::End
        } else {
            BreathTag::Free
        }
    }

    pub fn tag_at(&self, tick: i64) -> BreathTag {
        self.phase_tag(self.position(tick).phase)
    }

    /// Align using the voice's configured rule.
    pub fn align_default(&mut self, voice: Voice, tick: i64) -> Alignment {
        let mode = self.rule(voice);
        self.align(voice, tick, mode)
    }

    /// Align `tick` for `voice` under `mode`.
    ///
    /// Follow and free never move the tick. Valley, peak and end pull it to
    /// the band center of the same breath, clamped to the maximum shift, then
    /// add the slot offset for earlier notes already placed in that slot.
    pub fn align(&mut self, voice: Voice, tick: i64, mode: AlignMode) -> Alignment {
        self.check_order(voice, tick);

        let pos = self.position(tick);
        let observed = self.phase_tag(pos.phase);
        let target_tag = match mode.target_tag() {
            Some(tag) if self.config.enabled => tag,
            _ => {
                return Alignment {
                    tick,
                    tag: observed,
                    breath_index: pos.breath_index,
                };
            }
        };

        let bl = self.breath_length;
        let center = match target_tag {
            BreathTag::Valley => self.config.valley_center,
            BreathTag::Peak => self.config.peak_center,
            _ => self.config.end_center,
        };
        let max_shift = ((self.config.max_shift_ratio * bl as f64) as i64).max(0);
        let target = pos.breath_index as i64 * bl + (center * bl as f64) as i64;
        let clamped = target.clamp(tick - max_shift, tick + max_shift);

        let count = self.slots.entry((pos.breath_index, target_tag)).or_insert(0);
        let slot_size = bl / self.config.slot_division.max(1) as i64;
        let aligned = (clamped + *count as i64 * slot_size).max(0);
        *count += 1;

        trace!(%voice, tick, aligned, ?target_tag, "breath align");
        Alignment {
            tick: aligned,
            tag: target_tag,
            breath_index: pos.breath_index,
        }
    }

    /// Notes placed into breath slots since the last reset.
    pub fn slots_used(&self) -> u32 {
        self.slots.values().sum()
    }

    /// Clear slot counts and ordering history for a new run.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.last_tick = [None; Voice::COUNT];
    }

    fn check_order(&mut self, voice: Voice, tick: i64) {
        let slot = &mut self.last_tick[voice.index()];
        if let Some(prev) = *slot {
            debug_assert!(tick >= prev, "{voice}: breath align tick {tick} after {prev}");
            if tick < prev {
                warn!(%voice, tick, prev, "breath align called out of tick order");
            }
        }
        *slot = Some(tick.max(slot.unwrap_or(tick)));
    }
}
