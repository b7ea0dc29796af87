// Seeded random source for Neo Zen generation runs.
//
// xoshiro256++ (Blackman & Vigna, 2019) seeded through SplitMix64. The
// composition core must reproduce its decision stream bit-for-bit from a
// single seed, so every random draw in a run (stillness gates, humanization,
// reference voice choices) flows from one `ZenRng` owned by the run's
// orchestration context. Subsystems that need their own stream receive a
// child generator from `fork`, never a generator seeded from ambient state.
//
// **Critical constraint: determinism.** The integer core must not touch
// floating point or any platform-dependent source. Float helpers are derived
// from the integer output with exact power-of-two scaling only.

use serde::{Deserialize, Serialize};

/// Xoshiro256++ state plus the seed it was built from.
///
/// Cloning a `ZenRng` clones its position in the stream; the clone and the
/// original then produce identical sequences.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZenRng {
    s: [u64; 4],
}

impl ZenRng {
    /// Build a generator from a 64-bit seed.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        Self {
            s: [
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
            ],
        }
    }

    /// Derive an independent child stream.
    ///
    /// The child is seeded from the next output of `self` mixed with
    /// `stream`, so forking the same parent state with different stream ids
    /// gives unrelated sequences, and forking advances the parent exactly
    /// once.
    pub fn fork(&mut self, stream: u64) -> ZenRng {
        let base = self.next_u64();
        let mut sm = base ^ stream.wrapping_mul(0xd605_bbb5_8c8a_bd41);
        ZenRng::new(splitmix64(&mut sm))
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3]))
            .rotate_left(23)
            .wrapping_add(self.s[0]);

        let t = self.s[1] << 17;

        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];

        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);

        result
    }

    /// Uniform `f64` in [0, 1) built from the top 53 bits.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform `f64` in `[low, high)`. Returns `low` when the range is empty.
    pub fn range_f64(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        low + self.next_f64() * (high - low)
    }

    /// Uniform integer in `[low, high)` without modulo bias.
    ///
    /// Panics if `low >= high`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        assert!(low < high, "range_u64: low must be less than high");
        let range = high - low;
        if range.is_power_of_two() {
            return low + (self.next_u64() & (range - 1));
        }
        let threshold = range.wrapping_neg() % range;
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return low + (r % range);
            }
        }
    }

    /// Uniform `usize` in `[low, high)`. Panics if `low >= high`.
    pub fn range_usize(&mut self, low: usize, high: usize) -> usize {
        self.range_u64(low as u64, high as u64) as usize
    }

    /// Uniform integer in `[-max, max]`. Zero when `max <= 0`.
    pub fn jitter_i64(&mut self, max: i64) -> i64 {
        if max <= 0 {
            return 0;
        }
        let span = max as u64 * 2 + 1;
        self.range_u64(0, span) as i64 - max
    }

    /// Uniform `f64` in `[-max, max)`. Zero when `max <= 0`.
    pub fn jitter_f64(&mut self, max: f64) -> f64 {
        if max <= 0.0 {
            return 0.0;
        }
        (self.next_f64() * 2.0 - 1.0) * max
    }

    /// `true` with probability `p`; `p <= 0` never fires, `p >= 1` always does.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Pick one element of a non-empty slice. `None` for an empty slice.
    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let idx = self.range_usize(0, items.len());
        items.get(idx)
    }
}

/// SplitMix64 step, used only to expand seeds.
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
