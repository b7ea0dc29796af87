// Hard failures of the composition core.
//
// Only the timeline itself can fail to exist. Every other subsystem is total
// over its input domain: bad settings fall back to defaults (see
// `settings.rs`), and unwanted notes are rejected as values
// (`ActivityDecision::allow`, `NoteResult::allow`), never as errors.

use thiserror::Error;

/// The run cannot proceed because no timeline can be built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    /// The requested length resolves to zero or fewer ticks.
    #[error("timeline length must be positive, got {total_ticks} ticks")]
    NonPositiveLength { total_ticks: i64 },

    /// The chord script tokenized to nothing and no fallback was available.
    #[error("chord source is empty")]
    EmptyChordSource,

    /// One chord would span zero ticks, so the timeline could never advance.
    #[error("chord length resolves to zero ticks")]
    ZeroLengthChord,
}
