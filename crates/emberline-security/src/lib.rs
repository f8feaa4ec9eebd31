pub mod directive;
pub mod postprocess;
pub mod spam;
pub mod tags;

pub use directive::{DirectiveAttempt, GuardVerdict, evaluate_directive};
pub use postprocess::{
    TRANSPORT_LIMIT, chunk_message, detect_runaway_repetition, is_mass_mention, sanitize_response,
    truncate_sentences,
};
pub use spam::{SpamDetector, SpamVerdict};
