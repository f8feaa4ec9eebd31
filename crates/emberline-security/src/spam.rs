use std::collections::HashMap;

use tracing::debug;

/// Streak length at which an exact repeat stops getting responses.
pub const SPAM_THRESHOLD: u32 = 3;

const GREETINGS: [&str; 11] = [
    "hi", "hii", "hiii", "hey", "hello", "heyyy", "yo", "sup", "wsp", "helo", "henlo",
];
const ACKS: [&str; 12] = [
    "ok", "okay", "k", "kk", "kkk", "yes", "yeah", "yea", "ye", "no", "nah", "nope",
];
const LAUGHTER: [&str; 7] = ["lol", "lmao", "haha", "hahaha", "lmfao", "xd", "xdd"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamVerdict {
    /// Unrelated message; streak rebased.
    Clean,
    /// Repeat streak in progress; respond but annotate the prompt so the
    /// model calls the repetition out.
    Flag { streak: u32 },
    /// Exact repeat at the threshold; drop the message without responding.
    Suppress { streak: u32 },
}

#[derive(Debug, Default)]
struct SpamState {
    last_message: String,
    count: u32,
}

/// Tracks per-user repeat streaks over normalized message text.
#[derive(Debug, Default)]
pub struct SpamDetector {
    states: HashMap<String, SpamState>,
}

impl SpamDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, user_id: &str, content: &str) -> SpamVerdict {
        let normalized = content.trim().to_lowercase();
        let state = self.states.entry(user_id.to_string()).or_default();

        if !state.last_message.is_empty() && normalized == state.last_message {
            state.count += 1;
            debug!(user = user_id, streak = state.count, "exact repeat");
            if state.count >= SPAM_THRESHOLD {
                return SpamVerdict::Suppress { streak: state.count };
            }
            return SpamVerdict::Flag { streak: state.count };
        }

        if !state.last_message.is_empty() && same_bucket(&normalized, &state.last_message) {
            state.count += 1;
            state.last_message = normalized;
            debug!(user = user_id, streak = state.count, "near-duplicate repeat");
            // Near-duplicates never suppress, the model just gets told.
            return SpamVerdict::Flag { streak: state.count };
        }

        state.last_message = normalized;
        state.count = 1;
        SpamVerdict::Clean
    }

    pub fn reset(&mut self, user_id: &str) {
        self.states.remove(user_id);
    }
}

fn same_bucket(a: &str, b: &str) -> bool {
    for bucket in [&GREETINGS[..], &ACKS[..], &LAUGHTER[..]] {
        if bucket.contains(&a) && bucket.contains(&b) {
            return true;
        }
    }
    // Two consecutive very short messages count as equivalent noise.
    a.chars().count() <= 3 && b.chars().count() <= 3
}
