//! Splits a streamed response into its thinking and final-answer segments.
//!
//! Thinking models wrap their visible reasoning in `<think>`/`</think>`
//! markers. Text between the markers is transient reasoning for progress
//! display; text after the closing marker (or the whole stream when no
//! markers appear) is the answer that actually gets delivered and persisted.

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSegment {
    Thinking(String),
    Answer(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutcome {
    pub thinking: String,
    pub answer: String,
}

/// Incremental marker-aware splitter. Feed chunks with [`push`], collect the
/// emitted segments, and call [`finish`] for the consolidated result.
///
/// A tail that could still grow into a marker (`<thi` at a chunk boundary)
/// is held back until the next chunk settles it, so markers are never
/// half-emitted.
///
/// [`push`]: ThinkingSplitter::push
/// [`finish`]: ThinkingSplitter::finish
#[derive(Debug, Default)]
pub struct ThinkingSplitter {
    buffer: String,
    emitted_thinking: usize,
    emitted_answer: usize,
}

struct Regions {
    thinking: String,
    answer: String,
    opened: bool,
    closed: bool,
}

impl ThinkingSplitter {
    pub fn push(&mut self, chunk: &str) -> Vec<StreamSegment> {
        self.buffer.push_str(chunk);
        let regions = split_regions(&self.buffer);

        let thinking_safe = if regions.closed {
            regions.thinking.len()
        } else {
            regions.thinking.len() - holdback(&regions.thinking, THINK_CLOSE)
        };
        let answer_safe = if regions.opened {
            regions.answer.len()
        } else {
            regions.answer.len() - holdback(&regions.answer, THINK_OPEN)
        };

        let mut segments = Vec::new();
        if thinking_safe > self.emitted_thinking {
            segments.push(StreamSegment::Thinking(
                regions.thinking[self.emitted_thinking..thinking_safe].to_string(),
            ));
            self.emitted_thinking = thinking_safe;
        }
        if answer_safe > self.emitted_answer {
            segments.push(StreamSegment::Answer(
                regions.answer[self.emitted_answer..answer_safe].to_string(),
            ));
            self.emitted_answer = answer_safe;
        }
        segments
    }

    pub fn finish(self) -> SplitOutcome {
        let regions = split_regions(&self.buffer);
        let thinking = regions.thinking.trim().to_string();
        let answer = regions.answer.trim().to_string();

        // A stream that never made it past its markers still owes the caller
        // something readable.
        if answer.is_empty() && !thinking.is_empty() {
            return SplitOutcome {
                thinking: String::new(),
                answer: thinking,
            };
        }

        SplitOutcome { thinking, answer }
    }
}

fn split_regions(buffer: &str) -> Regions {
    match buffer.find(THINK_OPEN) {
        None => Regions {
            thinking: String::new(),
            answer: buffer.to_string(),
            opened: false,
            closed: false,
        },
        Some(open) => {
            let pre = &buffer[..open];
            let rest = &buffer[open + THINK_OPEN.len()..];
            match rest.find(THINK_CLOSE) {
                Some(close) => Regions {
                    thinking: rest[..close].to_string(),
                    answer: format!("{pre}{}", &rest[close + THINK_CLOSE.len()..]),
                    opened: true,
                    closed: true,
                },
                None => Regions {
                    thinking: rest.to_string(),
                    answer: pre.to_string(),
                    opened: true,
                    closed: false,
                },
            }
        }
    }
}

/// Length of the longest suffix of `s` that is a proper prefix of `marker`.
fn holdback(s: &str, marker: &str) -> usize {
    for k in (1..marker.len()).rev() {
        if s.ends_with(&marker[..k]) {
            return k;
        }
    }
    0
}
