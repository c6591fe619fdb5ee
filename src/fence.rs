//! Streaming removal of markdown code fences.
//!
//! Chat models like to wrap shell commands in fenced code blocks. In clean
//! mode [`FenceFilter`] passes ordinary prose straight through and only holds
//! text back once a fence marker shows up, releasing it a couple of lines
//! later with the markers and language tags stripped.

use regex::Regex;
use std::sync::LazyLock;

/// The markdown code fence marker.
pub const FENCE: &str = "```";

/// Flush once the buffered text spans this many lines.
const FLUSH_NEWLINES: usize = 2;

/// Upper bound on buffered characters before a forced flush.
const MAX_BUFFER: usize = 500;

/// Opening fence: marker, optional ASCII language tag, optional blanks and a
/// newline. A marker at the very end of the text is taken without a tag.
static OPENING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:[A-Za-z0-9_+-]*[ \t]*\r?\n|[ \t]*\z)").expect("valid regex")
});

/// Closing fence: marker with the newline in front of it.
static CLOSING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n?```").expect("valid regex"));

/// A line holding nothing but the marker.
static BARE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^```$").expect("valid regex"));

/// How the answer is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Fragments are printed exactly as received.
    Raw,
    /// Code fence markers and language tags are removed.
    Clean,
}

impl OutputMode {
    /// Map the `clean_output` config flag to a mode.
    pub fn from_clean_output(clean_output: bool) -> Self {
        if clean_output {
            OutputMode::Clean
        } else {
            OutputMode::Raw
        }
    }
}

/// Remove code fence markers from `text`.
///
/// Rules are applied in order (opening fences, closing fences, bare marker
/// lines) and repeated until nothing changes, so the result never contains
/// [`FENCE`] and stripping it again is a no-op.
pub fn strip_fences(text: &str) -> String {
    let mut current = strip_once(text);
    loop {
        let next = strip_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_once(text: &str) -> String {
    let text = OPENING.replace_all(text, "");
    let text = CLOSING.replace_all(&text, "");
    BARE.replace_all(&text, "").into_owned()
}

#[derive(Debug)]
enum State {
    /// Pass-through. `carry` holds trailing backticks withheld from the last
    /// emission in case the next fragment completes a marker with them.
    Idle { carry: String },
    /// A marker has been seen; text accumulates until a flush condition hits.
    Buffering { buffer: String, newlines: usize },
}

impl Default for State {
    fn default() -> Self {
        State::Idle {
            carry: String::new(),
        }
    }
}

/// Incremental filter over streamed answer fragments.
#[derive(Debug)]
pub struct FenceFilter {
    mode: OutputMode,
    state: State,
}

impl FenceFilter {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            state: State::default(),
        }
    }

    /// Feed the next fragment and return the text that can be printed now.
    pub fn push(&mut self, fragment: &str) -> String {
        if fragment.is_empty() {
            return String::new();
        }
        if self.mode == OutputMode::Raw {
            return fragment.to_string();
        }

        match &mut self.state {
            State::Idle { carry } => {
                let mut text = std::mem::take(carry);
                text.push_str(fragment);
                if text.contains(FENCE) {
                    let newlines = count_newlines(&text);
                    self.state = State::Buffering {
                        buffer: text,
                        newlines,
                    };
                    self.flush_if_due()
                } else {
                    self.emit(text)
                }
            }
            State::Buffering { buffer, newlines } => {
                buffer.push_str(fragment);
                *newlines += count_newlines(fragment);
                self.flush_if_due()
            }
        }
    }

    /// End of stream: flush whatever is left and append the final newline.
    pub fn finish(mut self) -> String {
        let mut out = match std::mem::take(&mut self.state) {
            State::Idle { carry } => carry,
            State::Buffering { buffer, .. } => strip_fences(&buffer),
        };
        out.push('\n');
        out
    }

    /// Whether text is currently held back waiting for a flush.
    #[cfg(test)]
    pub fn is_buffering(&self) -> bool {
        matches!(self.state, State::Buffering { .. })
    }

    fn flush_if_due(&mut self) -> String {
        let State::Buffering { buffer, newlines } = &mut self.state else {
            return String::new();
        };

        if buffer.chars().count() > MAX_BUFFER {
            let text = std::mem::take(buffer);
            return self.emit(strip_fences(&text));
        }
        if *newlines < FLUSH_NEWLINES && buffer.matches(FENCE).count() < 2 {
            return String::new();
        }

        match deferred_tail_start(buffer) {
            Some(start) => {
                // The last line opens a fence whose tag may still be arriving:
                // flush the complete lines and keep that one buffered.
                let tail = buffer.split_off(start);
                let head = std::mem::replace(buffer, tail);
                *newlines = 0;
                let mut cleaned = strip_fences(&head);
                let carry = split_trailing_backticks(&mut cleaned);
                buffer.insert_str(0, &carry);
                cleaned
            }
            None => {
                let text = std::mem::take(buffer);
                self.emit(strip_fences(&text))
            }
        }
    }

    /// Return `text` minus any trailing backticks, which are carried over.
    fn emit(&mut self, mut text: String) -> String {
        let carry = split_trailing_backticks(&mut text);
        self.state = State::Idle { carry };
        text
    }
}

fn count_newlines(text: &str) -> usize {
    text.bytes().filter(|&b| b == b'\n').count()
}

fn split_trailing_backticks(text: &mut String) -> String {
    let keep = text.len() - text.trim_end_matches('`').len();
    text.split_off(text.len() - keep)
}

/// Start of the last line if it is incomplete and contains a marker.
fn deferred_tail_start(buffer: &str) -> Option<usize> {
    let start = buffer.rfind('\n')? + 1;
    buffer[start..].contains(FENCE).then_some(start)
}
