//! Bounded tail of recent agent output.
//!
//! Feeds raw PTY bytes, strips escapes, and maintains two views used by the
//! supervisor: the completed lines of the current chunk (for the completion
//! marker) and a bounded text tail (for prompt detection). The tail holds at
//! most [`TAIL_LIMIT`] bytes; older output falls off the front.

use crate::ansi;

/// Size of the retained output tail.
pub const TAIL_LIMIT: usize = 16 * 1024;

/// Rolling, ANSI-stripped view of an agent's recent terminal output.
pub struct TailBuffer {
    tail: String,
    limit: usize,
    /// Bytes of the current unterminated line.
    partial: String,
}

impl TailBuffer {
    pub fn new() -> Self {
        Self::with_limit(TAIL_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            tail: String::new(),
            limit,
            partial: String::new(),
        }
    }

    /// Feed raw bytes; returns the lines completed by this chunk, stripped.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = ansi::scrub(chunk);
        self.push_text(&text)
    }

    /// Feed already-stripped text; returns the lines it completes.
    pub fn push_text(&mut self, text: &str) -> Vec<String> {
        self.tail.push_str(text);
        self.truncate_front();

        let mut completed = Vec::new();
        for ch in text.chars() {
            if ch == '\n' {
                completed.push(std::mem::take(&mut self.partial));
            } else {
                self.partial.push(ch);
            }
        }
        completed
    }

    /// The retained tail, including any unterminated final line.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    /// The current unterminated line, if any.
    pub fn partial(&self) -> Option<&str> {
        (!self.partial.is_empty()).then_some(self.partial.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_empty()
    }

    fn truncate_front(&mut self) {
        if self.tail.len() <= self.limit {
            return;
        }
        let cut = self.tail.len() - self.limit;
        let mut boundary = cut;
        while boundary < self.tail.len() && !self.tail.is_char_boundary(boundary) {
            boundary += 1;
        }
        self.tail.drain(..boundary);
    }
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new()
    }
}
