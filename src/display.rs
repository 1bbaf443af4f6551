//! Bounded text buffers shown to the operator.

use std::collections::VecDeque;

/// Ring buffer of display lines; the oldest line is dropped when full.
#[derive(Debug, Clone)]
pub struct DisplayText {
    lines: VecDeque<String>,
    capacity: usize,
}

impl DisplayText {
    /// Creates an empty buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    /// Appends a line. Multi-line text is split so each line counts once.
    pub fn push(&mut self, text: &str) {
        if self.capacity == 0 {
            return;
        }
        for line in text.lines() {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line.to_string());
        }
    }

    /// The newest `n` lines, oldest first.
    #[must_use]
    pub fn last(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Number of lines held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer holds no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
