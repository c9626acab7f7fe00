//! Captured console output.
//!
//! A `LogBuffer` is appended to while the emulator runs. Freezing it yields a
//! `CapturedLog`, an immutable snapshot that is cheap to clone and hand to
//! every test case.

use std::sync::Arc;

/// Append-only line buffer filled during a single capture.
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Vec<String>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn freeze(self) -> CapturedLog {
        let text = self.lines.join("\n");
        CapturedLog {
            lines: self.lines.into(),
            text: text.into(),
        }
    }
}

/// Frozen console output of one emulator run.
#[derive(Debug, Clone)]
pub struct CapturedLog {
    lines: Arc<[String]>,
    text: Arc<str>,
}

impl CapturedLog {
    /// Whole output as one string, lines joined with `\n`.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(n);
        self.lines[start..].to_vec()
    }
}

impl FromIterator<String> for CapturedLog {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut buf = LogBuffer::new();
        for line in iter {
            buf.push(line);
        }
        buf.freeze()
    }
}
