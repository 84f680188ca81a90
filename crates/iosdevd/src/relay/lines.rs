//! Line splitting for relay streams.

/// Longest segment held back waiting for a separator. A longer run is
/// emitted as a line of its own.
pub const MAX_LINE_LENGTH: usize = 8192;

/// Splits a byte stream into lines on NUL, CR and LF.
///
/// Empty segments are dropped, so `\r\n` and runs of separators never
/// produce empty lines. A trailing segment without a separator is held until
/// the next `feed` (or `finish`), up to [`MAX_LINE_LENGTH`] bytes. Invalid
/// UTF-8 is replaced lossily.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one read's worth of bytes, returning the completed lines.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in bytes {
            if is_separator(byte) {
                if !self.partial.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                    self.partial.clear();
                }
            } else {
                self.partial.push(byte);
                if self.partial.len() >= MAX_LINE_LENGTH {
                    lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                    self.partial.clear();
                }
            }
        }

        lines
    }

    /// Returns the held partial line, if any, and resets.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(line)
    }

    /// Number of bytes held back waiting for a separator.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

fn is_separator(byte: u8) -> bool {
    matches!(byte, b'\0' | b'\r' | b'\n')
}
