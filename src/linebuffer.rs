//! Bounded ring buffer of text lines
//!
//! Used for per-app captured output and for the global event log. Once the
//! buffer is full the oldest line is overwritten.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Number of lines retained when no explicit size is given
pub const DEFAULT_SIZE: usize = 1024;

#[derive(Debug)]
pub struct LineBuffer {
    size: usize,
    lines: Mutex<VecDeque<String>>,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_size(DEFAULT_SIZE)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer holding at most `size` lines (a size of 0 means the default)
    pub fn with_size(size: usize) -> Self {
        let size = if size == 0 { DEFAULT_SIZE } else { size };
        Self {
            size,
            lines: Mutex::new(VecDeque::with_capacity(size.min(64))),
        }
    }

    pub fn append(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.size {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Snapshot of the retained lines, oldest first
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Concatenate the retained lines, oldest first. Lines are written as
    /// stored; callers append their own newlines.
    pub fn contents(&self) -> String {
        let lines = self.lines.lock();
        let mut out = String::with_capacity(lines.iter().map(String::len).sum());
        for line in lines.iter() {
            out.push_str(line);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_below_capacity() {
        let buf = LineBuffer::with_size(3);
        buf.append("a\n");
        buf.append("b\n");

        assert_eq!(buf.len(), 2);
        assert_eq!(buf.contents(), "a\nb\n");
    }

    #[test]
    fn test_wraps_and_keeps_newest() {
        let buf = LineBuffer::with_size(3);
        for line in ["1\n", "2\n", "3\n", "4\n", "5\n"] {
            buf.append(line);
        }

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.lines(), vec!["3\n", "4\n", "5\n"]);
        assert_eq!(buf.contents(), "3\n4\n5\n");
    }

    #[test]
    fn test_zero_size_uses_default() {
        let buf = LineBuffer::with_size(0);
        for i in 0..(DEFAULT_SIZE + 10) {
            buf.append(format!("{}\n", i));
        }
        assert_eq!(buf.len(), DEFAULT_SIZE);
        assert_eq!(buf.lines()[0], "10\n");
    }

    #[test]
    fn test_empty() {
        let buf = LineBuffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.contents(), "");
    }
}
