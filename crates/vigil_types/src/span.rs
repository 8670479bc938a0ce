//! Span and position types for source locations.
//!
//! Spans are byte offsets into the file contents. Positions use editor
//! coordinates: 0-indexed lines and UTF-16 code unit columns, so they can be
//! handed to an LSP client without re-reading the text.

use serde::{Deserialize, Serialize};

/// A position in source text, in editor coordinates.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Position {
    /// Line number (0-indexed).
    pub line: u32,
    /// Column in UTF-16 code units (0-indexed).
    pub character: u32,
}

impl Position {
    /// Creates a new position.
    #[inline]
    pub const fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// A span representing a byte range in source text.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Span {
    /// Start byte offset (inclusive).
    pub start: u32,
    /// End byte offset (exclusive).
    pub end: u32,
}

impl Span {
    /// Creates a new span.
    #[inline]
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Returns the length of the span in bytes.
    #[inline]
    pub const fn len(&self) -> u32 {
        self.end - self.start
    }

    /// Returns true if the span is empty.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A start/end pair of positions.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Location {
    pub start: Position,
    pub end: Position,
}

impl Location {
    /// Creates a new location.
    #[inline]
    pub const fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// Byte offset to editor position lookup for one text.
///
/// Line starts are computed once; converting an offset only walks the
/// characters of its own line.
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    text: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    /// Builds the index for `text`.
    pub fn new(text: &'a str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            text.bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { text, line_starts }
    }

    /// Number of lines (a trailing newline opens a final empty line).
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Byte offset of the start of `line`.
    pub fn line_start(&self, line: usize) -> Option<usize> {
        self.line_starts.get(line).copied()
    }

    /// Converts a byte offset to a position.
    ///
    /// Returns `None` when the offset is past the end of the text. Offsets
    /// inside a multi-byte character are clamped to the character start.
    pub fn position(&self, offset: usize) -> Option<Position> {
        if offset > self.text.len() {
            return None;
        }

        let line = match self.line_starts.binary_search(&offset) {
            Ok(exact) => exact,
            Err(next) => next - 1,
        };
        let start = self.line_starts[line];

        let mut character = 0u32;
        let mut current = start;
        for ch in self.text[start..].chars() {
            if current >= offset || ch == '\n' {
                break;
            }
            character += ch.len_utf16() as u32;
            current += ch.len_utf8();
        }

        Some(Position::new(line as u32, character))
    }

    /// Converts a span to a location, clamping out-of-range ends to the text end.
    pub fn location(&self, span: Span) -> Location {
        let end_of_text = self.text.len();
        let start = self
            .position((span.start as usize).min(end_of_text))
            .unwrap_or_default();
        let end = self
            .position((span.end as usize).min(end_of_text))
            .unwrap_or(start);
        Location::new(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_position_basic_ascii() {
        let index = LineIndex::new("Hello World");
        assert_eq!(index.position(0), Some(Position::new(0, 0)));
        assert_eq!(index.position(5), Some(Position::new(0, 5)));
        assert_eq!(index.position(11), Some(Position::new(0, 11)));
        assert_eq!(index.position(12), None);
    }

    #[test]
    fn test_position_multiline() {
        let index = LineIndex::new("Line 1\nLine 2\nLine 3");
        assert_eq!(index.position(7), Some(Position::new(1, 0)));
        assert_eq!(index.position(20), Some(Position::new(2, 6)));
        assert_eq!(index.line_count(), 3);
    }

    #[test]
    fn test_position_unicode_multibyte() {
        // 'あ' is 3 bytes in UTF-8, 1 code unit in UTF-16
        let index = LineIndex::new("あいう");
        assert_eq!(index.position(3), Some(Position::new(0, 1)));
        assert_eq!(index.position(9), Some(Position::new(0, 3)));
    }

    #[test]
    fn test_position_supplementary_plane_chars() {
        // '🎉' is 4 bytes in UTF-8, 2 code units in UTF-16
        let index = LineIndex::new("a🎉b");
        assert_eq!(index.position(1), Some(Position::new(0, 1)));
        assert_eq!(index.position(5), Some(Position::new(0, 3)));
    }

    #[test]
    fn test_position_empty_string() {
        let index = LineIndex::new("");
        assert_eq!(index.position(0), Some(Position::new(0, 0)));
        assert_eq!(index.position(1), None);
    }

    #[test]
    fn test_location_clamps_to_text_end() {
        let index = LineIndex::new("ab\ncd");
        let loc = index.location(Span::new(3, 99));
        assert_eq!(loc.start, Position::new(1, 0));
        assert_eq!(loc.end, Position::new(1, 2));
    }

    #[test]
    fn test_span_len() {
        let span = Span::new(4, 10);
        assert_eq!(span.len(), 6);
        assert!(!span.is_empty());
        assert!(Span::new(3, 3).is_empty());
    }
}
