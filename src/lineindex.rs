use tower_lsp::lsp_types::{Position, Range};

use crate::span::Span;

/// Maps between byte offsets and LSP line/character positions.
///
/// Built once per parsed document; positions use UTF-8 byte columns, which
/// matches how the scanner assigns offsets.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
    text_len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        for (idx, ch) in text.char_indices() {
            if ch == '\n' {
                line_starts.push(idx + 1);
            }
        }
        Self {
            line_starts,
            text_len: text.len(),
        }
    }

    pub fn position_at(&self, offset: usize) -> Position {
        let offset = offset.min(self.text_len);
        let line = match self.line_starts.binary_search(&offset) {
            Ok(index) => index,
            Err(index) => index.saturating_sub(1),
        };
        let line_start = self.line_starts.get(line).copied().unwrap_or(0);
        Position::new(line as u32, (offset - line_start) as u32)
    }

    pub fn offset_at(&self, position: &Position) -> Option<usize> {
        let line_start = *self.line_starts.get(position.line as usize)?;
        let line_end = self
            .line_starts
            .get(position.line as usize + 1)
            .copied()
            .unwrap_or(self.text_len);
        let offset = line_start + position.character as usize;
        // Clamp to the line rather than rejecting, so completion requests at
        // a just-edited line end still resolve.
        Some(offset.min(line_end))
    }

    pub fn range_at(&self, span: Span) -> Range {
        Range::new(self.position_at(span.start), self.position_at(span.end))
    }
}
