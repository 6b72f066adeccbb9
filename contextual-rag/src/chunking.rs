//! Document chunking.
//!
//! This module provides the [`Chunker`] trait and [`SentenceChunker`], a
//! sliding-window splitter that prefers to cut at sentence ends, then at
//! whitespace, and only then at the raw window edge.
//!
//! All positions are counted in `char`s, so a cut never lands inside a
//! multi-byte UTF-8 sequence.

use std::ops::Range;

use crate::config::RagConfig;

/// A strategy for splitting document text into chunks.
pub trait Chunker: Send + Sync {
    /// Split `text` into ordered, non-empty, trimmed chunks.
    ///
    /// Returns an empty `Vec` if the text is empty or whitespace only.
    fn chunk(&self, text: &str) -> Vec<String>;
}

/// Splits text into windows of at most `chunk_size` characters that overlap
/// by up to `chunk_overlap` characters.
///
/// When a window does not reach the end of the text, the cut is moved back
/// to the last sentence terminator (`.`, `!`, `?` followed by whitespace)
/// inside the final `chunk_overlap` characters of the window. Failing that,
/// it is moved back to the last whitespace in the same region. The next
/// window starts `chunk_overlap` characters before the cut, but always at
/// least one character after the previous start.
///
/// # Example
///
/// ```rust,ignore
/// use contextual_rag::{Chunker, SentenceChunker};
///
/// let chunker = SentenceChunker::new(512, 50);
/// let chunks = chunker.chunk(&text);
/// ```
#[derive(Debug, Clone)]
pub struct SentenceChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl SentenceChunker {
    /// Create a new `SentenceChunker`.
    ///
    /// # Arguments
    ///
    /// * `chunk_size`: target maximum number of characters per chunk
    /// * `chunk_overlap`: overlap between consecutive chunks, also the width
    ///   of the region searched for a boundary
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self { chunk_size, chunk_overlap }
    }

    /// Create a chunker using the sizes from a [`RagConfig`].
    pub fn from_config(config: &RagConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Compute the untrimmed window of every chunk as a range of char offsets.
    ///
    /// Consecutive ranges never leave a gap: each range starts at or before
    /// the end of the previous one, and no earlier than `chunk_overlap`
    /// characters before it. The last range ends at the end of the text.
    pub fn spans(&self, text: &str) -> Vec<Range<usize>> {
        let chars: Vec<char> = text.chars().collect();
        self.spans_of(&chars)
    }

    fn spans_of(&self, chars: &[char]) -> Vec<Range<usize>> {
        let len = chars.len();
        let size = self.chunk_size.max(1);
        let mut spans = Vec::new();
        let mut start = 0;

        while start < len {
            let window_end = start + size;
            let end = if window_end < len {
                self.find_cut(chars, start, window_end)
            } else {
                len
            };
            spans.push(start..end);

            if end >= len {
                break;
            }
            start = (start + 1).max(end.saturating_sub(self.chunk_overlap));
        }

        spans
    }

    /// Pick the cut position for a window `[start, window_end)`.
    fn find_cut(&self, chars: &[char], start: usize, window_end: usize) -> usize {
        let lower = window_end.saturating_sub(self.chunk_overlap).max(start);

        let sentence_end = (lower..window_end).rev().find(|&i| {
            matches!(chars[i], '.' | '!' | '?')
                && chars.get(i + 1).is_none_or(|next| next.is_whitespace())
        });
        if let Some(i) = sentence_end {
            return i + 1;
        }

        // A cut at `start` would produce an empty window.
        let word_end = (lower..window_end).rev().find(|&i| i > start && chars[i].is_whitespace());
        word_end.unwrap_or(window_end)
    }
}

impl Default for SentenceChunker {
    fn default() -> Self {
        Self::from_config(&RagConfig::default())
    }
}

impl Chunker for SentenceChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = text.chars().collect();
        self.spans_of(&chars)
            .into_iter()
            .filter_map(|span| {
                let piece: String = chars[span].iter().collect();
                let trimmed = piece.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .collect()
    }
}
