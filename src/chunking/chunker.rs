//! Deterministic document chunking.
//!
//! Epistemic foundation:
//! - K_i: Same document + same max size → byte-identical chunks, every run
//! - K_i: Chunks tile the document exactly (no overlap, no gaps)
//! - B_i: A natural break may not exist inside the window → hard cut

use crate::models::{Chunk, Document, PipelineError, Result};

/// Break points in order of preference. All ASCII, so a match always ends on
/// a UTF-8 character boundary.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Splits a document into chunks of at most `max_chunk_size` characters.
///
/// Checkpoints index chunks by position, so the boundary rule must never
/// depend on anything but the text and the size.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chunk_size: usize,
}

impl Chunker {
    /// Create a chunker; fails with `InvalidConfig` for a zero size.
    pub fn new(max_chunk_size: usize) -> Result<Self> {
        if max_chunk_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_chunk_size must be > 0".to_string(),
            ));
        }
        Ok(Self { max_chunk_size })
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Split the document.
    ///
    /// Each chunk ends at the last preferred separator inside its window,
    /// provided the separator lies past the first quarter of the window;
    /// otherwise it is cut at exactly `max_chunk_size` characters.
    pub fn split(&self, document: &Document) -> Result<Vec<Chunk>> {
        if document.is_empty() {
            return Err(PipelineError::EmptyDocument);
        }

        let text = document.text();
        // Byte offset of every char, plus the end of text.
        let offsets: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_count = offsets.len() - 1;

        let mut chunks = Vec::with_capacity(char_count.div_ceil(self.max_chunk_size));
        let mut start = 0;

        while start < char_count {
            let hard_end = (start + self.max_chunk_size).min(char_count);
            let end = if hard_end == char_count {
                hard_end
            } else {
                self.find_break(text, &offsets, start, hard_end)
            };

            let (from, to) = (offsets[start], offsets[end]);
            chunks.push(Chunk {
                index: chunks.len(),
                offset: from,
                length: to - from,
                text: text[from..to].to_string(),
            });
            start = end;
        }

        Ok(chunks)
    }

    /// Char index to end the chunk at, in `(start, hard_end]`.
    fn find_break(&self, text: &str, offsets: &[usize], start: usize, hard_end: usize) -> usize {
        let window_start = offsets[start];
        let window = &text[window_start..offsets[hard_end]];
        let min_end = start + (hard_end - start) / 4;

        for separator in SEPARATORS {
            let Some(pos) = window.rfind(separator) else {
                continue;
            };
            let byte_end = window_start + pos + separator.len();
            if let Ok(char_end) = offsets.binary_search(&byte_end) {
                if char_end > min_end {
                    return char_end;
                }
            }
        }

        hard_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lengths(chunks: &[Chunk]) -> Vec<usize> {
        chunks.iter().map(Chunk::char_len).collect()
    }

    #[test]
    fn test_rejects_zero_size() {
        assert!(matches!(
            Chunker::new(0),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_empty_document() {
        let chunker = Chunker::new(10).unwrap();
        assert!(matches!(
            chunker.split(&Document::new("")),
            Err(PipelineError::EmptyDocument)
        ));
    }

    #[test]
    fn test_hard_cut_without_separators() {
        let doc = Document::new("x".repeat(250));
        let chunks = Chunker::new(100).unwrap().split(&doc).unwrap();
        assert_eq!(lengths(&chunks), [100, 100, 50]);
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            [0, 1, 2]
        );
        assert_eq!(chunks[1].offset, 100);
        assert_eq!(chunks[2].length, 50);
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let text = format!("{}\n\n{} {}", "a".repeat(30), "b".repeat(10), "c".repeat(40));
        let chunks = Chunker::new(60).unwrap().split(&Document::new(text)).unwrap();
        assert!(chunks[0].text.ends_with("\n\n"));
        assert_eq!(chunks[0].char_len(), 32);
    }

    #[test]
    fn test_ignores_break_in_first_quarter() {
        // The only space sits at char 5 of a 100-char window.
        let text = format!("{} {}", "a".repeat(5), "b".repeat(200));
        let chunks = Chunker::new(100).unwrap().split(&Document::new(text)).unwrap();
        assert_eq!(chunks[0].char_len(), 100);
    }

    #[test]
    fn test_chunks_tile_document() {
        let text = "Revenue grew 12%. Margins fell.\nRisk factors include rates.\n\n\
                    Liquidity remains strong; debt matures in 2031. "
            .repeat(20);
        let doc = Document::new(text.clone());
        let chunks = Chunker::new(70).unwrap().split(&doc).unwrap();

        let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rebuilt, text);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].offset + pair[0].length, pair[1].offset);
            assert_eq!(pair[0].index + 1, pair[1].index);
        }
        assert!(chunks.iter().all(|c| c.char_len() <= 70));
    }

    #[test]
    fn test_split_is_deterministic() {
        let doc = Document::new("Ünïcödé text with spaces and\nlines. ".repeat(40));
        let chunker = Chunker::new(33).unwrap();
        let first = chunker.split(&doc).unwrap();
        let second = chunker.split(&doc).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_multibyte_boundaries() {
        let doc = Document::new("日本語のテキスト".repeat(10));
        let chunks = Chunker::new(7).unwrap().split(&doc).unwrap();
        assert!(chunks.iter().all(|c| c.char_len() <= 7));
        let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rebuilt, doc.text());
    }
}
