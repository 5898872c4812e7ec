//! Fixed-stride sliding-window text chunker.
//!
//! Splits extracted document text into overlapping [`Chunk`]s of at most
//! `size` characters. Consecutive chunks share exactly `overlap`
//! characters. Offsets are counted in Unicode scalar values so a chunk
//! never splits a character.
//!
//! The window configuration is validated once, in [`TextChunker::new`].

use std::fmt;

use crate::models::Chunk;

/// Rejected chunker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    ZeroSize,
    OverlapTooLarge { size: usize, overlap: usize },
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::ZeroSize => write!(f, "chunk size must be greater than zero"),
            ChunkError::OverlapTooLarge { size, overlap } => write!(
                f,
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap, size
            ),
        }
    }
}

impl std::error::Error for ChunkError {}

/// A validated window configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChunker {
    size: usize,
    overlap: usize,
}

impl TextChunker {
    pub fn new(size: usize, overlap: usize) -> Result<Self, ChunkError> {
        if size == 0 {
            return Err(ChunkError::ZeroSize);
        }
        if overlap >= size {
            return Err(ChunkError::OverlapTooLarge { size, overlap });
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into chunks with contiguous 1-based indices.
    /// Empty text yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        // Byte offset of every char boundary, including the end of the text.
        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let len = bounds.len() - 1;

        let stride = self.size - self.overlap;
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < len {
            let end = (start + self.size).min(len);
            chunks.push(Chunk {
                index: chunks.len() + 1,
                start,
                end,
                text: text[bounds[start]..bounds[end]].to_string(),
            });
            if end == len {
                break;
            }
            start += stride;
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_size() {
        assert_eq!(TextChunker::new(0, 0), Err(ChunkError::ZeroSize));
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(matches!(
            TextChunker::new(10, 10),
            Err(ChunkError::OverlapTooLarge { .. })
        ));
        assert!(TextChunker::new(10, 25).is_err());
        assert!(TextChunker::new(10, 9).is_ok());
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunker = TextChunker::new(100, 10).unwrap();
        assert!(chunker.chunk("").is_empty());
    }

    #[test]
    fn short_text_single_chunk() {
        let chunker = TextChunker::new(100, 10).unwrap();
        let chunks = chunker.chunk("hello");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 1);
        assert_eq!(chunks[0].text, "hello");
    }

    #[test]
    fn default_window_on_6200_chars() {
        let text: String = (0..6200).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let chunker = TextChunker::new(6000, 300).unwrap();
        let chunks = chunker.chunk(&text);

        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 6000));
        assert_eq!((chunks[1].start, chunks[1].end), (5700, 6200));
        assert_eq!(chunks[1].text.chars().count(), 500);
        assert_eq!(chunks[1].index, 2);
    }

    #[test]
    fn consecutive_chunks_share_exactly_overlap() {
        let text: String = (0..1000).map(|i| char::from(b'0' + (i % 10) as u8)).collect();
        let chunker = TextChunker::new(120, 17).unwrap();
        let chunks = chunker.chunk(&text);

        for pair in chunks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert_eq!(b.start, a.end - 17);
            let tail: String = a.text.chars().skip(a.text.chars().count() - 17).collect();
            let head: String = b.text.chars().take(17).collect();
            assert_eq!(tail, head);
        }

        // Removing the overlap from every chunk after the first rebuilds the text.
        let mut rebuilt = chunks[0].text.clone();
        for c in &chunks[1..] {
            rebuilt.extend(c.text.chars().skip(17));
        }
        assert_eq!(rebuilt, text);
        assert_eq!(chunks.last().unwrap().end, 1000);
    }

    #[test]
    fn zero_overlap_tiles_text() {
        let chunker = TextChunker::new(4, 0).unwrap();
        let texts: Vec<String> = chunker.chunk("abcdefghij").into_iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn counts_characters_not_bytes() {
        let chunker = TextChunker::new(3, 1).unwrap();
        let chunks = chunker.chunk("ğüşıöç");
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["ğüş", "şıö", "öç"]);
    }

    #[test]
    fn exact_fit_stops_after_reaching_end() {
        let chunker = TextChunker::new(5, 2).unwrap();
        let chunks = chunker.chunk("abcde");
        assert_eq!(chunks.len(), 1);
    }
}
