//! Fixed-size sliding-window text chunker.
//!
//! Splits a [`Document`]'s text into overlapping [`Chunk`]s. Boundaries are
//! purely offset based: the same text with the same parameters always
//! yields the same chunks, regardless of content.
//!
//! # Algorithm
//!
//! 1. Segment the text into units: Unicode scalar values ([`ChunkUnit::Chars`])
//!    or whitespace-delimited words ([`ChunkUnit::Words`]).
//! 2. Emit the window `[start, min(start + chunk_size, n))`.
//! 3. Stop once a window reaches the final unit; otherwise advance
//!    `start` by `chunk_size - overlap` and repeat.
//!
//! The final chunk may be shorter than `chunk_size`; it is always emitted.
//! Chunk text is the exact slice of the document from the first unit of the
//! window to the end of its last unit, so in character mode the chunks,
//! with overlaps removed, concatenate back to the original text.
//!
//! # Example
//!
//! ```rust
//! use policy_qa_core::chunk::{chunk_document, ChunkParams, ChunkUnit};
//! use policy_qa_core::models::{Document, SourceKind};
//!
//! let doc = Document::new("notes.pdf", SourceKind::Pdf, Some(1), "A B C D E F G H");
//! let params = ChunkParams::new(4, 2, ChunkUnit::Words).unwrap();
//! let chunks = chunk_document(&doc, &params);
//! let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
//! assert_eq!(texts, ["A B C D", "C D E F", "E F G H"]);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;
use crate::models::{Chunk, Document};

/// Unit in which `chunk_size`, `overlap`, and chunk offsets are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    #[default]
    Chars,
    Words,
}

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    chunk_size: usize,
    overlap: usize,
    unit: ChunkUnit,
}

impl ChunkParams {
    /// Fails with [`ConfigurationError`] when `chunk_size` is zero or
    /// `overlap >= chunk_size` (the window would never advance).
    pub fn new(
        chunk_size: usize,
        overlap: usize,
        unit: ChunkUnit,
    ) -> Result<Self, ConfigurationError> {
        if chunk_size == 0 {
            return Err(ConfigurationError::ZeroChunkSize);
        }
        if overlap >= chunk_size {
            return Err(ConfigurationError::OverlapTooLarge {
                size: chunk_size,
                overlap,
            });
        }
        Ok(Self {
            chunk_size,
            overlap,
            unit,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn unit(&self) -> ChunkUnit {
        self.unit
    }

    fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

/// Split a document into overlapping chunks.
///
/// Returns an empty vector for documents with no non-whitespace text.
/// Sequence indices are contiguous from `0`.
pub fn chunk_document(doc: &Document, params: &ChunkParams) -> Vec<Chunk> {
    let text = doc.raw_text.as_str();
    if text.trim().is_empty() {
        return Vec::new();
    }

    let spans = unit_spans(text, params.unit);
    let n = spans.len();
    let provenance = doc.provenance();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < n {
        let end = (start + params.chunk_size).min(n);
        let byte_start = spans[start].0;
        let byte_end = spans[end - 1].1;
        let piece = &text[byte_start..byte_end];
        let sequence_index = chunks.len();

        chunks.push(Chunk {
            id: chunk_id(&doc.id, sequence_index),
            document_id: doc.id.clone(),
            text: piece.to_string(),
            start_offset: start,
            end_offset: end,
            byte_start,
            byte_end,
            sequence_index,
            hash: content_hash(piece),
            source: provenance.clone(),
        });

        if end == n {
            break;
        }
        start += params.step();
    }

    chunks
}

/// Stable chunk id: `<document_id>-<sequence_index, zero padded>`.
pub fn chunk_id(document_id: &str, sequence_index: usize) -> String {
    format!("{}-{:04}", document_id, sequence_index)
}

/// SHA-256 of chunk text, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Byte spans `(start, end)` of every unit in `text`.
fn unit_spans(text: &str, unit: ChunkUnit) -> Vec<(usize, usize)> {
    match unit {
        ChunkUnit::Chars => text
            .char_indices()
            .map(|(i, c)| (i, i + c.len_utf8()))
            .collect(),
        ChunkUnit::Words => {
            let mut spans = Vec::new();
            let mut word_start: Option<usize> = None;
            for (i, c) in text.char_indices() {
                if c.is_whitespace() {
                    if let Some(s) = word_start.take() {
                        spans.push((s, i));
                    }
                } else if word_start.is_none() {
                    word_start = Some(i);
                }
            }
            if let Some(s) = word_start {
                spans.push((s, text.len()));
            }
            spans
        }
    }
}
