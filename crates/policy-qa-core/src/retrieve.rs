//! Query-time retrieval: embed, search, threshold, map to passages.
//!
//! The retriever embeds the (normalized) query, pins one index snapshot,
//! takes the `top_k` nearest chunks from it, and then drops every candidate
//! scoring below `similarity_threshold`. When nothing survives, the result is
//! empty; there is no fallback to low-confidence passages.

use std::sync::{Arc, OnceLock};

use regex::RegexSet;

use crate::embedding::EmbeddingModel;
use crate::error::{IndexError, RetrieveError};
use crate::index::{IndexSnapshot, VectorIndex};
use crate::models::RetrievedPassage;
use crate::text::normalize_query;

/// Shortest accepted query, in characters, after normalization.
pub const MIN_QUERY_CHARS: usize = 3;
/// Longest accepted query, in characters, after normalization.
pub const MAX_QUERY_CHARS: usize = 2000;

/// Markup that has no business in a policy question: script tags, the
/// `javascript:` scheme, and inline event handlers (`onclick=`).
fn markup_patterns() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)<\s*script\b[^>]*>",
            r"(?i)\bjavascript\s*:",
            r"(?i)\bon[a-z]+\s*=",
        ])
        .expect("query markup patterns are valid")
    })
}

/// Normalize a raw query and check its length and content.
pub fn prepare_query(raw: &str) -> Result<String, RetrieveError> {
    let query = normalize_query(raw);
    let len = query.chars().count();
    if len < MIN_QUERY_CHARS {
        return Err(RetrieveError::InvalidQuery(format!(
            "query must be at least {} characters",
            MIN_QUERY_CHARS
        )));
    }
    if len > MAX_QUERY_CHARS {
        return Err(RetrieveError::InvalidQuery(format!(
            "query must be at most {} characters (got {})",
            MAX_QUERY_CHARS, len
        )));
    }
    if markup_patterns().is_match(&query) {
        return Err(RetrieveError::InvalidQuery(
            "query contains markup or script content".to_string(),
        ));
    }
    Ok(query)
}

/// Rank passages in `snapshot` for `query_vector`: top-k first, then the
/// threshold filter. Scores are non-increasing in the returned order.
pub fn select_passages(
    snapshot: &IndexSnapshot,
    query_vector: &[f32],
    top_k: usize,
    similarity_threshold: f32,
) -> Result<Vec<RetrievedPassage>, IndexError> {
    let hits = snapshot.search(query_vector, top_k)?;
    let mut passages = Vec::with_capacity(hits.len());
    for hit in hits {
        if hit.score < similarity_threshold {
            continue;
        }
        let entry = snapshot
            .get(&hit.chunk_id)
            .ok_or_else(|| IndexError::Corrupt(format!("search hit {} has no entry", hit.chunk_id)))?;
        let chunk = &entry.chunk;
        passages.push(RetrievedPassage {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            text: chunk.text.clone(),
            source_uri: chunk.source.source_uri.clone(),
            source_kind: chunk.source.source_kind,
            page: chunk.source.page,
            sequence_index: chunk.sequence_index,
            similarity_score: hit.score,
        });
    }
    Ok(passages)
}

/// Embeds queries and searches a shared [`VectorIndex`]. Never mutates it.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingModel>,
    index: Arc<VectorIndex>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn EmbeddingModel>, index: Arc<VectorIndex>) -> Self {
        Self { embedder, index }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingModel> {
        &self.embedder
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// Return up to `top_k` passages scoring at least `similarity_threshold`,
    /// best first.
    ///
    /// A threshold above `1.0` is accepted and always yields an empty result.
    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<RetrievedPassage>, RetrieveError> {
        if similarity_threshold.is_nan() {
            return Err(RetrieveError::InvalidThreshold(similarity_threshold));
        }
        let query = prepare_query(query_text)?;
        let vector = self.embedder.embed(&query).await?;
        let snapshot = self.index.snapshot();
        Ok(select_passages(
            &snapshot,
            &vector,
            top_k,
            similarity_threshold,
        )?)
    }
}
