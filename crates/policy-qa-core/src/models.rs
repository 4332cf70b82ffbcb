//! Core data models used throughout Policy QA.
//!
//! These types represent the documents, chunks, passages, and answers that
//! flow through the ingestion and query pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of corpus source a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Pdf,
    Web,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pdf => "pdf",
            SourceKind::Web => "web",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(SourceKind::Pdf),
            "web" => Some(SourceKind::Web),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingestion input: where to read one source from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    /// Filesystem path for PDFs, absolute URL for web pages.
    pub location: String,
}

impl SourceDescriptor {
    pub fn pdf(path: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Pdf,
            location: path.into(),
        }
    }

    pub fn web(url: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Web,
            location: url.into(),
        }
    }
}

/// Where a piece of text came from. Carried from document to chunk to passage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_uri: String,
    pub source_kind: SourceKind,
    /// 1-based page number for PDF pages.
    pub page: Option<u32>,
    pub title: Option<String>,
}

/// A normalized plain-text document produced by the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_uri: String,
    pub source_kind: SourceKind,
    pub raw_text: String,
    pub fetched_at: DateTime<Utc>,
    pub page: Option<u32>,
    pub title: Option<String>,
}

impl Document {
    /// Build a document with an id derived from its source URI and page.
    pub fn new(
        source_uri: impl Into<String>,
        source_kind: SourceKind,
        page: Option<u32>,
        raw_text: impl Into<String>,
    ) -> Self {
        let source_uri = source_uri.into();
        Self {
            id: document_id(&source_uri, page),
            source_uri,
            source_kind,
            raw_text: raw_text.into(),
            fetched_at: Utc::now(),
            page,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn provenance(&self) -> Provenance {
        Provenance {
            source_uri: self.source_uri.clone(),
            source_kind: self.source_kind,
            page: self.page,
            title: self.title.clone(),
        }
    }
}

/// Deterministic document id: first 16 hex chars of SHA-256 over `uri#page`.
pub fn document_id(source_uri: &str, page: Option<u32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_uri.as_bytes());
    if let Some(p) = page {
        hasher.update(format!("#{}", p).as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// A contiguous slice of a document's text; the retrieval unit.
///
/// `start_offset` / `end_offset` are in chunking units (characters or
/// words), `byte_start` / `byte_end` index into the document text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub byte_start: usize,
    pub byte_end: usize,
    pub sequence_index: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
    pub source: Provenance,
}

/// Dense embedding of a chunk or query.
pub type EmbeddingVector = Vec<f32>;

/// Ranked, provenance-tagged passage returned by the retriever.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedPassage {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    pub source_uri: String,
    pub source_kind: SourceKind,
    pub page: Option<u32>,
    pub sequence_index: usize,
    pub similarity_score: f32,
}

impl RetrievedPassage {
    /// Human-readable source label used as the passage header in prompts.
    pub fn label(&self) -> String {
        match (self.source_kind, self.page) {
            (SourceKind::Pdf, Some(p)) => format!("PDF: {}, page {}", self.source_uri, p),
            (SourceKind::Pdf, None) => format!("PDF: {}", self.source_uri),
            (SourceKind::Web, _) => format!("Web: {}", self.source_uri),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of caller-owned conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome category of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    /// The language model produced an answer.
    Answered,
    /// No passage cleared the threshold; no model call was made.
    Refused,
    /// The language model could not be reached within the retry budget.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerResult {
    pub text: String,
    /// Source URIs of the passages the answer actually cites.
    pub citations: BTreeSet<String>,
    pub grounded: bool,
    pub status: AnswerStatus,
}

/// Fixed response for queries without supporting passages.
pub const REFUSAL_TEXT: &str =
    "I don't have enough information about this in the policy documents to answer.";

/// Fixed response when the language model is unreachable.
pub const UNAVAILABLE_TEXT: &str =
    "The answering service is temporarily unavailable. Please try again shortly.";

impl AnswerResult {
    pub fn refusal() -> Self {
        Self {
            text: REFUSAL_TEXT.to_string(),
            citations: BTreeSet::new(),
            grounded: false,
            status: AnswerStatus::Refused,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            text: UNAVAILABLE_TEXT.to_string(),
            citations: BTreeSet::new(),
            grounded: false,
            status: AnswerStatus::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_stable_and_page_sensitive() {
        let a = document_id("manual.pdf", Some(1));
        let b = document_id("manual.pdf", Some(1));
        let c = document_id("manual.pdf", Some(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_passage_label() {
        let mut p = RetrievedPassage {
            chunk_id: "c".into(),
            document_id: "d".into(),
            text: "t".into(),
            source_uri: "manual.pdf".into(),
            source_kind: SourceKind::Pdf,
            page: Some(3),
            sequence_index: 0,
            similarity_score: 0.5,
        };
        assert_eq!(p.label(), "PDF: manual.pdf, page 3");
        p.source_kind = SourceKind::Web;
        p.source_uri = "https://example.edu/policies".into();
        assert_eq!(p.label(), "Web: https://example.edu/policies");
    }

    #[test]
    fn test_refusal_is_ungrounded() {
        let r = AnswerResult::refusal();
        assert!(!r.grounded);
        assert!(r.citations.is_empty());
        assert_eq!(r.status, AnswerStatus::Refused);
    }

    #[test]
    fn test_source_kind_parse() {
        assert_eq!(SourceKind::parse("pdf"), Some(SourceKind::Pdf));
        assert_eq!(SourceKind::parse("web"), Some(SourceKind::Web));
        assert_eq!(SourceKind::parse("html"), None);
    }
}
