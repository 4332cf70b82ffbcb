//! The pipeline façade callers talk to.
//!
//! [`RagPipeline`] wires the loader, chunker, embedder, index, retriever,
//! and answer composer together from one [`Config`]. It exposes the build
//! phase ([`refresh`](RagPipeline::refresh)) and the per-query operations
//! ([`retrieve`](RagPipeline::retrieve), [`answer`](RagPipeline::answer),
//! and the combined [`query`](RagPipeline::query)).
//!
//! The pipeline holds no conversation state. Queries share nothing mutable
//! except the index, which they only read through pinned snapshots, so any
//! number of them may run concurrently with each other and with a refresh.
//!
//! # Refresh
//!
//! ```text
//! claim rebuild slot ─► load each source ─► chunk ─► embed in batches ─► swap
//!        │                    │                          │
//!   RebuildInProgress   failures recorded      failed batch retried per chunk,
//!                       and skipped            failing chunks recorded and skipped
//! ```
//!
//! If nothing could be embedded the previous index stays live.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, info, warn};

use policy_qa_core::chunk::{chunk_document, ChunkParams};
use policy_qa_core::embedding::EmbeddingModel;
use policy_qa_core::error::{IndexError, RetrieveError};
use policy_qa_core::index::VectorIndex;
use policy_qa_core::llm::LanguageModel;
use policy_qa_core::models::{
    AnswerResult, Chunk, ConversationTurn, Document, EmbeddingVector, RetrievedPassage,
    SourceDescriptor,
};
use policy_qa_core::retrieve::{prepare_query, Retriever};

use crate::answer::{AnswerComposer, AnswerError, RetryPolicy};
use crate::config::{Config, RetrievalConfig};
use crate::loader::DocumentLoader;
use crate::progress::{IngestProgressEvent, IngestProgressReporter};

/// One question from a caller, with the caller's conversation so far.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query_text: String,
    pub history: Vec<ConversationTurn>,
    /// Overrides `retrieval.top_k` when set.
    pub top_k: Option<usize>,
    /// Overrides `retrieval.similarity_threshold` when set.
    pub similarity_threshold: Option<f32>,
}

impl QueryRequest {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            history: Vec::new(),
            top_k: None,
            similarity_threshold: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }
}

/// A query that could not produce any [`AnswerResult`].
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),
    #[error(transparent)]
    Answer(#[from] AnswerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Load,
    Embed,
}

/// A source or chunk that was skipped during refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestFailure {
    pub stage: IngestStage,
    /// Source path/URL for load failures, chunk id for embed failures.
    pub location: String,
    pub error: String,
}

/// Aggregated outcome of a refresh, reported after the batch completes.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub sources_requested: usize,
    pub sources_loaded: usize,
    pub documents: usize,
    pub chunks: usize,
    pub embedded: usize,
    pub failures: Vec<IngestFailure>,
    /// Generation of the new index, `None` when the previous one was kept.
    pub generation: Option<u64>,
}

impl IngestReport {
    pub fn committed(&self) -> bool {
        self.generation.is_some()
    }
}

pub struct RagPipeline {
    loader: DocumentLoader,
    chunking: ChunkParams,
    batch_size: usize,
    retrieval: RetrievalConfig,
    retriever: Retriever,
    composer: AnswerComposer,
}

impl RagPipeline {
    /// Assemble a pipeline over `index` with the given collaborators.
    pub fn new(
        config: &Config,
        embedder: Arc<dyn EmbeddingModel>,
        llm: Arc<dyn LanguageModel>,
        index: Arc<VectorIndex>,
    ) -> Result<Self> {
        Ok(Self {
            loader: DocumentLoader::new(&config.sources)?,
            chunking: config.chunking.params()?,
            batch_size: config.embedding.batch_size.max(1),
            retrieval: config.retrieval.clone(),
            retriever: Retriever::new(embedder, index),
            composer: AnswerComposer::new(
                llm,
                config.prompt_config(),
                RetryPolicy::from_config(&config.llm),
            ),
        })
    }

    /// Replace the default backoff schedule (tests use a zero delay).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        let prompt = self.composer.prompt_config().clone();
        self.composer = AnswerComposer::new(self.composer.language_model(), prompt, retry);
        self
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        self.retriever.index()
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingModel> {
        self.retriever.embedder()
    }

    /// Rebuild the index from `sources`.
    ///
    /// Per-source and per-chunk failures are collected in the report; only
    /// a concurrent refresh or an invalid batch (duplicate ids, mixed
    /// dimensions) fails the call, and then the previous index stays live.
    pub async fn refresh(
        &self,
        sources: &[SourceDescriptor],
        progress: &dyn IngestProgressReporter,
    ) -> Result<IngestReport, IndexError> {
        let guard = self.index().begin_rebuild()?;
        let mut report = IngestReport {
            sources_requested: sources.len(),
            ..Default::default()
        };

        let mut documents: Vec<Document> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for source in sources {
            progress.report(IngestProgressEvent::Loading {
                source: source.location.clone(),
            });
            let loaded = self.loader.load(std::slice::from_ref(source)).await;
            report.sources_loaded += loaded.loaded_sources();
            for failure in loaded.failures {
                report.failures.push(IngestFailure {
                    stage: IngestStage::Load,
                    location: failure.location().to_string(),
                    error: failure.to_string(),
                });
            }
            for doc in loaded.documents {
                if seen.insert(doc.id.clone()) {
                    documents.push(doc);
                } else {
                    debug!(source = %doc.source_uri, page = ?doc.page, "skipping duplicate document");
                }
            }
        }
        report.documents = documents.len();

        let chunks: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| chunk_document(doc, &self.chunking))
            .collect();
        report.chunks = chunks.len();
        drop(documents);

        let items = self.embed_chunks(chunks, progress, &mut report).await;
        report.embedded = items.len();

        if items.is_empty() {
            warn!(
                failures = report.failures.len(),
                "refresh produced no embedded chunks, keeping the previous index"
            );
            return Ok(report);
        }

        let generation = guard.commit(items)?;
        progress.report(IngestProgressEvent::Committed {
            chunks: report.embedded as u64,
            generation,
        });
        info!(
            generation,
            chunks = report.embedded,
            documents = report.documents,
            failures = report.failures.len(),
            "index rebuilt"
        );
        report.generation = Some(generation);
        Ok(report)
    }

    async fn embed_chunks(
        &self,
        chunks: Vec<Chunk>,
        progress: &dyn IngestProgressReporter,
        report: &mut IngestReport,
    ) -> Vec<(Chunk, EmbeddingVector)> {
        let embedder = self.embedder();
        let total = chunks.len() as u64;
        let mut items = Vec::with_capacity(chunks.len());
        let mut done = 0u64;

        let mut pending = chunks.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<Chunk> = pending.by_ref().take(self.batch_size).collect();
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            done += batch.len() as u64;

            match embedder.embed_batch(&texts).await {
                Ok(vectors) => items.extend(batch.into_iter().zip(vectors)),
                Err(e) => {
                    warn!(
                        batch = batch.len(),
                        error = %e,
                        "batch embedding failed, retrying chunk by chunk"
                    );
                    for chunk in batch {
                        match embedder.embed(&chunk.text).await {
                            Ok(vector) => items.push((chunk, vector)),
                            Err(e) => {
                                warn!(chunk = %chunk.id, error = %e, "skipping chunk");
                                report.failures.push(IngestFailure {
                                    stage: IngestStage::Embed,
                                    location: chunk.id.clone(),
                                    error: e.to_string(),
                                });
                            }
                        }
                    }
                }
            }
            progress.report(IngestProgressEvent::Embedding { n: done, total });
        }
        items
    }

    /// Ranked passages for `query_text`. See [`Retriever::retrieve`].
    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<RetrievedPassage>, RetrieveError> {
        self.retriever
            .retrieve(query_text, top_k, similarity_threshold)
            .await
    }

    /// Compose an answer from already retrieved passages.
    pub async fn answer(
        &self,
        query_text: &str,
        passages: &[RetrievedPassage],
        history: &[ConversationTurn],
    ) -> Result<AnswerResult, AnswerError> {
        self.composer.answer(query_text, passages, history).await
    }

    /// Retrieve and answer in one call.
    ///
    /// A language model that stays unreachable through the retry budget
    /// yields an [`AnswerResult::unavailable`] result rather than an error.
    pub async fn query(&self, request: &QueryRequest) -> Result<AnswerResult, QueryError> {
        let (query, passages) = self.retrieve_for(request).await?;
        let outcome = self.answer(&query, &passages, &request.history).await;
        settle(outcome)
    }

    /// [`query`](Self::query) with the answer text handed to `on_delta` as
    /// the model generates it. Refusals are returned without any delta.
    /// A stream that breaks after partial output also yields the
    /// unavailable result; the caller has already shown the partial text.
    pub async fn query_streaming(
        &self,
        request: &QueryRequest,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<AnswerResult, QueryError> {
        let (query, passages) = self.retrieve_for(request).await?;
        let outcome = self
            .composer
            .answer_streaming(&query, &passages, &request.history, on_delta)
            .await;
        settle(outcome)
    }

    async fn retrieve_for(
        &self,
        request: &QueryRequest,
    ) -> Result<(String, Vec<RetrievedPassage>), QueryError> {
        let top_k = request.top_k.unwrap_or(self.retrieval.top_k);
        let threshold = request
            .similarity_threshold
            .unwrap_or(self.retrieval.similarity_threshold);
        let query = prepare_query(&request.query_text)?;

        debug!(state = "retrieving", top_k, threshold, "query");
        let passages = self.retrieve(&query, top_k, threshold).await?;

        if passages.is_empty() {
            debug!(state = "refusing", "query");
        } else {
            debug!(
                state = "composing",
                passages = passages.len(),
                best = passages[0].similarity_score,
                "query"
            );
        }
        Ok((query, passages))
    }
}

fn settle(outcome: Result<AnswerResult, AnswerError>) -> Result<AnswerResult, QueryError> {
    match outcome {
        Ok(result) => {
            debug!(state = "done", grounded = result.grounded, status = ?result.status, "query");
            Ok(result)
        }
        Err(e @ (AnswerError::Exhausted { .. } | AnswerError::Interrupted(_))) => {
            warn!(error = %e, "language model unavailable, returning unavailable result");
            Ok(AnswerResult::unavailable())
        }
        Err(e) => Err(e.into()),
    }
}
