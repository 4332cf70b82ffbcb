//! Flat in-memory vector index with copy-then-swap rebuilds.
//!
//! The index owns every embedded [`Chunk`] together with its vector. The
//! live content is an immutable [`IndexSnapshot`] behind
//! `RwLock<Arc<IndexSnapshot>>`:
//!
//! - Readers clone the `Arc` (a pointer copy under a read lock) and then
//!   search without holding any lock, so a query sees exactly one snapshot
//!   for its whole lifetime.
//! - [`VectorIndex::rebuild`] builds a complete new snapshot off to the side
//!   and swaps the pointer in one write-locked assignment. Readers observe
//!   either the old or the new content, never a mix.
//! - Only one rebuild may be in flight; a second [`VectorIndex::begin_rebuild`]
//!   fails with [`IndexError::RebuildInProgress`].
//!
//! Vectors are normalized on insertion, so search is a plain dot product.
//! Results are ordered by descending score, then ascending
//! `sequence_index`, then ascending `document_id`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::embedding::{dot, normalize};
use crate::error::IndexError;
use crate::models::{Chunk, EmbeddingVector};

/// A stored chunk and its unit-length vector.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: EmbeddingVector,
}

/// One search result: chunk id and cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

/// Immutable view of the index content at one generation.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    generation: u64,
    dims: Option<usize>,
    entries: Vec<IndexEntry>,
    positions: HashMap<String, usize>,
}

impl IndexSnapshot {
    /// Build a snapshot from `(chunk, vector)` pairs, validating every pair.
    pub fn build(
        generation: u64,
        items: impl IntoIterator<Item = (Chunk, EmbeddingVector)>,
    ) -> Result<Self, IndexError> {
        let mut snapshot = IndexSnapshot {
            generation,
            ..Default::default()
        };
        for (chunk, vector) in items {
            snapshot.insert(chunk, vector)?;
        }
        Ok(snapshot)
    }

    /// Monotonic counter, bumped on every add and rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Vector dimensionality, or `None` while empty.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn get(&self, chunk_id: &str) -> Option<&IndexEntry> {
        self.positions.get(chunk_id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.positions.contains_key(chunk_id)
    }

    /// Nearest neighbours of `query` by cosine similarity.
    ///
    /// Returns at most `top_k` hits; fewer when the snapshot is smaller.
    /// An empty snapshot yields no hits for any query.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if top_k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.dims {
            if query.len() != expected {
                return Err(IndexError::QueryDimension {
                    expected,
                    actual: query.len(),
                });
            }
        }
        let q = normalize(query).ok_or_else(|| IndexError::ZeroVector("query".to_string()))?;

        let mut scored: Vec<(f32, &IndexEntry)> = self
            .entries
            .iter()
            .map(|e| (dot(&q, &e.vector).clamp(-1.0, 1.0), e))
            .collect();

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.chunk.sequence_index.cmp(&b.1.chunk.sequence_index))
                .then_with(|| a.1.chunk.document_id.cmp(&b.1.chunk.document_id))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, e)| SearchHit {
                chunk_id: e.chunk.id.clone(),
                score,
            })
            .collect())
    }

    fn insert(&mut self, chunk: Chunk, vector: EmbeddingVector) -> Result<(), IndexError> {
        if self.positions.contains_key(&chunk.id) {
            return Err(IndexError::DuplicateId(chunk.id));
        }
        if let Some(expected) = self.dims {
            if vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    chunk_id: chunk.id,
                    expected,
                    actual: vector.len(),
                });
            }
        }
        let vector = normalize(&vector).ok_or_else(|| IndexError::ZeroVector(chunk.id.clone()))?;

        self.dims = Some(vector.len());
        self.positions.insert(chunk.id.clone(), self.entries.len());
        self.entries.push(IndexEntry { chunk, vector });
        Ok(())
    }
}

/// Shared, concurrently readable vector index.
#[derive(Debug, Default)]
pub struct VectorIndex {
    current: RwLock<Arc<IndexSnapshot>>,
    rebuilding: AtomicBool,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already built snapshot (e.g. one loaded from disk).
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            rebuilding: AtomicBool::new(false),
        }
    }

    /// The current snapshot. Holding it pins that generation for as long
    /// as the caller needs; later swaps do not affect it.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Insert one chunk. Fails with [`IndexError::DuplicateId`] if the id is
    /// already present, and with [`IndexError::RebuildInProgress`] while a
    /// rebuild is pending (its swap would discard the insert).
    ///
    /// Readers holding an older snapshot keep seeing it unchanged.
    pub fn add(&self, chunk: Chunk, vector: EmbeddingVector) -> Result<(), IndexError> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if self.rebuilding.load(Ordering::Acquire) {
            return Err(IndexError::RebuildInProgress);
        }
        let snapshot = Arc::make_mut(&mut *guard);
        snapshot.insert(chunk, vector)?;
        snapshot.generation += 1;
        Ok(())
    }

    /// Search the current snapshot.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.snapshot().search(query, top_k)
    }

    /// Claim the single rebuild slot. The slot is released when the
    /// returned guard is committed or dropped.
    pub fn begin_rebuild(&self) -> Result<RebuildGuard<'_>, IndexError> {
        self.rebuilding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| IndexError::RebuildInProgress)?;
        Ok(RebuildGuard { index: self })
    }

    /// Atomically replace the entire content. Returns the new generation.
    ///
    /// On validation failure the previous content stays live.
    pub fn rebuild(
        &self,
        items: impl IntoIterator<Item = (Chunk, EmbeddingVector)>,
    ) -> Result<u64, IndexError> {
        self.begin_rebuild()?.commit(items)
    }

    /// Publish `next` as the live snapshot under the next generation number.
    fn install(&self, mut next: IndexSnapshot) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        next.generation = guard.generation + 1;
        let generation = next.generation;
        *guard = Arc::new(next);
        generation
    }
}

/// Exclusive right to replace the index content.
#[must_use = "dropping the guard abandons the rebuild"]
pub struct RebuildGuard<'a> {
    index: &'a VectorIndex,
}

impl RebuildGuard<'_> {
    /// Build the new snapshot and swap it in.
    pub fn commit(
        self,
        items: impl IntoIterator<Item = (Chunk, EmbeddingVector)>,
    ) -> Result<u64, IndexError> {
        let next = IndexSnapshot::build(0, items)?;
        Ok(self.index.install(next))
    }

    /// Swap in a snapshot that was built elsewhere (e.g. loaded from disk).
    pub fn commit_snapshot(self, snapshot: IndexSnapshot) -> u64 {
        self.index.install(snapshot)
    }
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.index.rebuilding.store(false, Ordering::Release);
    }
}
