//! Search index abstraction.
//!
//! The [`SearchIndex`] trait is the single seam between the engine and the
//! storage backend. Writes only accept complete [`ChunkRecord`]s, so text,
//! dense vector, and sparse expansion are always stored together.
//!
//! Backends may separate "write accepted" from "write visible to search".
//! Callers must invoke [`SearchIndex::refresh`] before they rely on a write
//! being returned by the `search_*` methods or by
//! [`SearchIndex::count_chunks`].
//!
//! Implementations:
//! - [`SqliteIndex`]: on-disk index (FTS5 BM25, brute-force cosine,
//!   term-table sparse dot product).
//! - [`InMemoryIndex`]: for tests; models refresh-gated visibility and can
//!   inject write failures.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Chunk, ChunkRecord, SparseVector};

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;

/// One scored entry from a single search method, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub chunk_id: String,
    /// Backend-native score (BM25, cosine, dot product). Higher is better.
    pub score: f64,
}

/// A chunk loaded back from the index together with document metadata.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub source_url: Option<String>,
}

/// Per-document bookkeeping written after a document's chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentEntry {
    pub source_id: String,
    pub filename: String,
    pub source_url: Option<String>,
    pub content_type: String,
    /// SHA-256 of the raw document bytes.
    pub content_hash: String,
    pub chunk_count: usize,
    /// Unix timestamp (seconds).
    pub ingested_at: i64,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace the record stored under `record.chunk.chunk_id`.
    async fn upsert(&self, record: &ChunkRecord) -> Result<()>;

    /// Insert or replace a document's bookkeeping row.
    async fn record_document(&self, entry: &DocumentEntry) -> Result<()>;

    /// Remove every chunk of `source_id` whose id is not in `keep`.
    /// Returns the number of removed chunks.
    async fn delete_stale(&self, source_id: &str, keep: &[String]) -> Result<usize>;

    /// Remove the given chunk ids. Missing ids are ignored.
    async fn remove(&self, chunk_ids: &[String]) -> Result<usize>;

    /// Make all accepted writes visible to search.
    async fn refresh(&self) -> Result<()>;

    /// Number of search-visible chunks belonging to `source_id`.
    async fn count_chunks(&self, source_id: &str) -> Result<usize>;

    async fn search_lexical(&self, query: &str, top_k: usize) -> Result<Vec<IndexHit>>;

    async fn search_dense(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>>;

    async fn search_sparse(&self, vector: &SparseVector, top_k: usize) -> Result<Vec<IndexHit>>;

    /// Load chunks by id, in the order requested. Unknown ids are skipped.
    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<IndexedChunk>>;

    /// Verify the backend is reachable.
    async fn ping(&self) -> Result<()>;
}

/// Sort hits best-first with `chunk_id` as the tie-break, then keep `top_k`.
pub(crate) fn rank_hits(mut hits: Vec<IndexHit>, top_k: usize) -> Vec<IndexHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(top_k);
    hits
}
