//! In-memory [`SearchIndex`] for tests and embedding in other programs.
//!
//! Writes land in a pending buffer and only become searchable after
//! [`refresh`](SearchIndex::refresh), the way near-real-time search engines
//! behave. Lexical scoring is plain term frequency over [`tokenize`]d text.
//! Dense and sparse search are brute force.
//!
//! Test hooks: [`InMemoryIndex::fail_next_writes`] makes upserts fail,
//! [`InMemoryIndex::search_calls`] counts searches per modality, and
//! [`InMemoryIndex::set_reachable`] makes [`ping`](SearchIndex::ping) fail.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{rank_hits, DocumentEntry, IndexHit, IndexedChunk, SearchIndex};
use crate::embedding::cosine_similarity;
use crate::models::{ChunkRecord, Modality, SparseVector};
use crate::sparse::{sparse_dot, tokenize};

#[derive(Default)]
struct State {
    visible: BTreeMap<String, ChunkRecord>,
    /// `None` marks a pending removal.
    pending: BTreeMap<String, Option<ChunkRecord>>,
    documents: BTreeMap<String, DocumentEntry>,
    failing_writes: usize,
    write_attempts: usize,
    search_calls: HashMap<Modality, usize>,
    unreachable: bool,
}

impl State {
    /// Ids of `source_id` as they will be after the next refresh.
    fn current_ids(&self, source_id: &str) -> Vec<String> {
        let mut ids: BTreeSet<String> = self
            .visible
            .values()
            .filter(|r| r.chunk.source_id == source_id)
            .map(|r| r.chunk.chunk_id.clone())
            .collect();
        for (id, entry) in &self.pending {
            match entry {
                Some(r) if r.chunk.source_id == source_id => {
                    ids.insert(id.clone());
                }
                _ => {
                    ids.remove(id);
                }
            }
        }
        ids.into_iter().collect()
    }

    fn exists(&self, chunk_id: &str) -> bool {
        match self.pending.get(chunk_id) {
            Some(entry) => entry.is_some(),
            None => self.visible.contains_key(chunk_id),
        }
    }

    fn count_search(&mut self, modality: Modality) {
        *self.search_calls.entry(modality).or_insert(0) += 1;
    }
}

#[derive(Default)]
pub struct InMemoryIndex {
    state: Mutex<State>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` upserts fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.state().failing_writes = n;
    }

    /// Total upsert attempts, including failed ones.
    pub fn write_attempts(&self) -> usize {
        self.state().write_attempts
    }

    pub fn search_calls(&self, modality: Modality) -> usize {
        self.state()
            .search_calls
            .get(&modality)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// Search-visible chunk ids of `source_id`, sorted.
    pub fn visible_ids(&self, source_id: &str) -> Vec<String> {
        self.state()
            .visible
            .values()
            .filter(|r| r.chunk.source_id == source_id)
            .map(|r| r.chunk.chunk_id.clone())
            .collect()
    }

    pub fn visible_record(&self, chunk_id: &str) -> Option<ChunkRecord> {
        self.state().visible.get(chunk_id).cloned()
    }

    pub fn document(&self, source_id: &str) -> Option<DocumentEntry> {
        self.state().documents.get(source_id).cloned()
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn upsert(&self, record: &ChunkRecord) -> Result<()> {
        let mut state = self.state();
        state.write_attempts += 1;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            bail!("injected write failure for {}", record.chunk.chunk_id);
        }
        state
            .pending
            .insert(record.chunk.chunk_id.clone(), Some(record.clone()));
        Ok(())
    }

    async fn record_document(&self, entry: &DocumentEntry) -> Result<()> {
        self.state()
            .documents
            .insert(entry.source_id.clone(), entry.clone());
        Ok(())
    }

    async fn delete_stale(&self, source_id: &str, keep: &[String]) -> Result<usize> {
        let stale: Vec<String> = {
            let state = self.state();
            state
                .current_ids(source_id)
                .into_iter()
                .filter(|id| !keep.contains(id))
                .collect()
        };
        self.remove(&stale).await
    }

    async fn remove(&self, chunk_ids: &[String]) -> Result<usize> {
        let mut state = self.state();
        let mut removed = 0;
        for id in chunk_ids {
            if state.exists(id) {
                removed += 1;
                state.pending.insert(id.clone(), None);
            }
        }
        Ok(removed)
    }

    async fn refresh(&self) -> Result<()> {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.pending);
        for (id, entry) in pending {
            match entry {
                Some(record) => {
                    state.visible.insert(id, record);
                }
                None => {
                    state.visible.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn count_chunks(&self, source_id: &str) -> Result<usize> {
        Ok(self
            .state()
            .visible
            .values()
            .filter(|r| r.chunk.source_id == source_id)
            .count())
    }

    async fn search_lexical(&self, query: &str, top_k: usize) -> Result<Vec<IndexHit>> {
        let mut state = self.state();
        state.count_search(Modality::Lexical);
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        let hits = state
            .visible
            .values()
            .filter_map(|r| {
                let tf = tokenize(&r.chunk.text)
                    .iter()
                    .filter(|t| terms.contains(*t))
                    .count();
                (tf > 0).then(|| IndexHit {
                    chunk_id: r.chunk.chunk_id.clone(),
                    score: tf as f64,
                })
            })
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn search_dense(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>> {
        let mut state = self.state();
        state.count_search(Modality::Dense);
        let hits = state
            .visible
            .values()
            .map(|r| IndexHit {
                chunk_id: r.chunk.chunk_id.clone(),
                score: cosine_similarity(vector, &r.dense) as f64,
            })
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn search_sparse(&self, vector: &SparseVector, top_k: usize) -> Result<Vec<IndexHit>> {
        let mut state = self.state();
        state.count_search(Modality::Sparse);
        let hits = state
            .visible
            .values()
            .filter_map(|r| {
                let score = sparse_dot(vector, &r.sparse);
                (score > 0.0).then(|| IndexHit {
                    chunk_id: r.chunk.chunk_id.clone(),
                    score,
                })
            })
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<IndexedChunk>> {
        let state = self.state();
        Ok(chunk_ids
            .iter()
            .filter_map(|id| state.visible.get(id))
            .map(|r| IndexedChunk {
                chunk: r.chunk.clone(),
                source_url: state
                    .documents
                    .get(&r.chunk.source_id)
                    .and_then(|d| d.source_url.clone()),
            })
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        if self.state().unreachable {
            bail!("index unreachable");
        }
        Ok(())
    }
}
