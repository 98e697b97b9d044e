//! Ingestion pipeline.
//!
//! For one document: fetch → extract → chunk → represent → write → prune
//! stale chunks → refresh → verify visibility. Failures of single chunks are
//! collected in the [`DocumentReport`]; only failures that affect the whole
//! document become an [`IngestionError`].

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chunk::chunk_document;
use crate::config::ChunkingConfig;
use crate::error::{IndexWriteError, IngestionError};
use crate::extract::extract_text;
use crate::index::{DocumentEntry, SearchIndex};
use crate::models::{Chunk, ChunkRecord, DocumentRef};
use crate::represent::RepresentationBuilder;
use crate::sources::DocumentSource;

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentReport {
    pub source_id: String,
    pub filename: String,
    /// Chunks produced by the chunker.
    pub chunks_total: usize,
    /// Chunks written with all representations and visible to search.
    pub chunks_written: usize,
    /// Chunks rejected by representation or by the index.
    pub chunks_skipped: usize,
    /// Previously indexed chunks removed because this pass did not write them.
    pub chunks_removed: usize,
    pub errors: Vec<String>,
}

/// Outcome of a batch ingestion.
#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub documents: Vec<DocumentReport>,
    /// `(source_id or connector, error)` for documents that were not ingested.
    pub failures: Vec<(String, String)>,
}

impl IngestReport {
    pub fn chunks_written(&self) -> usize {
        self.documents.iter().map(|d| d.chunks_written).sum()
    }

    pub fn chunks_skipped(&self) -> usize {
        self.documents.iter().map(|d| d.chunks_skipped).sum()
    }

    pub fn chunks_removed(&self) -> usize {
        self.documents.iter().map(|d| d.chunks_removed).sum()
    }

    pub fn print(&self) {
        println!("ingest");
        println!("  documents ingested: {}", self.documents.len());
        println!("  chunks written: {}", self.chunks_written());
        println!("  chunks skipped: {}", self.chunks_skipped());
        println!("  chunks removed: {}", self.chunks_removed());
        for doc in self.documents.iter().filter(|d| !d.errors.is_empty()) {
            println!("  {}:", doc.source_id);
            for err in &doc.errors {
                println!("    skipped: {}", err);
            }
        }
        if !self.failures.is_empty() {
            println!("  failed documents: {}", self.failures.len());
            for (id, err) in &self.failures {
                println!("    {}: {}", id, err);
            }
        }
        println!("ok");
    }
}

/// Writes records to the index, retrying with exponential backoff.
#[derive(Clone)]
pub struct IndexWriter {
    index: Arc<dyn SearchIndex>,
    retries: u32,
    backoff: Duration,
}

impl IndexWriter {
    pub fn new(index: Arc<dyn SearchIndex>, retries: u32, backoff: Duration) -> Self {
        Self {
            index,
            retries,
            backoff,
        }
    }

    pub async fn write(&self, record: &ChunkRecord) -> Result<(), IndexWriteError> {
        let mut last_err = String::new();
        let attempts = self.retries + 1;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(retry_delay(self.backoff, attempt)).await;
            }
            match self.index.upsert(record).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        chunk_id = %record.chunk.chunk_id,
                        attempt,
                        error = %e,
                        "Index write failed"
                    );
                    last_err = format!("{:#}", e);
                }
            }
        }

        Err(IndexWriteError {
            chunk_id: record.chunk.chunk_id.clone(),
            attempts,
            message: last_err,
        })
    }
}

/// Per-document ingestion pipeline.
#[derive(Clone)]
pub struct Ingestor {
    pub(crate) builder: RepresentationBuilder,
    pub(crate) writer: IndexWriter,
    pub(crate) index: Arc<dyn SearchIndex>,
    pub(crate) chunking: ChunkingConfig,
    pub(crate) batch_size: usize,
    pub(crate) representation_concurrency: usize,
}

impl Ingestor {
    pub async fn ingest(
        &self,
        source: &dyn DocumentSource,
        doc: &DocumentRef,
    ) -> Result<DocumentReport, IngestionError> {
        let source_id = doc.source_id.as_str();

        let bytes = source
            .fetch(doc)
            .await
            .map_err(|e| IngestionError::Source {
                source_id: source_id.to_string(),
                message: format!("{:#}", e),
            })?;
        let content_hash = hash_bytes(&bytes);

        let text =
            extract_text(&bytes, &doc.content_type).map_err(|error| IngestionError::Extraction {
                source_id: source_id.to_string(),
                error,
            })?;

        let chunks = chunk_document(source_id, &doc.filename, &text, &self.chunking);
        debug!(source_id, chunks = chunks.len(), "Chunked document");

        let jobs: Vec<_> = chunks
            .chunks(self.batch_size.max(1))
            .map(|b| {
                let batch: Vec<Chunk> = b.to_vec();
                let builder = self.builder.clone();
                async move { builder.build(&batch).await }
            })
            .collect();
        let built: Vec<_> = stream::iter(jobs)
            .buffered(self.representation_concurrency.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        let mut report = DocumentReport {
            source_id: source_id.to_string(),
            filename: doc.filename.clone(),
            chunks_total: chunks.len(),
            ..Default::default()
        };
        let mut written_ids = Vec::with_capacity(chunks.len());

        for (chunk, result) in chunks.iter().zip(built) {
            let outcome = match result {
                Ok(record) => self
                    .writer
                    .write(&record)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(format!("{}: {}", chunk.chunk_id, e)),
            };
            match outcome {
                Ok(()) => written_ids.push(chunk.chunk_id.clone()),
                Err(message) => {
                    warn!(chunk_id = %chunk.chunk_id, error = %message, "Skipping chunk");
                    report.errors.push(message);
                }
            }
        }
        report.chunks_written = written_ids.len();
        report.chunks_skipped = chunks.len() - written_ids.len();

        // Ids from a previous, longer version and ids whose new record
        // failed both go: neither may keep serving old text.
        let index_err = |e: anyhow::Error| IngestionError::Index {
            source_id: source_id.to_string(),
            message: format!("{:#}", e),
        };
        report.chunks_removed = self
            .index
            .delete_stale(source_id, &written_ids)
            .await
            .map_err(index_err)?;

        self.index
            .record_document(&DocumentEntry {
                source_id: source_id.to_string(),
                filename: doc.filename.clone(),
                source_url: doc.source_url.clone(),
                content_type: doc.content_type.clone(),
                content_hash,
                chunk_count: written_ids.len(),
                ingested_at: chrono::Utc::now().timestamp(),
            })
            .await
            .map_err(index_err)?;

        self.index.refresh().await.map_err(index_err)?;
        let visible = self
            .index
            .count_chunks(source_id)
            .await
            .map_err(index_err)?;
        if visible != written_ids.len() {
            return Err(IngestionError::Visibility {
                source_id: source_id.to_string(),
                written: written_ids.len(),
                visible,
            });
        }

        info!(
            source_id,
            written = report.chunks_written,
            skipped = report.chunks_skipped,
            removed = report.chunks_removed,
            "Ingested document"
        );
        Ok(report)
    }
}

/// Delay before `attempt` (2 or later): `backoff` doubled per retry, capped
/// at 32x and saturating instead of overflowing.
fn retry_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(1u32 << attempt.saturating_sub(2).min(5))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
