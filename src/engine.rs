//! The engine: ingestion and question answering over one index.
//!
//! [`Engine::answer`] runs fan-out → fusion → hydration → context assembly
//! and returns everything a caller needs to build a prompt. [`Engine::ask`]
//! adds the generation call. Every question gets a fresh query id that is
//! attached to its log lines.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{Config, ContextConfig, RetrievalConfig};
use crate::context::{self, AssembledContext};
use crate::embedding::{create_embedder, DenseEmbedder};
use crate::error::{EngineError, IngestionError, ModalityError, RetrievalError};
use crate::fusion::fuse;
use crate::generate::{create_generator, Generator, REFUSAL, SYSTEM_INSTRUCTIONS};
use crate::index::{SearchIndex, SqliteIndex};
use crate::ingest::{DocumentReport, IndexWriter, IngestReport, Ingestor};
use crate::models::{Citation, DocumentRef, FusedResult, Modality, RetrievalMode};
use crate::represent::RepresentationBuilder;
use crate::retrieve::{
    DenseRetriever, FanOut, LexicalRetriever, ModalityRetriever, SparseRetriever,
};
use crate::sources::{build_sources, DocumentSource};
use crate::sparse::{create_sparse_encoder, SparseEncoder};

/// External collaborators the engine is assembled from.
pub struct Collaborators {
    pub index: Arc<dyn SearchIndex>,
    pub embedder: Arc<dyn DenseEmbedder>,
    pub encoder: Arc<dyn SparseEncoder>,
    pub generator: Arc<dyn Generator>,
    pub sources: Vec<Arc<dyn DocumentSource>>,
}

/// Retrieval output for one question, before generation.
#[derive(Debug)]
pub struct AnswerContext {
    pub query_id: String,
    pub mode: RetrievalMode,
    /// Fused, hydrated results in fused order (after `result_limit`).
    pub results: Vec<FusedResult>,
    pub context: AssembledContext,
    /// Legs that timed out or failed.
    pub failures: Vec<ModalityError>,
}

impl AnswerContext {
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failed_modalities(&self) -> Vec<Modality> {
        self.failures.iter().map(|f| f.modality()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub query_id: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub degraded: bool,
    pub failed_modalities: Vec<Modality>,
}

pub struct Engine {
    index: Arc<dyn SearchIndex>,
    sources: Vec<Arc<dyn DocumentSource>>,
    ingestor: Ingestor,
    fan_out: FanOut,
    generator: Arc<dyn Generator>,
    retrieval: RetrievalConfig,
    context: ContextConfig,
    system_instructions: String,
    ingest_concurrency: usize,
}

impl Engine {
    pub fn new(config: &Config, parts: Collaborators) -> Self {
        let Collaborators {
            index,
            embedder,
            encoder,
            generator,
            sources,
        } = parts;

        let builder = RepresentationBuilder::new(
            embedder.clone(),
            encoder.clone(),
            config.embedding.dims,
            Duration::from_secs(config.ingest.representation_timeout_secs),
        );
        let writer = IndexWriter::new(
            index.clone(),
            config.ingest.write_retries,
            Duration::from_millis(config.ingest.retry_backoff_ms),
        );
        let ingestor = Ingestor {
            builder,
            writer,
            index: index.clone(),
            chunking: config.chunking.clone(),
            batch_size: config.embedding.batch_size,
            representation_concurrency: config.ingest.representation_concurrency,
        };

        let fan_out = FanOut::new(
            vec![
                Arc::new(LexicalRetriever::new(index.clone())) as Arc<dyn ModalityRetriever>,
                Arc::new(DenseRetriever::new(index.clone(), embedder)),
                Arc::new(SparseRetriever::new(index.clone(), encoder)),
            ],
            Duration::from_millis(config.retrieval.leg_timeout_ms),
        );

        Self {
            index,
            sources,
            ingestor,
            fan_out,
            generator,
            retrieval: config.retrieval.clone(),
            context: config.context.clone(),
            system_instructions: config
                .generation
                .system_prompt
                .clone()
                .unwrap_or_else(|| SYSTEM_INSTRUCTIONS.to_string()),
            ingest_concurrency: config.ingest.concurrency,
        }
    }

    /// Open the SQLite index and create every collaborator from config.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let index = Arc::new(SqliteIndex::open(&config.index.path).await?);
        let parts = Collaborators {
            index,
            embedder: Arc::from(create_embedder(&config.embedding)?),
            encoder: Arc::from(create_sparse_encoder(&config.sparse)?),
            generator: Arc::from(create_generator(&config.generation)?),
            sources: build_sources(config),
        };
        Ok(Self::new(config, parts))
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    pub fn default_mode(&self) -> RetrievalMode {
        self.retrieval.default_mode
    }

    /// Ingest (or re-ingest) one document by `source_id`.
    pub async fn ingest_document(&self, source_id: &str) -> Result<DocumentReport, IngestionError> {
        for source in &self.sources {
            let docs = match source.list_documents().await {
                Ok(docs) => docs,
                Err(e) => {
                    warn!(connector = source.name(), error = %e, "Listing failed");
                    continue;
                }
            };
            if let Some(doc) = docs.into_iter().find(|d| d.source_id == source_id) {
                return self.ingestor.ingest(source.as_ref(), &doc).await;
            }
        }
        Err(IngestionError::UnknownDocument(source_id.to_string()))
    }

    /// Ingest every document of every source. Never fails as a whole.
    pub async fn ingest_all(&self) -> IngestReport {
        let mut report = IngestReport::default();
        let mut work: Vec<(Arc<dyn DocumentSource>, DocumentRef)> = Vec::new();

        for source in &self.sources {
            match source.list_documents().await {
                Ok(docs) => {
                    info!(connector = source.name(), documents = docs.len(), "Listed documents");
                    work.extend(docs.into_iter().map(|d| (source.clone(), d)));
                }
                Err(e) => {
                    warn!(connector = source.name(), error = %e, "Listing failed");
                    report
                        .failures
                        .push((source.name().to_string(), format!("{:#}", e)));
                }
            }
        }

        // Futures are built up front: a mapping closure inside the stream is
        // not general enough over lifetimes to be spawned from `/ingest`.
        let jobs: Vec<_> = work
            .into_iter()
            .map(|(source, doc)| {
                let ingestor = self.ingestor.clone();
                async move {
                    let outcome = ingestor.ingest(source.as_ref(), &doc).await;
                    (doc.source_id, outcome)
                }
            })
            .collect();

        let outcomes: Vec<(String, Result<DocumentReport, IngestionError>)> = stream::iter(jobs)
            .buffer_unordered(self.ingest_concurrency.max(1))
            .collect()
            .await;

        for (source_id, outcome) in outcomes {
            match outcome {
                Ok(doc_report) => report.documents.push(doc_report),
                Err(e) => {
                    warn!(%source_id, error = %e, "Document ingestion failed");
                    report.failures.push((source_id, e.to_string()));
                }
            }
        }

        report.documents.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        report.failures.sort();
        report
    }

    /// Retrieve, fuse, and assemble the context for `question`.
    pub async fn answer(
        &self,
        question: &str,
        mode: RetrievalMode,
    ) -> Result<AnswerContext, RetrievalError> {
        let query_id = Uuid::new_v4().to_string();
        let span = info_span!("query", %query_id, %mode);
        self.answer_inner(query_id.clone(), question, mode)
            .instrument(span)
            .await
    }

    async fn answer_inner(
        &self,
        query_id: String,
        question: &str,
        mode: RetrievalMode,
    ) -> Result<AnswerContext, RetrievalError> {
        let fan = self
            .fan_out
            .retrieve(question, mode, self.retrieval.top_k)
            .await?;
        let fused = fuse(&fan.lists, self.retrieval.rrf_k, self.retrieval.result_limit);

        let ids: Vec<String> = fused.iter().map(|h| h.chunk_id.clone()).collect();
        let mut hydrated: HashMap<String, _> = self
            .index
            .get_chunks(&ids)
            .await
            .map_err(|e| RetrievalError::Index(format!("{:#}", e)))?
            .into_iter()
            .map(|c| (c.chunk.chunk_id.clone(), c))
            .collect();

        let mut results = Vec::with_capacity(fused.len());
        for hit in fused {
            // A chunk can disappear between search and load when a
            // concurrent re-ingest shrinks its document.
            let Some(indexed) = hydrated.remove(&hit.chunk_id) else {
                warn!(chunk_id = %hit.chunk_id, "Fused chunk no longer in index");
                continue;
            };
            results.push(FusedResult {
                chunk: indexed.chunk,
                source_url: indexed.source_url,
                fused_score: hit.fused_score,
                contributing_modalities: hit.modalities(),
                modality_ranks: hit.contributions,
            });
        }

        let context = context::assemble(
            &results,
            self.context.max_chars,
            self.context.snippet_chars,
        );
        info!(
            results = results.len(),
            cited = context.citations.len(),
            dropped = context.dropped,
            degraded = fan.degraded(),
            "Retrieved context"
        );

        Ok(AnswerContext {
            query_id,
            mode,
            results,
            context,
            failures: fan.failures,
        })
    }

    /// Answer `question` with the generator, grounded on retrieved context.
    ///
    /// With no usable context the fixed refusal is returned and the model is
    /// not called.
    pub async fn ask(&self, question: &str, mode: RetrievalMode) -> Result<Answer, EngineError> {
        let retrieved = self.answer(question, mode).await?;

        let answer = if retrieved.context.is_empty() {
            REFUSAL.to_string()
        } else {
            self.generator
                .generate(&retrieved.context.text, question, &self.system_instructions)
                .instrument(info_span!("generate", query_id = %retrieved.query_id))
                .await?
        };

        Ok(Answer {
            degraded: retrieved.degraded(),
            failed_modalities: retrieved.failed_modalities(),
            query_id: retrieved.query_id,
            answer,
            citations: retrieved.context.citations,
        })
    }
}
