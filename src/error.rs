//! Error taxonomy for ingestion and question answering.
//!
//! Ingestion errors are collected into per-document reports and never abort
//! a batch. Query errors are surfaced to the caller; a degraded answer
//! (fewer legs) is not an error.

use thiserror::Error;

use crate::models::Modality;

/// A document could not be turned into text.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("document is not valid UTF-8 text: {0}")]
    Encoding(String),
}

/// The dense or sparse model call failed or returned malformed output.
#[derive(Debug, Error)]
pub enum RepresentationError {
    #[error("dense embedding failed: {0}")]
    Dense(String),

    #[error("sparse expansion failed: {0}")]
    Sparse(String),

    #[error("dense vector has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("{model} returned {actual} vectors for {expected} inputs")]
    Count {
        model: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("malformed {0} representation: {1}")]
    Malformed(&'static str, String),

    #[error("{0} model call timed out after {1} ms")]
    Timeout(&'static str, u64),
}

/// The index backend rejected a write after all retries.
#[derive(Debug, Error)]
#[error("index write for {chunk_id} failed after {attempts} attempts: {message}")]
pub struct IndexWriteError {
    pub chunk_id: String,
    pub attempts: u32,
    pub message: String,
}

/// A single retrieval leg did not produce a list.
#[derive(Debug, Error)]
pub enum ModalityError {
    #[error("{modality} retrieval timed out after {timeout_ms} ms")]
    Timeout { modality: Modality, timeout_ms: u64 },

    #[error("{modality} retrieval failed: {message}")]
    Failed { modality: Modality, message: String },
}

impl ModalityError {
    pub fn modality(&self) -> Modality {
        match self {
            ModalityError::Timeout { modality, .. } | ModalityError::Failed { modality, .. } => {
                *modality
            }
        }
    }
}

/// No fusion was possible for a question.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("question must not be empty")]
    EmptyQuestion,

    #[error("all retrieval modalities failed: {}", join_failures(.0))]
    AllModalitiesFailed(Vec<ModalityError>),

    #[error("failed to load fused chunks from index: {0}")]
    Index(String),
}

fn join_failures(failures: &[ModalityError]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The language model call failed. No answer text is produced.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generation response was malformed: {0}")]
    Malformed(String),

    #[error("generation timed out after {0} s")]
    Timeout(u64),
}

/// A whole document could not be ingested.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("source fetch failed for {source_id}: {message}")]
    Source { source_id: String, message: String },

    #[error("text extraction failed for {source_id}: {error}")]
    Extraction {
        source_id: String,
        #[source]
        error: ExtractionError,
    },

    #[error("unknown document: {0}")]
    UnknownDocument(String),

    #[error("index error for {source_id}: {message}")]
    Index { source_id: String, message: String },

    #[error("{source_id}: wrote {written} chunks but {visible} are queryable after refresh")]
    Visibility {
        source_id: String,
        written: usize,
        visible: usize,
    },
}

/// Error for the full question → answer flow.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}
