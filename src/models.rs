//! Core data models used throughout the engine.
//!
//! Documents and chunks flow through the ingestion pipeline; hits, fused
//! results, and citations only live for the duration of one question.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A document advertised by a source connector, before it is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    /// Stable identifier (relative path or `gdrive:<file id>`).
    pub source_id: String,
    /// Display name used in citations.
    pub filename: String,
    /// Web-browsable URL, if the source has one.
    pub source_url: Option<String>,
    /// MIME type used to pick the extractor.
    pub content_type: String,
}

/// A passage of extracted document text. Carries no representations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub source_id: String,
    pub source_filename: String,
    pub sequence_index: i64,
    /// Offset of the first character, counted in chars of the extracted text.
    pub char_offset: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Builds the deterministic chunk id for a document position.
pub fn chunk_id(source_id: &str, sequence_index: i64) -> String {
    format!("{}#{}", source_id, sequence_index)
}

/// Term → weight mapping produced by the sparse semantic model.
///
/// Ordered so that serialization and iteration are reproducible.
pub type SparseVector = BTreeMap<String, f32>;

/// A chunk together with all of its retrieval representations.
///
/// This is the only thing the index accepts, so a chunk can never be
/// written with a subset of its representations.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
}

/// One of the three retrieval legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Lexical,
    Dense,
    Sparse,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::Lexical, Modality::Dense, Modality::Sparse];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Lexical => "lexical",
            Modality::Dense => "dense",
            Modality::Sparse => "sparse",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which legs a question fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    #[default]
    Hybrid,
    LexicalOnly,
    DenseOnly,
    #[serde(alias = "elser_only")]
    SparseOnly,
}

impl RetrievalMode {
    /// The legs this mode executes, in a fixed order.
    pub fn modalities(&self) -> &'static [Modality] {
        match self {
            RetrievalMode::Hybrid => &Modality::ALL,
            RetrievalMode::LexicalOnly => &[Modality::Lexical],
            RetrievalMode::DenseOnly => &[Modality::Dense],
            RetrievalMode::SparseOnly => &[Modality::Sparse],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Hybrid => "hybrid",
            RetrievalMode::LexicalOnly => "lexical_only",
            RetrievalMode::DenseOnly => "dense_only",
            RetrievalMode::SparseOnly => "sparse_only",
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hybrid" => Ok(RetrievalMode::Hybrid),
            "lexical_only" => Ok(RetrievalMode::LexicalOnly),
            "dense_only" => Ok(RetrievalMode::DenseOnly),
            // The sparse leg was historically called "elser".
            "sparse_only" | "elser_only" => Ok(RetrievalMode::SparseOnly),
            other => Err(format!(
                "Unknown retrieval mode: '{}'. Use hybrid, lexical_only, dense_only, or sparse_only.",
                other
            )),
        }
    }
}

/// A single ranked hit from one modality. `rank` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalHit {
    pub chunk_id: String,
    pub modality: Modality,
    pub rank: usize,
    /// Backend-native score; never compared across modalities.
    pub score: f64,
}

/// A chunk's position in the fused ordering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedHit {
    pub chunk_id: String,
    pub fused_score: f64,
    /// `(modality, rank)` for every list the chunk appeared in.
    pub contributions: Vec<(Modality, usize)>,
}

impl FusedHit {
    pub fn best_rank(&self) -> usize {
        self.contributions
            .iter()
            .map(|(_, r)| *r)
            .min()
            .unwrap_or(usize::MAX)
    }

    pub fn modalities(&self) -> Vec<Modality> {
        self.contributions.iter().map(|(m, _)| *m).collect()
    }
}

/// A fused hit joined with its chunk text and metadata.
#[derive(Debug, Clone, Serialize)]
pub struct FusedResult {
    pub chunk: Chunk,
    pub source_url: Option<String>,
    pub fused_score: f64,
    pub contributing_modalities: Vec<Modality>,
    /// `(modality, rank)` per contributing list, best rank first.
    pub modality_ranks: Vec<(Modality, usize)>,
}

/// Citation for one chunk included in the assembled context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub source_filename: String,
    pub source_id: String,
    pub chunk_id: String,
    pub snippet: String,
    pub score: f64,
    pub char_offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}
