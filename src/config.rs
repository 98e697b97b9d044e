use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::RetrievalMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sparse: SparseConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    300
}
fn default_overlap_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}
fn default_embedding_model() -> String {
    "all-minilm".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SparseConfig {
    #[serde(default = "default_sparse_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Keep only the highest-weighted terms of each expansion.
    #[serde(default = "default_max_terms")]
    pub max_terms: usize,
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            provider: default_sparse_provider(),
            model: None,
            url: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            max_terms: default_max_terms(),
        }
    }
}

fn default_sparse_provider() -> String {
    "terms".to_string()
}
fn default_max_terms() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// RRF smoothing constant `k` in `1 / (k + rank)`.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Candidates requested from each leg.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Fused results kept after fusion.
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
    #[serde(default = "default_leg_timeout_ms")]
    pub leg_timeout_ms: u64,
    #[serde(default)]
    pub default_mode: RetrievalMode,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            top_k: default_top_k(),
            result_limit: default_result_limit(),
            leg_timeout_ms: default_leg_timeout_ms(),
            default_mode: RetrievalMode::default(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_top_k() -> usize {
    50
}
fn default_result_limit() -> usize {
    5
}
fn default_leg_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_context_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_chars: default_context_max_chars(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_context_max_chars() -> usize {
    6_000
}
fn default_snippet_chars() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Overrides the built-in grounding instructions.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            url: None,
            timeout_secs: default_generation_timeout_secs(),
            system_prompt: None,
        }
    }
}

fn default_generation_provider() -> String {
    "ollama".to_string()
}
fn default_generation_model() -> String {
    "llama3".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Documents processed in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Representation batches in flight per document.
    #[serde(default = "default_concurrency")]
    pub representation_concurrency: usize,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Upper bound for one representation batch, retries included.
    #[serde(default = "default_representation_timeout_secs")]
    pub representation_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            representation_concurrency: default_concurrency(),
            write_retries: default_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            representation_timeout_secs: default_representation_timeout_secs(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_write_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_representation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    pub filesystem: Option<FilesystemConnectorConfig>,
    pub drive: Option<DriveConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.pdf".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveConnectorConfig {
    pub folder_id: String,
    #[serde(default = "default_true")]
    pub recursive: bool,
    #[serde(default = "default_drive_api")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_drive_api() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        bail!(
            "chunking.overlap_chars ({}) must be < chunking.max_chars ({})",
            config.chunking.overlap_chars,
            config.chunking.max_chars
        );
    }

    if config.retrieval.rrf_k <= 0.0 || !config.retrieval.rrf_k.is_finite() {
        bail!("retrieval.rrf_k must be a finite number > 0");
    }
    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.result_limit == 0 {
        bail!("retrieval.result_limit must be >= 1");
    }
    if config.retrieval.leg_timeout_ms == 0 {
        bail!("retrieval.leg_timeout_ms must be > 0");
    }

    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }
    match config.embedding.provider.as_str() {
        "ollama" | "openai" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be ollama, openai, or local.",
            other
        ),
    }

    match config.sparse.provider.as_str() {
        "terms" | "local" => {}
        "http" => {
            if config.sparse.url.is_none() {
                bail!("sparse.url must be set when sparse.provider is 'http'");
            }
        }
        other => bail!(
            "Unknown sparse provider: '{}'. Must be terms, http, or local.",
            other
        ),
    }
    if config.sparse.max_terms == 0 {
        bail!("sparse.max_terms must be >= 1");
    }

    match config.generation.provider.as_str() {
        "ollama" => {}
        other => bail!("Unknown generation provider: '{}'. Must be ollama.", other),
    }

    if config.context.max_chars == 0 {
        bail!("context.max_chars must be > 0");
    }
    if config.ingest.concurrency == 0 || config.ingest.representation_concurrency == 0 {
        bail!("ingest.concurrency and ingest.representation_concurrency must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let text = format!("[index]\npath = \"/tmp/idx.sqlite\"\n{}", extra);
        let config: Config = toml::from_str(&text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.chunking.max_chars, 300);
        assert_eq!(config.chunking.overlap_chars, 50);
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert_eq!(config.retrieval.default_mode, RetrievalMode::Hybrid);
        assert_eq!(config.embedding.dims, 384);
        assert_eq!(config.sparse.provider, "terms");
    }

    #[test]
    fn test_overlap_must_be_less_than_chunk() {
        let err = parse("[chunking]\nmax_chars = 100\noverlap_chars = 100\n").unwrap_err();
        assert!(err.to_string().contains("overlap_chars"));
    }

    #[test]
    fn test_rrf_k_must_be_positive() {
        assert!(parse("[retrieval]\nrrf_k = 0.0\n").is_err());
        assert!(parse("[retrieval]\nrrf_k = -1.0\n").is_err());
        assert!(parse("[retrieval]\nrrf_k = 20.0\n").is_ok());
    }

    #[test]
    fn test_mode_alias() {
        let config = parse("[retrieval]\ndefault_mode = \"elser_only\"\n").unwrap();
        assert_eq!(config.retrieval.default_mode, RetrievalMode::SparseOnly);
    }

    #[test]
    fn test_http_sparse_requires_url() {
        assert!(parse("[sparse]\nprovider = \"http\"\n").is_err());
        assert!(parse("[sparse]\nprovider = \"http\"\nurl = \"http://localhost:9000\"\n").is_ok());
    }

    #[test]
    fn test_unknown_embedding_provider() {
        let err = parse("[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }
}
