//! Shared fakes for integration tests.
//!
//! The fakes implement the public collaborator traits and count calls so
//! tests can assert which models were (or were not) invoked.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hybrid_rag::config::Config;
use hybrid_rag::embedding::DenseEmbedder;
use hybrid_rag::engine::{Collaborators, Engine};
use hybrid_rag::error::GenerationError;
use hybrid_rag::generate::Generator;
use hybrid_rag::index::SearchIndex;
use hybrid_rag::sources::{DocumentSource, InMemorySource};
use hybrid_rag::sparse::{tokenize, TermWeightEncoder};

pub const DIMS: usize = 8;

/// Deterministic bag-of-words embedder: each token is hashed into one of
/// `DIMS` buckets. Texts containing `POISON` make the whole call fail.
#[derive(Default)]
pub struct HashEmbedder {
    calls: AtomicUsize,
    delay_ms: AtomicU64,
}

impl HashEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Delay every following call by `ms` milliseconds.
    pub fn set_delay_ms(&self, ms: u64) {
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        for token in tokenize(text) {
            let bucket = token.bytes().map(|b| b as usize).sum::<usize>() % DIMS;
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            v[0] = 1.0;
        } else {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl DenseEmbedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if texts.iter().any(|t| t.contains("POISON")) {
            bail!("embedding service rejected input");
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Generator that echoes the first context line and counts calls.
#[derive(Default)]
pub struct EchoGenerator {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl EchoGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(
        &self,
        context: &str,
        question: &str,
        _system_instructions: &str,
    ) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GenerationError::Status {
                status: 500,
                body: "model crashed".to_string(),
            });
        }
        let first = context.lines().next().unwrap_or_default();
        Ok(format!("{} -> {}", question, first))
    }
}

/// Config tuned for small test documents: 60-char chunks, no overlap.
pub fn test_config() -> Config {
    toml::from_str(&format!(
        r#"
[index]
path = "unused.sqlite"

[chunking]
max_chars = 60
overlap_chars = 0

[embedding]
dims = {}

[retrieval]
leg_timeout_ms = 2000

[ingest]
retry_backoff_ms = 1
"#,
        DIMS
    ))
    .unwrap()
}

pub struct Harness {
    pub engine: Engine,
    pub source: Arc<InMemorySource>,
    pub embedder: Arc<HashEmbedder>,
    pub generator: Arc<EchoGenerator>,
}

pub fn harness(config: &Config, index: Arc<dyn SearchIndex>) -> Harness {
    let source = Arc::new(InMemorySource::new());
    let embedder = Arc::new(HashEmbedder::default());
    let generator = Arc::new(EchoGenerator::default());
    let engine = Engine::new(
        config,
        Collaborators {
            index,
            embedder: embedder.clone(),
            encoder: Arc::new(TermWeightEncoder::new(config.sparse.max_terms)),
            generator: generator.clone(),
            sources: vec![source.clone() as Arc<dyn DocumentSource>],
        },
    );
    Harness {
        engine,
        source,
        embedder,
        generator,
    }
}

/// Two paragraphs that chunk into exactly two chunks at 60 chars.
pub const PUMP_DOC: &str =
    "Pump alpha delivers twelve bar of pressure.\n\nValve beta closes under heavy load.";

pub const TURBINE_DOC: &str = "Turbine gamma spins at nine thousand rpm.";
