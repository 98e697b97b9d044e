//! Sparse semantic-expansion collaborators.
//!
//! A [`SparseEncoder`] maps text to a term → weight vector that is stored
//! per chunk and matched by dot product at query time.
//!
//! - **[`TermWeightEncoder`]**: local, dependency-free expansion: log-scaled
//!   term frequencies plus light suffix stemming, L2-normalised.
//! - **[`HttpSparseEncoder`]**: calls an expansion service (SPLADE/ELSER
//!   style) that returns `{"vectors": [{"term": weight, ...}, ...]}`.
//! - **`LocalSparseEncoder`**: SPLADE via fastembed (feature
//!   `local-embeddings`); terms are vocabulary ids.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::SparseConfig;
use crate::embedding::post_json_with_retry;
use crate::models::SparseVector;

/// A model that expands text into weighted vocabulary terms.
#[async_trait]
pub trait SparseEncoder: Send + Sync {
    fn model_name(&self) -> &str;
    /// Expand a batch of texts, returning one vector per input in order.
    async fn expand(&self, texts: &[String]) -> Result<Vec<SparseVector>>;
}

/// Expand a single query text.
pub async fn expand_query(encoder: &dyn SparseEncoder, text: &str) -> Result<SparseVector> {
    encoder
        .expand(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty sparse expansion response"))
}

/// Sum of `q[t] * d[t]` over shared terms.
pub fn sparse_dot(query: &SparseVector, doc: &SparseVector) -> f64 {
    let (small, large) = if query.len() <= doc.len() {
        (query, doc)
    } else {
        (doc, query)
    };
    small
        .iter()
        .filter_map(|(term, w)| large.get(term).map(|v| (*w as f64) * (*v as f64)))
        .sum()
}

/// Keep the `max_terms` heaviest entries; ties are broken by term.
pub fn prune(vector: SparseVector, max_terms: usize) -> SparseVector {
    if vector.len() <= max_terms {
        return vector;
    }
    let mut entries: Vec<(String, f32)> = vector.into_iter().collect();
    entries.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    entries.truncate(max_terms);
    entries.into_iter().collect()
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "how", "in",
    "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "what",
    "when", "where", "which", "who", "why", "will", "with",
];

/// Lowercase alphanumeric tokens with stopwords removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn stem(token: &str) -> Option<&str> {
    for suffix in ["ing", "ies", "es", "ed", "s"] {
        if let Some(base) = token.strip_suffix(suffix) {
            if base.chars().count() >= 3 {
                return Some(base);
            }
        }
    }
    None
}

// ============ Local term weighting ============

/// Deterministic local expansion used when no expansion model is deployed.
pub struct TermWeightEncoder {
    max_terms: usize,
}

impl TermWeightEncoder {
    pub fn new(max_terms: usize) -> Self {
        Self { max_terms }
    }

    pub fn encode(&self, text: &str) -> SparseVector {
        let mut tf: HashMap<String, f32> = HashMap::new();
        for token in tokenize(text) {
            if let Some(base) = stem(&token) {
                *tf.entry(base.to_string()).or_insert(0.0) += 0.5;
            }
            *tf.entry(token).or_insert(0.0) += 1.0;
        }

        let mut vector: SparseVector = tf
            .into_iter()
            .map(|(term, count)| (term, 1.0 + count.ln_1p()))
            .collect();

        let norm = vector.values().map(|w| w * w).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for w in vector.values_mut() {
                *w /= norm;
            }
        }
        prune(vector, self.max_terms)
    }
}

#[async_trait]
impl SparseEncoder for TermWeightEncoder {
    fn model_name(&self) -> &str {
        "terms"
    }

    async fn expand(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        Ok(texts.iter().map(|t| self.encode(t)).collect())
    }
}

// ============ HTTP expansion service ============

/// Sparse encoder backed by an HTTP expansion service.
///
/// Sends `POST {url}/expand` with `{"model": ..., "input": [...]}`. An
/// optional bearer token is read from `SPARSE_API_KEY`.
pub struct HttpSparseEncoder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
    max_terms: usize,
}

impl HttpSparseEncoder {
    pub fn new(config: &SparseConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("sparse.url required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url,
            model: config.model.clone().unwrap_or_else(|| "splade".to_string()),
            api_key: std::env::var("SPARSE_API_KEY").ok(),
            max_retries: config.max_retries,
            max_terms: config.max_terms,
        })
    }
}

#[async_trait]
impl SparseEncoder for HttpSparseEncoder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn expand(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/expand", self.url.trim_end_matches('/')),
            self.api_key.as_deref(),
            &body,
            self.max_retries,
            "Sparse expansion",
        )
        .await?;
        Ok(parse_sparse_response(&json)?
            .into_iter()
            .map(|v| prune(v, self.max_terms))
            .collect())
    }
}

fn parse_sparse_response(json: &serde_json::Value) -> Result<Vec<SparseVector>> {
    let vectors = json
        .get("vectors")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid sparse response: missing vectors array"))?;

    let mut out = Vec::with_capacity(vectors.len());
    for entry in vectors {
        let map = entry
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("Invalid sparse response: vector is not an object"))?;
        let mut vector = SparseVector::new();
        for (term, weight) in map {
            let Some(w) = weight.as_f64() else {
                bail!("Invalid sparse response: weight for '{}' is not a number", term);
            };
            vector.insert(term.clone(), w as f32);
        }
        out.push(vector);
    }
    Ok(out)
}

// ============ Local SPLADE (fastembed) ============

#[cfg(feature = "local-embeddings")]
pub struct LocalSparseEncoder {
    model: std::sync::Arc<std::sync::Mutex<fastembed::SparseTextEmbedding>>,
    max_terms: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalSparseEncoder {
    pub fn new(config: &SparseConfig) -> Result<Self> {
        let model = fastembed::SparseTextEmbedding::try_new(fastembed::SparseInitOptions::new(
            fastembed::SparseModel::SPLADEPPV1,
        ))
        .map_err(|e| anyhow::anyhow!("Failed to initialize local sparse model: {}", e))?;
        Ok(Self {
            model: std::sync::Arc::new(std::sync::Mutex::new(model)),
            max_terms: config.max_terms,
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl SparseEncoder for LocalSparseEncoder {
    fn model_name(&self) -> &str {
        "splade-pp-v1"
    }

    async fn expand(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        let model = self.model.clone();
        let texts = texts.to_vec();
        let max_terms = self.max_terms;
        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| anyhow::anyhow!("local sparse model lock poisoned"))?;
            let embeddings = guard
                .embed(texts, None)
                .map_err(|e| anyhow::anyhow!("Local sparse expansion failed: {}", e))?;
            Ok(embeddings
                .into_iter()
                .map(|e| {
                    let vector: SparseVector = e
                        .indices
                        .iter()
                        .zip(e.values.iter())
                        .map(|(i, v)| (i.to_string(), *v))
                        .collect();
                    prune(vector, max_terms)
                })
                .collect())
        })
        .await?
    }
}

/// Create the configured [`SparseEncoder`].
pub fn create_sparse_encoder(config: &SparseConfig) -> Result<Box<dyn SparseEncoder>> {
    match config.provider.as_str() {
        "terms" => Ok(Box::new(TermWeightEncoder::new(config.max_terms))),
        "http" => Ok(Box::new(HttpSparseEncoder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalSparseEncoder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local sparse provider requires --features local-embeddings"),
        other => bail!("Unknown sparse provider: {}", other),
    }
}
