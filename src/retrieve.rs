//! Query fan-out.
//!
//! Each retrieval leg is a [`ModalityRetriever`]: it encodes the question
//! the way its modality needs and returns a ranked list from the index.
//! [`FanOut`] runs the legs selected by a [`RetrievalMode`] concurrently,
//! each under its own timeout. A leg that fails or times out contributes no
//! list; the question only fails when no leg produced a list.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::embedding::{embed_query, DenseEmbedder};
use crate::error::{ModalityError, RetrievalError};
use crate::index::{IndexHit, SearchIndex};
use crate::models::{Modality, RetrievalHit, RetrievalMode};
use crate::represent::validate_dense;
use crate::sparse::{expand_query, SparseEncoder};

/// A producer of one modality's ranked list.
#[async_trait]
pub trait ModalityRetriever: Send + Sync {
    fn modality(&self) -> Modality;

    /// Up to `top_k` hits, best first, ranks starting at 1.
    async fn search(&self, question: &str, top_k: usize) -> Result<Vec<RetrievalHit>>;
}

fn ranked(modality: Modality, hits: Vec<IndexHit>) -> Vec<RetrievalHit> {
    hits.into_iter()
        .enumerate()
        .map(|(i, hit)| RetrievalHit {
            chunk_id: hit.chunk_id,
            modality,
            rank: i + 1,
            score: hit.score,
        })
        .collect()
}

/// BM25 over chunk text.
pub struct LexicalRetriever {
    index: Arc<dyn SearchIndex>,
}

impl LexicalRetriever {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl ModalityRetriever for LexicalRetriever {
    fn modality(&self) -> Modality {
        Modality::Lexical
    }

    async fn search(&self, question: &str, top_k: usize) -> Result<Vec<RetrievalHit>> {
        let hits = self.index.search_lexical(question, top_k).await?;
        Ok(ranked(Modality::Lexical, hits))
    }
}

/// Nearest neighbours of the embedded question.
pub struct DenseRetriever {
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn DenseEmbedder>,
}

impl DenseRetriever {
    pub fn new(index: Arc<dyn SearchIndex>, embedder: Arc<dyn DenseEmbedder>) -> Self {
        Self { index, embedder }
    }
}

#[async_trait]
impl ModalityRetriever for DenseRetriever {
    fn modality(&self) -> Modality {
        Modality::Dense
    }

    async fn search(&self, question: &str, top_k: usize) -> Result<Vec<RetrievalHit>> {
        let vector = embed_query(self.embedder.as_ref(), question).await?;
        // A wrong-sized query vector scores every chunk 0.0; fail the leg instead.
        validate_dense(&vector, self.embedder.dims())?;
        let hits = self.index.search_dense(&vector, top_k).await?;
        Ok(ranked(Modality::Dense, hits))
    }
}

/// Weighted term overlap with the expanded question.
pub struct SparseRetriever {
    index: Arc<dyn SearchIndex>,
    encoder: Arc<dyn SparseEncoder>,
}

impl SparseRetriever {
    pub fn new(index: Arc<dyn SearchIndex>, encoder: Arc<dyn SparseEncoder>) -> Self {
        Self { index, encoder }
    }
}

#[async_trait]
impl ModalityRetriever for SparseRetriever {
    fn modality(&self) -> Modality {
        Modality::Sparse
    }

    async fn search(&self, question: &str, top_k: usize) -> Result<Vec<RetrievalHit>> {
        let expansion = expand_query(self.encoder.as_ref(), question).await?;
        let hits = self.index.search_sparse(&expansion, top_k).await?;
        Ok(ranked(Modality::Sparse, hits))
    }
}

/// One leg's ranked list.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub modality: Modality,
    pub hits: Vec<RetrievalHit>,
}

#[derive(Debug)]
pub struct FanOutResult {
    /// One list per leg that succeeded, in [`Modality`] order.
    pub lists: Vec<RankedList>,
    /// Legs that timed out or failed.
    pub failures: Vec<ModalityError>,
}

impl FanOutResult {
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct FanOut {
    retrievers: Vec<Arc<dyn ModalityRetriever>>,
    timeout: Duration,
}

impl FanOut {
    pub fn new(retrievers: Vec<Arc<dyn ModalityRetriever>>, timeout: Duration) -> Self {
        Self {
            retrievers,
            timeout,
        }
    }

    pub async fn retrieve(
        &self,
        question: &str,
        mode: RetrievalMode,
        top_k: usize,
    ) -> Result<FanOutResult, RetrievalError> {
        if question.trim().is_empty() {
            return Err(RetrievalError::EmptyQuestion);
        }

        let mut failures = Vec::new();
        let mut selected = Vec::new();
        for modality in mode.modalities() {
            match self.retrievers.iter().find(|r| r.modality() == *modality) {
                Some(r) => selected.push(r.clone()),
                None => failures.push(ModalityError::Failed {
                    modality: *modality,
                    message: "no retriever configured".to_string(),
                }),
            }
        }

        let timeout_ms = self.timeout.as_millis() as u64;
        let legs = selected.into_iter().map(|retriever| async move {
            let modality = retriever.modality();
            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(self.timeout, retriever.search(question, top_k)).await {
                    Ok(Ok(hits)) => Ok(hits),
                    Ok(Err(e)) => Err(ModalityError::Failed {
                        modality,
                        message: format!("{:#}", e),
                    }),
                    Err(_) => Err(ModalityError::Timeout {
                        modality,
                        timeout_ms,
                    }),
                };
            (modality, started.elapsed(), outcome)
        });

        let mut lists = Vec::new();
        for (modality, elapsed, outcome) in join_all(legs).await {
            match outcome {
                Ok(hits) => {
                    debug!(
                        %modality,
                        hits = hits.len(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Retrieval leg finished"
                    );
                    lists.push(RankedList { modality, hits });
                }
                Err(e) => {
                    warn!(%modality, error = %e, "Retrieval leg dropped");
                    failures.push(e);
                }
            }
        }

        if lists.is_empty() {
            return Err(RetrievalError::AllModalitiesFailed(failures));
        }

        lists.sort_by_key(|l| l.modality);
        failures.sort_by_key(|f| f.modality());
        Ok(FanOutResult { lists, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        modality: Modality,
        ids: Vec<&'static str>,
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(modality: Modality, ids: Vec<&'static str>) -> Self {
            Self {
                modality,
                ids,
                delay: Duration::ZERO,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModalityRetriever for Fixed {
        fn modality(&self) -> Modality {
            self.modality
        }

        async fn search(&self, _question: &str, top_k: usize) -> Result<Vec<RetrievalHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                bail!("backend down");
            }
            let hits = self
                .ids
                .iter()
                .take(top_k)
                .map(|id| IndexHit {
                    chunk_id: id.to_string(),
                    score: 1.0,
                })
                .collect();
            Ok(ranked(self.modality, hits))
        }
    }

    fn fan_out(legs: Vec<Arc<Fixed>>) -> FanOut {
        FanOut::new(
            legs.into_iter()
                .map(|l| l as Arc<dyn ModalityRetriever>)
                .collect(),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_hybrid_returns_all_lists_with_ranks() {
        let lex = Arc::new(Fixed::new(Modality::Lexical, vec!["a", "b"]));
        let dense = Arc::new(Fixed::new(Modality::Dense, vec!["b"]));
        let sparse = Arc::new(Fixed::new(Modality::Sparse, vec![]));
        let result = fan_out(vec![sparse, lex, dense])
            .retrieve("pump", RetrievalMode::Hybrid, 10)
            .await
            .unwrap();
        let modalities: Vec<Modality> = result.lists.iter().map(|l| l.modality).collect();
        assert_eq!(modalities, Modality::ALL.to_vec());
        assert_eq!(result.lists[0].hits[1].rank, 2);
        assert!(result.lists[2].hits.is_empty());
        assert!(!result.degraded());
    }

    #[tokio::test]
    async fn test_restricted_mode_skips_other_legs() {
        let lex = Arc::new(Fixed::new(Modality::Lexical, vec!["a"]));
        let dense = Arc::new(Fixed::new(Modality::Dense, vec!["a"]));
        let sparse = Arc::new(Fixed::new(Modality::Sparse, vec!["a"]));
        let result = fan_out(vec![lex.clone(), dense.clone(), sparse.clone()])
            .retrieve("pump", RetrievalMode::SparseOnly, 10)
            .await
            .unwrap();
        assert_eq!(result.lists.len(), 1);
        assert_eq!(result.lists[0].modality, Modality::Sparse);
        assert_eq!(lex.calls.load(Ordering::SeqCst), 0);
        assert_eq!(dense.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sparse.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timed_out_leg_is_recorded() {
        let lex = Arc::new(Fixed::new(Modality::Lexical, vec!["a"]));
        let mut slow = Fixed::new(Modality::Dense, vec!["a"]);
        slow.delay = Duration::from_secs(5);
        let result = fan_out(vec![lex, Arc::new(slow)])
            .retrieve("pump", RetrievalMode::Hybrid, 10)
            .await
            .unwrap();
        assert_eq!(result.lists.len(), 1);
        assert!(result.degraded());
        assert!(result
            .failures
            .iter()
            .any(|f| matches!(f, ModalityError::Timeout { modality: Modality::Dense, .. })));
        // No sparse retriever was configured at all.
        assert!(result
            .failures
            .iter()
            .any(|f| matches!(f, ModalityError::Failed { modality: Modality::Sparse, .. })));
    }

    #[tokio::test]
    async fn test_all_legs_failing_is_an_error() {
        let mut lex = Fixed::new(Modality::Lexical, vec![]);
        lex.fail = true;
        let err = fan_out(vec![Arc::new(lex)])
            .retrieve("pump", RetrievalMode::LexicalOnly, 10)
            .await
            .unwrap_err();
        match err {
            RetrievalError::AllModalitiesFailed(failures) => assert_eq!(failures.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Claims two dimensions but answers with three.
    struct MisconfiguredEmbedder;

    #[async_trait]
    impl DenseEmbedder for MisconfiguredEmbedder {
        fn model_name(&self) -> &str {
            "misconfigured"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.5, 0.5, 0.5]).collect())
        }
    }

    #[tokio::test]
    async fn test_dense_query_with_wrong_dimensions_fails_the_leg() {
        use crate::chunk::hash_text;
        use crate::index::InMemoryIndex;
        use crate::models::{chunk_id, Chunk, ChunkRecord};

        let index = Arc::new(InMemoryIndex::new());
        for seq in 0..2 {
            let text = format!("pump manual page {}", seq);
            index
                .upsert(&ChunkRecord {
                    chunk: Chunk {
                        chunk_id: chunk_id("d", seq),
                        source_id: "d".to_string(),
                        source_filename: "d.pdf".to_string(),
                        sequence_index: seq,
                        char_offset: 0,
                        hash: hash_text(&text),
                        text,
                    },
                    dense: vec![1.0, 0.0],
                    sparse: [("pump".to_string(), 1.0)].into(),
                })
                .await
                .unwrap();
        }
        index.refresh().await.unwrap();

        let index_dyn: Arc<dyn SearchIndex> = index;
        let fan_out = FanOut::new(
            vec![
                Arc::new(LexicalRetriever::new(index_dyn.clone())) as Arc<dyn ModalityRetriever>,
                Arc::new(DenseRetriever::new(index_dyn, Arc::new(MisconfiguredEmbedder))),
            ],
            Duration::from_millis(500),
        );

        let result = fan_out
            .retrieve("pump", RetrievalMode::Hybrid, 10)
            .await
            .unwrap();
        assert!(result.lists.iter().all(|l| l.modality != Modality::Dense));
        assert!(result
            .failures
            .iter()
            .any(|f| matches!(f, ModalityError::Failed { modality: Modality::Dense, .. })));

        let err = fan_out
            .retrieve("pump", RetrievalMode::DenseOnly, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::AllModalitiesFailed(_)));
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let lex = Arc::new(Fixed::new(Modality::Lexical, vec!["a"]));
        let err = fan_out(vec![lex.clone()])
            .retrieve("   ", RetrievalMode::Hybrid, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::EmptyQuestion));
        assert_eq!(lex.calls.load(Ordering::SeqCst), 0);
    }
}
