//! Representation builder.
//!
//! Turns chunks into [`ChunkRecord`]s by calling the dense embedder and the
//! sparse encoder concurrently. A record only exists when both calls
//! produced a valid vector for that chunk.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::embedding::DenseEmbedder;
use crate::error::RepresentationError;
use crate::models::{Chunk, ChunkRecord, SparseVector};
use crate::sparse::SparseEncoder;

/// Builds complete [`ChunkRecord`]s from chunks.
#[derive(Clone)]
pub struct RepresentationBuilder {
    embedder: Arc<dyn DenseEmbedder>,
    encoder: Arc<dyn SparseEncoder>,
    dims: usize,
    timeout: Duration,
}

type DenseBatch = Result<Vec<Vec<f32>>, RepresentationError>;
type SparseBatch = Result<Vec<SparseVector>, RepresentationError>;

impl RepresentationBuilder {
    pub fn new(
        embedder: Arc<dyn DenseEmbedder>,
        encoder: Arc<dyn SparseEncoder>,
        dims: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            encoder,
            dims,
            timeout,
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Build one result per input chunk, in input order.
    ///
    /// If the batch call fails as a whole, every chunk is retried on its own
    /// so one bad input cannot reject its neighbours.
    pub async fn build(&self, chunks: &[Chunk]) -> Vec<Result<ChunkRecord, RepresentationError>> {
        if chunks.is_empty() {
            return Vec::new();
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        match self.call_models(&texts).await {
            Ok((dense, sparse)) => chunks
                .iter()
                .zip(dense)
                .zip(sparse)
                .map(|((chunk, d), s)| self.assemble(chunk, d, s))
                .collect(),
            Err(e) if chunks.len() == 1 => vec![Err(e)],
            Err(e) => {
                warn!(
                    chunks = chunks.len(),
                    error = %e,
                    "Batch representation failed, retrying per chunk"
                );
                join_all(chunks.iter().map(|chunk| self.build_one(chunk))).await
            }
        }
    }

    async fn build_one(&self, chunk: &Chunk) -> Result<ChunkRecord, RepresentationError> {
        let (mut dense, mut sparse) = self.call_models(&[chunk.text.clone()]).await?;
        match (dense.pop(), sparse.pop()) {
            (Some(d), Some(s)) => self.assemble(chunk, d, s),
            _ => Err(RepresentationError::Count {
                model: "dense",
                expected: 1,
                actual: 0,
            }),
        }
    }

    /// Run both models over `texts`; fails unless both return one vector
    /// per input.
    async fn call_models(
        &self,
        texts: &[String],
    ) -> Result<(Vec<Vec<f32>>, Vec<SparseVector>), RepresentationError> {
        let (dense, sparse): (DenseBatch, SparseBatch) =
            tokio::join!(self.call_dense(texts), self.call_sparse(texts));
        let dense = dense?;
        let sparse = sparse?;

        if dense.len() != texts.len() {
            return Err(RepresentationError::Count {
                model: "dense",
                expected: texts.len(),
                actual: dense.len(),
            });
        }
        if sparse.len() != texts.len() {
            return Err(RepresentationError::Count {
                model: "sparse",
                expected: texts.len(),
                actual: sparse.len(),
            });
        }
        Ok((dense, sparse))
    }

    async fn call_dense(&self, texts: &[String]) -> DenseBatch {
        match tokio::time::timeout(self.timeout, self.embedder.embed(texts)).await {
            Ok(Ok(vectors)) => Ok(vectors),
            Ok(Err(e)) => Err(RepresentationError::Dense(format!("{:#}", e))),
            Err(_) => Err(RepresentationError::Timeout(
                "dense",
                self.timeout.as_millis() as u64,
            )),
        }
    }

    async fn call_sparse(&self, texts: &[String]) -> SparseBatch {
        match tokio::time::timeout(self.timeout, self.encoder.expand(texts)).await {
            Ok(Ok(vectors)) => Ok(vectors),
            Ok(Err(e)) => Err(RepresentationError::Sparse(format!("{:#}", e))),
            Err(_) => Err(RepresentationError::Timeout(
                "sparse",
                self.timeout.as_millis() as u64,
            )),
        }
    }

    fn assemble(
        &self,
        chunk: &Chunk,
        dense: Vec<f32>,
        sparse: SparseVector,
    ) -> Result<ChunkRecord, RepresentationError> {
        validate_dense(&dense, self.dims)?;
        validate_sparse(&sparse)?;
        debug!(
            chunk_id = %chunk.chunk_id,
            terms = sparse.len(),
            "Built chunk representations"
        );
        Ok(ChunkRecord {
            chunk: chunk.clone(),
            dense,
            sparse,
        })
    }
}

pub fn validate_dense(vector: &[f32], dims: usize) -> Result<(), RepresentationError> {
    if vector.len() != dims {
        return Err(RepresentationError::Dimension {
            expected: dims,
            actual: vector.len(),
        });
    }
    if let Some(pos) = vector.iter().position(|v| !v.is_finite()) {
        return Err(RepresentationError::Malformed(
            "dense",
            format!("component {} is not finite", pos),
        ));
    }
    Ok(())
}

pub fn validate_sparse(vector: &SparseVector) -> Result<(), RepresentationError> {
    for (term, weight) in vector {
        if !weight.is_finite() || *weight < 0.0 {
            return Err(RepresentationError::Malformed(
                "sparse",
                format!("weight {} for term '{}'", weight, term),
            ));
        }
    }
    Ok(())
}
