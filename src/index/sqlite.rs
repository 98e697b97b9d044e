//! SQLite-backed [`SearchIndex`].
//!
//! | Leg     | Storage          | Scoring                              |
//! |---------|------------------|--------------------------------------|
//! | lexical | `chunks_fts`     | FTS5 BM25 (`-rank`), OR of terms     |
//! | dense   | `chunk_vectors`  | cosine similarity, computed in Rust  |
//! | sparse  | `chunk_sparse`   | dot product over matching terms      |
//!
//! Every upsert replaces a chunk's rows in all four tables inside one
//! transaction. Committed writes are immediately visible; `refresh` only
//! checkpoints the WAL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use super::{rank_hits, DocumentEntry, IndexHit, IndexedChunk, SearchIndex};
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::migrate;
use crate::models::{Chunk, ChunkRecord, SparseVector};
use crate::sparse::tokenize;

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Open the index at `path`, creating the file and schema if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to migrate index schema")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// All document rows, ordered by `source_id`.
    pub async fn list_documents(&self) -> Result<Vec<DocumentEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, filename, source_url, content_type, content_hash,
                   chunk_count, ingested_at
            FROM documents
            ORDER BY source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DocumentEntry {
                source_id: row.get("source_id"),
                filename: row.get("filename"),
                source_url: row.get("source_url"),
                content_type: row.get("content_type"),
                content_hash: row.get("content_hash"),
                chunk_count: row.get::<i64, _>("chunk_count") as usize,
                ingested_at: row.get("ingested_at"),
            })
            .collect())
    }
}

/// Build `"a" OR "b"` from the question's terms; FTS5 syntax characters in
/// user text never reach the MATCH expression.
fn fts_query(question: &str) -> Option<String> {
    let terms: BTreeSet<String> = tokenize(question).into_iter().collect();
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[String]) {
    qb.push("(");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(id.clone());
    }
    sep.push_unseparated(")");
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    Chunk {
        chunk_id: row.get("chunk_id"),
        source_id: row.get("source_id"),
        source_filename: row.get("source_filename"),
        sequence_index: row.get("sequence_index"),
        char_offset: row.get("char_offset"),
        text: row.get("text"),
        hash: row.get("hash"),
    }
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn upsert(&self, record: &ChunkRecord) -> Result<()> {
        let chunk = &record.chunk;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chunks (chunk_id, source_id, source_filename, sequence_index,
                                char_offset, text, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                source_id = excluded.source_id,
                source_filename = excluded.source_filename,
                sequence_index = excluded.sequence_index,
                char_offset = excluded.char_offset,
                text = excluded.text,
                hash = excluded.hash
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.source_id)
        .bind(&chunk.source_filename)
        .bind(chunk.sequence_index)
        .bind(chunk.char_offset)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(&chunk.chunk_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, text) VALUES (?, ?)")
            .bind(&chunk.chunk_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, dims, embedding)
            VALUES (?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(record.dense.len() as i64)
        .bind(vec_to_blob(&record.dense))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunk_sparse WHERE chunk_id = ?")
            .bind(&chunk.chunk_id)
            .execute(&mut *tx)
            .await?;
        if !record.sparse.is_empty() {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO chunk_sparse (chunk_id, term, weight) ");
            qb.push_values(record.sparse.iter(), |mut b, (term, weight)| {
                b.push_bind(chunk.chunk_id.clone())
                    .push_bind(term.clone())
                    .push_bind(*weight as f64);
            });
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn record_document(&self, entry: &DocumentEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (source_id, filename, source_url, content_type,
                                   content_hash, chunk_count, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                filename = excluded.filename,
                source_url = excluded.source_url,
                content_type = excluded.content_type,
                content_hash = excluded.content_hash,
                chunk_count = excluded.chunk_count,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&entry.source_id)
        .bind(&entry.filename)
        .bind(&entry.source_url)
        .bind(&entry.content_type)
        .bind(&entry.content_hash)
        .bind(entry.chunk_count as i64)
        .bind(entry.ingested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_stale(&self, source_id: &str, keep: &[String]) -> Result<usize> {
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT chunk_id FROM chunks WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?;
        let keep: BTreeSet<&str> = keep.iter().map(|s| s.as_str()).collect();
        let stale: Vec<String> = existing
            .into_iter()
            .filter(|id| !keep.contains(id.as_str()))
            .collect();
        self.remove(&stale).await
    }

    async fn remove(&self, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for table in ["chunks", "chunks_fts", "chunk_vectors", "chunk_sparse"] {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("DELETE FROM {} WHERE chunk_id IN ", table));
            push_id_list(&mut qb, chunk_ids);
            let result = qb.build().execute(&mut *tx).await?;
            if table == "chunks" {
                removed = result.rows_affected();
            }
        }
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn refresh(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(PASSIVE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_chunks(&self, source_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM chunks c
            JOIN chunk_vectors v ON v.chunk_id = c.chunk_id
            WHERE c.source_id = ?
            "#,
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn search_lexical(&self, query: &str, top_k: usize) -> Result<Vec<IndexHit>> {
        let Some(expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank, chunk_id
            LIMIT ?
            "#,
        )
        .bind(expr)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                IndexHit {
                    chunk_id: row.get("chunk_id"),
                    score: -rank, // negate so higher = better
                }
            })
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn search_dense(&self, vector: &[f32], top_k: usize) -> Result<Vec<IndexHit>> {
        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_vec(&blob);
                IndexHit {
                    chunk_id: row.get("chunk_id"),
                    score: cosine_similarity(vector, &stored) as f64,
                }
            })
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn search_sparse(&self, vector: &SparseVector, top_k: usize) -> Result<Vec<IndexHit>> {
        if vector.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT chunk_id, term, weight FROM chunk_sparse WHERE term IN ");
        let terms: Vec<String> = vector.keys().cloned().collect();
        push_id_list(&mut qb, &terms);
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut scores: HashMap<String, f64> = HashMap::new();
        for row in &rows {
            let term: String = row.get("term");
            let weight: f64 = row.get("weight");
            if let Some(q) = vector.get(&term) {
                *scores.entry(row.get("chunk_id")).or_insert(0.0) += *q as f64 * weight;
            }
        }

        let hits = scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(chunk_id, score)| IndexHit { chunk_id, score })
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<IndexedChunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT c.chunk_id, c.source_id, c.source_filename, c.sequence_index,
                   c.char_offset, c.text, c.hash, d.source_url
            FROM chunks c
            LEFT JOIN documents d ON d.source_id = c.source_id
            WHERE c.chunk_id IN "#,
        );
        push_id_list(&mut qb, chunk_ids);
        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut by_id: HashMap<String, IndexedChunk> = rows
            .iter()
            .map(|row| {
                let chunk = chunk_from_row(row);
                (
                    chunk.chunk_id.clone(),
                    IndexedChunk {
                        chunk,
                        source_url: row.get("source_url"),
                    },
                )
            })
            .collect();

        Ok(chunk_ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
