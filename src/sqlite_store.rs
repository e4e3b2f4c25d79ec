//! SQLite-backed storage.
//!
//! [`SqliteDurableStore`] implements [`DurableStore`] over the `kv` table.
//! [`SqliteIndex`] implements both retrieval indexes over the `chunks`
//! table: [`VectorIndex`] scores stored embedding BLOBs by cosine
//! similarity (or term overlap for text queries), and [`CodeIndex`] runs
//! FTS5 `MATCH` over `chunks_fts`. Every chunk write bumps the
//! repository's row in `repository_generations` inside the same
//! transaction, so cached retrievals in any process can tell they are stale.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use research_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use research_harness_core::index::{
    chunk_key, CodeIndex, DurableStore, IndexFilter, VectorIndex, VectorQuery,
};
use research_harness_core::models::{ChunkMetadata, ContextChunk, SourceType};
use research_harness_core::rank::{keyword_overlap, tokenize, Candidate};

pub struct SqliteDurableStore {
    pool: SqlitePool,
}

impl SqliteDurableStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT key FROM kv WHERE substr(key, 1, ?) = ? ORDER BY key")
                .bind(prefix.chars().count() as i64)
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?;
        Ok(keys)
    }
}

/// Chunk storage plus both retrieval indexes.
pub struct SqliteIndex {
    pool: SqlitePool,
}

const CHUNK_COLUMNS: &str =
    "c.key, c.id, c.repository_id, c.source_type, c.file_path, c.doc_type, c.chunk_index, c.content";

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn bump_generation(tx: &mut Transaction<'_, Sqlite>, repository_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repository_generations (repository_id, generation) VALUES (?, 1)
            ON CONFLICT(repository_id) DO UPDATE SET generation = generation + 1
            "#,
        )
        .bind(repository_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn current_generation(&self, repository_id: &str) -> Result<Option<u64>> {
        let generation: Option<i64> = sqlx::query_scalar(
            "SELECT generation FROM repository_generations WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(Some(generation.unwrap_or(0) as u64))
    }

    /// Insert or replace chunks, keeping the FTS table in sync.
    ///
    /// `vectors`, when given, must be parallel to `chunks`.
    pub async fn upsert_chunks(
        &self,
        chunks: &[ContextChunk],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<()> {
        if let Some(v) = vectors {
            if v.len() != chunks.len() {
                return Err(anyhow!(
                    "vector count {} does not match chunk count {}",
                    v.len(),
                    chunks.len()
                ));
            }
        }

        let mut tx = self.pool.begin().await?;
        let mut touched: Vec<&str> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if !touched.contains(&chunk.metadata.repository_id.as_str()) {
                touched.push(&chunk.metadata.repository_id);
            }
            let key = chunk_key(&chunk.metadata.repository_id, &chunk.id);
            let blob = vectors.and_then(|v| v.get(i)).map(|v| vec_to_blob(v));

            sqlx::query("DELETE FROM chunks_fts WHERE key = ?")
                .bind(&key)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                r#"
                INSERT INTO chunks (key, id, repository_id, source_type, file_path, doc_type,
                                    chunk_index, content, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    source_type = excluded.source_type,
                    file_path = excluded.file_path,
                    doc_type = excluded.doc_type,
                    chunk_index = excluded.chunk_index,
                    content = excluded.content,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&key)
            .bind(&chunk.id)
            .bind(&chunk.metadata.repository_id)
            .bind(chunk.source_type.as_str())
            .bind(&chunk.metadata.file_path)
            .bind(&chunk.metadata.doc_type)
            .bind(chunk.metadata.chunk_index)
            .bind(&chunk.content)
            .bind(blob)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (key, content) VALUES (?, ?)")
                .bind(&key)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;
        }
        for repository_id in touched {
            Self::bump_generation(&mut tx, repository_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete every chunk of `repository_id`. Returns the number removed.
    pub async fn remove_repository(&self, repository_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE key IN (SELECT key FROM chunks WHERE repository_id = ?)",
        )
        .bind(repository_id)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE repository_id = ?")
            .bind(repository_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        Self::bump_generation(&mut tx, repository_id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Delete the chunks of one file so a re-index leaves no stale tail.
    pub async fn remove_file(&self, repository_id: &str, file_path: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE key IN \
             (SELECT key FROM chunks WHERE repository_id = ? AND file_path = ?)",
        )
        .bind(repository_id)
        .bind(file_path)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE repository_id = ? AND file_path = ?")
            .bind(repository_id)
            .bind(file_path)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed > 0 {
            Self::bump_generation(&mut tx, repository_id).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn count_chunks(&self, repository_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE repository_id = ?")
            .bind(repository_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_scoped(&self, filter: &IndexFilter, embedded_only: bool) -> Result<Vec<SqliteRow>> {
        let sql = format!(
            "SELECT {}, c.embedding FROM chunks c \
             WHERE c.repository_id = ? AND (? IS NULL OR c.source_type = ?){} \
             ORDER BY c.rowid",
            CHUNK_COLUMNS,
            if embedded_only {
                " AND c.embedding IS NOT NULL"
            } else {
                ""
            }
        );
        let source_type = filter.source_type.map(|t| t.as_str());
        let rows = sqlx::query(&sql)
            .bind(&filter.repository_id)
            .bind(source_type)
            .bind(source_type)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

fn row_to_chunk(row: &SqliteRow) -> Result<ContextChunk> {
    let source_type: String = row.get("source_type");
    let source_type = SourceType::parse(&source_type)
        .ok_or_else(|| anyhow!("unknown source_type in chunks table: {}", source_type))?;
    Ok(ContextChunk {
        id: row.get("id"),
        content: row.get("content"),
        source_type,
        metadata: ChunkMetadata {
            repository_id: row.get("repository_id"),
            file_path: row.get("file_path"),
            doc_type: row.get("doc_type"),
            chunk_index: row.get("chunk_index"),
        },
        relevance_score: 0.0,
    })
}

fn sort_and_truncate(candidates: &mut Vec<Candidate>, limit: usize) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(limit);
}

/// Quote each term so user text cannot inject FTS5 syntax.
fn fts_query(text: &str) -> Option<String> {
    let terms = tokenize(text);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn query(
        &self,
        query: VectorQuery<'_>,
        filter: &IndexFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();
        match query {
            VectorQuery::Embedding(qv) => {
                for row in self.fetch_scoped(filter, true).await? {
                    let blob: Vec<u8> = row.get("embedding");
                    let raw_score = cosine_similarity(qv, &blob_to_vec(&blob)) as f64;
                    candidates.push(Candidate {
                        chunk: row_to_chunk(&row)?,
                        raw_score,
                    });
                }
            }
            VectorQuery::Text(text) => {
                let terms = tokenize(text);
                for row in self.fetch_scoped(filter, false).await? {
                    let chunk = row_to_chunk(&row)?;
                    let overlap = keyword_overlap(&terms, &chunk.content);
                    if overlap > 0.0 {
                        candidates.push(Candidate {
                            chunk,
                            raw_score: overlap,
                        });
                    }
                }
            }
        }
        sort_and_truncate(&mut candidates, limit);
        Ok(candidates)
    }

    async fn generation(&self, repository_id: &str) -> Result<Option<u64>> {
        self.current_generation(repository_id).await
    }
}

#[async_trait]
impl CodeIndex for SqliteIndex {
    async fn query(
        &self,
        text: &str,
        filter: &IndexFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let Some(match_expr) = fts_query(text) else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT {}, chunks_fts.rank AS rank FROM chunks_fts \
             JOIN chunks c ON c.key = chunks_fts.key \
             WHERE chunks_fts MATCH ? AND c.repository_id = ? AND (? IS NULL OR c.source_type = ?) \
             ORDER BY chunks_fts.rank \
             LIMIT ?",
            CHUNK_COLUMNS
        );
        let source_type = filter.source_type.map(|t| t.as_str());
        let rows = sqlx::query(&sql)
            .bind(match_expr)
            .bind(&filter.repository_id)
            .bind(source_type)
            .bind(source_type)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let rank: f64 = row.get("rank");
            candidates.push(Candidate {
                chunk: row_to_chunk(row)?,
                // FTS5 rank is negated BM25: lower is better.
                raw_score: -rank,
            });
        }
        Ok(candidates)
    }

    async fn generation(&self, repository_id: &str) -> Result<Option<u64>> {
        self.current_generation(repository_id).await
    }
}
