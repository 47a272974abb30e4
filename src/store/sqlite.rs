//! SQLite-backed [`CandidateStore`].
//!
//! Keyword matching runs through the `chunks_fts` FTS5 index (kept in sync
//! with `chunks` by triggers, see [`crate::migrate`]). Hybrid ranking scores
//! every allowed chunk; chunks absent from the FTS result get a keyword
//! score of zero. Vectors are stored as little-endian f32 BLOBs and scored
//! in Rust.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use crate::models::{NewChunk, RetrievalCandidate};
use crate::search::{fts_match_expression, rank_by_distance, rank_hybrid, KeywordMatch};

use super::{effective_filter, CandidateStore, SourceSummary};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Every chunk passing the allow-list, scored against `query`.
    async fn allowed_candidates(
        &self,
        query: &[f32],
        allowed: Option<&[String]>,
    ) -> Result<Vec<RetrievalCandidate>> {
        let sql = format!(
            "SELECT id, content, embedding, source_file FROM chunks WHERE 1 = 1{}",
            source_clause("source_file", allowed)
        );
        let mut q = sqlx::query(&sql);
        for s in allowed.unwrap_or_default() {
            q = q.bind(s);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|row| row_to_candidate(row, query)).collect())
    }
}

/// `AND <column> IN (?, ?, ...)` for a non-empty allow-list.
fn source_clause(column: &str, allowed: Option<&[String]>) -> String {
    match allowed {
        Some(list) => format!(
            " AND {} IN ({})",
            column,
            vec!["?"; list.len()].join(", ")
        ),
        None => String::new(),
    }
}

fn row_to_candidate(row: &SqliteRow, query: &[f32]) -> RetrievalCandidate {
    let blob: Vec<u8> = row.get("embedding");
    RetrievalCandidate {
        id: row.get("id"),
        content: row.get("content"),
        source_file: row.get("source_file"),
        distance: cosine_distance(query, &blob_to_vec(&blob)),
        rerank_score: None,
    }
}

#[async_trait]
impl CandidateStore for SqliteStore {
    async fn insert_chunk(&self, chunk: &NewChunk) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO chunks (content, embedding, source_file, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&chunk.content)
        .bind(vec_to_blob(&chunk.embedding))
        .bind(&chunk.source_file)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn hybrid_search(
        &self,
        embedding: &[f32],
        query_text: &str,
        limit: usize,
        vector_weight: f64,
        allowed_sources: Option<&[String]>,
    ) -> Result<Vec<RetrievalCandidate>> {
        let Some(expr) = fts_match_expression(query_text) else {
            return Ok(Vec::new());
        };
        let allowed = effective_filter(allowed_sources);

        let sql = format!(
            r#"
            SELECT c.id, bm25(chunks_fts) AS rank
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.rowid
            WHERE chunks_fts MATCH ?{}
            "#,
            source_clause("c.source_file", allowed)
        );
        let mut query = sqlx::query(&sql).bind(expr);
        for s in allowed.unwrap_or_default() {
            query = query.bind(s);
        }
        // bm25: lower is better
        let keyword_scores: HashMap<i64, f64> = query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| (row.get::<i64, _>("id"), -row.get::<f64, _>("rank")))
            .collect();
        if keyword_scores.is_empty() {
            return Ok(Vec::new());
        }

        let scored: Vec<KeywordMatch> = self
            .allowed_candidates(embedding, allowed)
            .await?
            .into_iter()
            .map(|candidate| KeywordMatch {
                raw_score: keyword_scores.get(&candidate.id).copied().unwrap_or(0.0),
                candidate,
            })
            .collect();

        Ok(rank_hybrid(scored, vector_weight, limit))
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        limit: usize,
        allowed_sources: Option<&[String]>,
    ) -> Result<Vec<RetrievalCandidate>> {
        let allowed = effective_filter(allowed_sources);
        let candidates = self.allowed_candidates(embedding, allowed).await?;
        Ok(rank_by_distance(candidates, limit))
    }

    async fn list_sources(&self) -> Result<Vec<SourceSummary>> {
        let rows = sqlx::query(
            "SELECT source_file, COUNT(*) AS n FROM chunks GROUP BY source_file ORDER BY source_file",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SourceSummary {
                name: row.get("source_file"),
                chunks: row.get("n"),
            })
            .collect())
    }

    async fn delete_source(&self, source_file: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE source_file = ?")
            .bind(source_file)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn sample_contents(&self, n: usize) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT content FROM chunks ORDER BY RANDOM() LIMIT ?")
                .bind(n as i64)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn latest_source(&self) -> Result<Option<String>> {
        let latest: Option<String> = sqlx::query_scalar(
            "SELECT source_file FROM chunks ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_clause() {
        assert_eq!(source_clause("c.source_file", None), "");
        let list = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            source_clause("c.source_file", Some(list.as_slice())),
            " AND c.source_file IN (?, ?)"
        );
    }
}
