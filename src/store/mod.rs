//! Chunk storage abstraction.
//!
//! The [`CandidateStore`] trait covers everything the pipeline needs from
//! persisted chunks: writes from ingestion, hybrid and vector-only
//! retrieval, and a few document-management queries. Two backends:
//!
//! - [`sqlite::SqliteStore`]: FTS5 keyword index plus f32 BLOB vectors
//!   scored in Rust.
//! - [`memory::InMemoryStore`]: brute force over a `Vec`, for tests.
//!
//! Both rank through [`crate::search`], so results agree across backends.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{NewChunk, RetrievalCandidate};

/// One uploaded source file and how many chunks it has.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub name: String,
    pub chunks: i64,
}

/// Abstract chunk store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_chunk`](CandidateStore::insert_chunk) | Persist one embedded chunk |
/// | [`hybrid_search`](CandidateStore::hybrid_search) | Chunks ranked by fused keyword and vector score |
/// | [`vector_search`](CandidateStore::vector_search) | All chunks ranked by cosine distance |
/// | [`list_sources`](CandidateStore::list_sources) | Uploaded source files |
/// | [`delete_source`](CandidateStore::delete_source) | Remove every chunk of a file |
/// | [`sample_contents`](CandidateStore::sample_contents) | Random chunk texts |
/// | [`latest_source`](CandidateStore::latest_source) | Most recently ingested file |
///
/// `allowed_sources` restricts results to the named files; `None` or an
/// empty slice means no restriction.
#[async_trait]
pub trait CandidateStore: Send + Sync {
    /// Insert a chunk and return its id.
    async fn insert_chunk(&self, chunk: &NewChunk) -> Result<i64>;

    /// Every allowed chunk ranked by `w * vectorScore + (1 - w) * textScore`,
    /// where chunks with no keyword match have `textScore = 0`. A query with
    /// no usable terms, or whose terms match no chunk, yields no rows.
    async fn hybrid_search(
        &self,
        embedding: &[f32],
        query_text: &str,
        limit: usize,
        vector_weight: f64,
        allowed_sources: Option<&[String]>,
    ) -> Result<Vec<RetrievalCandidate>>;

    /// Chunks ranked by cosine distance to `embedding`.
    async fn vector_search(
        &self,
        embedding: &[f32],
        limit: usize,
        allowed_sources: Option<&[String]>,
    ) -> Result<Vec<RetrievalCandidate>>;

    async fn list_sources(&self) -> Result<Vec<SourceSummary>>;

    /// Returns the number of chunks removed.
    async fn delete_source(&self, source_file: &str) -> Result<u64>;

    /// Up to `n` chunk texts sampled from the whole store.
    async fn sample_contents(&self, n: usize) -> Result<Vec<String>>;

    /// Source file of the most recently inserted chunk.
    async fn latest_source(&self) -> Result<Option<String>>;
}

/// `Some` non-empty allow-list, or `None`.
pub(crate) fn effective_filter(allowed: Option<&[String]>) -> Option<&[String]> {
    allowed.filter(|a| !a.is_empty())
}

pub(crate) fn is_allowed(allowed: Option<&[String]>, source_file: &str) -> bool {
    match effective_filter(allowed) {
        Some(list) => list.iter().any(|s| s == source_file),
        None => true,
    }
}
