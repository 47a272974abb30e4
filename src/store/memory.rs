//! In-memory [`CandidateStore`] for tests.
//!
//! Keyword scoring counts query-term occurrences in the lowercased content.
//! Chunks without any occurrence still take part in hybrid ranking with a
//! keyword score of zero.
//! Vector search is brute-force cosine distance. Sampling is deterministic
//! (the first `n` chunks), which keeps suggestion tests reproducible.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::models::{DocumentChunk, NewChunk, RetrievalCandidate};
use crate::search::{keyword_terms, rank_by_distance, rank_hybrid, KeywordMatch};

use super::{is_allowed, CandidateStore, SourceSummary};

pub struct InMemoryStore {
    chunks: RwLock<Vec<DocumentChunk>>,
    next_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Snapshot of every stored chunk, in insertion order.
    pub fn chunks(&self) -> Vec<DocumentChunk> {
        self.chunks.read().unwrap().clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_candidate(chunk: &DocumentChunk, query: &[f32]) -> RetrievalCandidate {
    RetrievalCandidate {
        id: chunk.id,
        content: chunk.content.clone(),
        source_file: chunk.source_file.clone(),
        distance: cosine_distance(query, &chunk.embedding),
        rerank_score: None,
    }
}

#[async_trait]
impl CandidateStore for InMemoryStore {
    async fn insert_chunk(&self, chunk: &NewChunk) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut chunks = self.chunks.write().unwrap();
        chunks.push(DocumentChunk {
            id,
            content: chunk.content.clone(),
            embedding: chunk.embedding.clone(),
            source_file: chunk.source_file.clone(),
        });
        Ok(id)
    }

    async fn hybrid_search(
        &self,
        embedding: &[f32],
        query_text: &str,
        limit: usize,
        vector_weight: f64,
        allowed_sources: Option<&[String]>,
    ) -> Result<Vec<RetrievalCandidate>> {
        let terms = keyword_terms(query_text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self.chunks.read().unwrap();
        let scored: Vec<KeywordMatch> = chunks
            .iter()
            .filter(|c| is_allowed(allowed_sources, &c.source_file))
            .map(|c| {
                let text_lower = c.content.to_lowercase();
                let hits: usize = terms.iter().map(|t| text_lower.matches(t.as_str()).count()).sum();
                KeywordMatch {
                    candidate: to_candidate(c, embedding),
                    raw_score: hits as f64,
                }
            })
            .collect();
        if scored.iter().all(|m| m.raw_score == 0.0) {
            return Ok(Vec::new());
        }
        Ok(rank_hybrid(scored, vector_weight, limit))
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        limit: usize,
        allowed_sources: Option<&[String]>,
    ) -> Result<Vec<RetrievalCandidate>> {
        let chunks = self.chunks.read().unwrap();
        let candidates = chunks
            .iter()
            .filter(|c| is_allowed(allowed_sources, &c.source_file))
            .map(|c| to_candidate(c, embedding))
            .collect();
        Ok(rank_by_distance(candidates, limit))
    }

    async fn list_sources(&self) -> Result<Vec<SourceSummary>> {
        let chunks = self.chunks.read().unwrap();
        let mut sources: Vec<SourceSummary> = Vec::new();
        for c in chunks.iter() {
            match sources.iter_mut().find(|s| s.name == c.source_file) {
                Some(s) => s.chunks += 1,
                None => sources.push(SourceSummary {
                    name: c.source_file.clone(),
                    chunks: 1,
                }),
            }
        }
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn delete_source(&self, source_file: &str) -> Result<u64> {
        let mut chunks = self.chunks.write().unwrap();
        let before = chunks.len();
        chunks.retain(|c| c.source_file != source_file);
        Ok((before - chunks.len()) as u64)
    }

    async fn sample_contents(&self, n: usize) -> Result<Vec<String>> {
        let chunks = self.chunks.read().unwrap();
        Ok(chunks.iter().take(n).map(|c| c.content.clone()).collect())
    }

    async fn latest_source(&self) -> Result<Option<String>> {
        let chunks = self.chunks.read().unwrap();
        Ok(chunks.last().map(|c| c.source_file.clone()))
    }
}
