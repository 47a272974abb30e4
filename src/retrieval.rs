//! Broad candidate retrieval.
//!
//! [`HybridRetriever`] runs the fused vector + keyword query first. When that
//! returns nothing (typically because no chunk matched any keyword) it
//! repeats the query with vector-only ranking at the same limit.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::fallback::or_if_empty;
use crate::models::RetrievalCandidate;
use crate::store::CandidateStore;

#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    pub limit: usize,
    pub vector_weight: f64,
}

pub struct HybridRetriever {
    store: Arc<dyn CandidateStore>,
}

impl HybridRetriever {
    pub fn new(store: Arc<dyn CandidateStore>) -> Self {
        Self { store }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        embedding: &[f32],
        params: RetrievalParams,
        allowed_sources: Option<&[String]>,
    ) -> Result<Vec<RetrievalCandidate>> {
        let allowed = allowed_sources.filter(|a| !a.is_empty());

        let candidates = or_if_empty(
            "hybrid_search",
            self.store
                .hybrid_search(embedding, query, params.limit, params.vector_weight, allowed),
            || self.store.vector_search(embedding, params.limit, allowed),
        )
        .await?;

        debug!(
            count = candidates.len(),
            limit = params.limit,
            filtered = allowed.is_some(),
            "retrieved candidates"
        );
        Ok(candidates)
    }
}
