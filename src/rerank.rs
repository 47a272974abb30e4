//! Second-pass relevance reranking.
//!
//! [`Reranker`] sends the query and candidate texts to a cross-encoder
//! service and keeps the top-N in the order it returns. The service has its
//! own key pool with the same rotation rules as generation. Reranking is
//! optional: any failure, a missing key pool, or a reply with no usable
//! indices keeps the first N candidates in their retrieval order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RerankConfig;
use crate::error::{classify_http_error, FailoverError, ProviderError};
use crate::failover::KeyManager;
use crate::fallback::with_fallback;
use crate::models::RetrievalCandidate;

/// One scored position in the input document list.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankHit {
    pub index: usize,
    pub score: f64,
}

#[async_trait]
pub trait RerankBackend: Send + Sync {
    async fn rerank(
        &self,
        api_key: &str,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>, ProviderError>;
}

// ============ Cohere ============

pub struct CohereRerankBackend {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl CohereRerankBackend {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct CohereResponse {
    #[serde(default)]
    results: Vec<CohereResult>,
}

#[derive(Deserialize)]
struct CohereResult {
    index: i64,
    #[serde(default)]
    relevance_score: f64,
}

/// Cohere answers 403 for exhausted trial quotas, so it rotates like a 429.
fn classify_cohere_error(status: StatusCode, body: &str) -> ProviderError {
    if status == StatusCode::FORBIDDEN {
        return ProviderError::RateLimited {
            message: format!("HTTP 403: {}", body),
        };
    }
    classify_http_error(status, body)
}

#[async_trait]
impl RerankBackend for CohereRerankBackend {
    async fn rerank(
        &self,
        api_key: &str,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": top_n,
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_cohere_error(status, &text));
        }

        let parsed: CohereResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::request(format!("invalid rerank response: {}", e)))?;

        Ok(parsed
            .results
            .into_iter()
            .filter(|r| r.index >= 0)
            .map(|r| RerankHit {
                index: r.index as usize,
                score: r.relevance_score,
            })
            .collect())
    }
}

// ============ Reranker ============

pub struct Reranker {
    provider: Option<(Arc<dyn RerankBackend>, KeyManager)>,
}

impl Reranker {
    pub fn new(backend: Arc<dyn RerankBackend>, keys: KeyManager) -> Self {
        Self {
            provider: Some((backend, keys)),
        }
    }

    /// A reranker that always keeps retrieval order.
    pub fn disabled() -> Self {
        Self { provider: None }
    }

    /// Indices into `documents` of the `top_n` most relevant, best first.
    pub async fn rerank_indices(&self, query: &str, documents: &[String], top_n: usize) -> Vec<usize> {
        self.ranked(query, documents, top_n)
            .await
            .into_iter()
            .map(|(i, _)| i)
            .collect()
    }

    /// Reorder `candidates` by relevance to `query` and keep the top `top_n`.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalCandidate>,
        top_n: usize,
    ) -> Vec<RetrievalCandidate> {
        let documents: Vec<String> = candidates.iter().map(|c| c.content.clone()).collect();
        let ranked = self.ranked(query, &documents, top_n).await;
        debug!(input = candidates.len(), kept = ranked.len(), "reranked candidates");

        let mut slots: Vec<Option<RetrievalCandidate>> = candidates.into_iter().map(Some).collect();
        ranked
            .into_iter()
            .filter_map(|(i, score)| {
                let mut c = slots.get_mut(i).and_then(Option::take)?;
                c.rerank_score = score;
                Some(c)
            })
            .collect()
    }

    /// `(index, score)` pairs; the score is `None` when retrieval order was kept.
    async fn ranked(&self, query: &str, documents: &[String], top_n: usize) -> Vec<(usize, Option<f64>)> {
        let n = top_n.min(documents.len());
        if n == 0 {
            return Vec::new();
        }
        let Some((backend, keys)) = &self.provider else {
            return original_order(n);
        };
        if keys.pool().is_empty() {
            warn!("no rerank keys configured, keeping retrieval order");
            return original_order(n);
        }

        let call = async {
            let hits = keys
                .execute_with_retry(|cred| {
                    let backend = Arc::clone(backend);
                    async move { backend.rerank(&cred.key, query, documents, n).await }
                })
                .await?;
            let keep = sanitize_indices(hits.iter().map(|h| h.index), documents.len(), n);
            if keep.is_empty() {
                return Err(FailoverError::Provider(ProviderError::EmptyResponse));
            }
            Ok::<_, FailoverError>(keep
                .into_iter()
                .map(|i| {
                    let score = hits.iter().find(|h| h.index == i).map(|h| h.score);
                    (i, score)
                })
                .collect())
        };

        with_fallback("rerank", call, || original_order(n)).await
    }
}

fn original_order(n: usize) -> Vec<(usize, Option<f64>)> {
    (0..n).map(|i| (i, None)).collect()
}

/// Drop out-of-range and repeated indices, keep first-seen order, cap at `top_n`.
pub fn sanitize_indices(
    indices: impl IntoIterator<Item = usize>,
    len: usize,
    top_n: usize,
) -> Vec<usize> {
    let mut seen = HashSet::new();
    indices
        .into_iter()
        .filter(|&i| i < len && seen.insert(i))
        .take(top_n)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypool::KeyPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        reply: Result<Vec<usize>, ProviderError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RerankBackend for Scripted {
        async fn rerank(
            &self,
            _api_key: &str,
            _query: &str,
            _documents: &[String],
            _top_n: usize,
        ) -> Result<Vec<RerankHit>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map(|v| {
                v.into_iter()
                    .map(|index| RerankHit { index, score: 0.5 })
                    .collect()
            })
        }
    }

    fn reranker(reply: Result<Vec<usize>, ProviderError>, keys: usize) -> (Reranker, Arc<Scripted>) {
        let backend = Arc::new(Scripted {
            reply,
            calls: AtomicUsize::new(0),
        });
        let pool = KeyPool::new("cohere", (0..keys).map(|i| format!("key-{}", i)));
        let keys = KeyManager::new(Arc::new(pool));
        (Reranker::new(backend.clone(), keys), backend)
    }

    fn docs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("doc {}", i)).collect()
    }

    #[test]
    fn test_sanitize_dedupes_and_drops_out_of_range() {
        assert_eq!(sanitize_indices([3, 1, 3, 9, 0, 2], 4, 3), vec![3, 1, 0]);
    }

    #[tokio::test]
    async fn test_uses_provider_order() {
        let (r, _) = reranker(Ok(vec![4, 2, 0]), 1);
        assert_eq!(r.rerank_indices("q", &docs(6), 3).await, vec![4, 2, 0]);
    }

    #[tokio::test]
    async fn test_failure_keeps_first_n() {
        let (r, _) = reranker(Err(ProviderError::request("boom")), 1);
        assert_eq!(r.rerank_indices("q", &docs(8), 5).await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_rate_limited_on_every_key_keeps_first_n() {
        let err = ProviderError::RateLimited {
            message: "429".into(),
        };
        let (r, backend) = reranker(Err(err), 3);
        assert_eq!(r.rerank_indices("q", &docs(2), 5).await, vec![0, 1]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_usable_indices_keeps_first_n() {
        let (r, _) = reranker(Ok(vec![10, 11]), 1);
        assert_eq!(r.rerank_indices("q", &docs(3), 2).await, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_no_keys_skips_provider() {
        let (r, backend) = reranker(Ok(vec![1, 0]), 0);
        assert_eq!(r.rerank_indices("q", &docs(3), 2).await, vec![0, 1]);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rerank_reorders_candidates() {
        let (r, _) = reranker(Ok(vec![1, 1, 0]), 1);
        let cands: Vec<RetrievalCandidate> = (0..3)
            .map(|i| RetrievalCandidate {
                id: i,
                content: format!("c{}", i),
                source_file: "f".into(),
                distance: 0.1,
                rerank_score: None,
            })
            .collect();
        let out = r.rerank("q", cands, 2).await;
        let ids: Vec<i64> = out.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 0]);
        assert_eq!(out[0].rerank_score, Some(0.5));
    }

    #[tokio::test]
    async fn test_disabled_keeps_order() {
        assert_eq!(Reranker::disabled().rerank_indices("q", &docs(4), 3).await, vec![0, 1, 2]);
    }

    #[test]
    fn test_cohere_403_rotates() {
        assert!(classify_cohere_error(StatusCode::FORBIDDEN, "trial limit").is_rate_limit());
        assert!(classify_cohere_error(StatusCode::UNAUTHORIZED, "").is_invalid_credential());
    }
}
