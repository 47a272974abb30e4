//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]**: always errors; used when embeddings are not configured.
//! - **[`GeminiEmbedder`]**: calls Gemini `embedContent` through the shared key pool.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//!
//! Embeddings are all-or-nothing: a provider either returns a vector of the
//! configured length or an [`EmbeddingError`].
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] / [`cosine_distance`]
//! - [`vec_to_blob`] / [`blob_to_vec`] for SQLite BLOB storage
//!
//! # Retry Strategy
//!
//! Gemini retries across keys via [`KeyManager`]. Ollama is local and
//! keyless, so it backs off on 429/5xx and connection errors instead:
//! 1s, 2s, 4s, ... (capped at 2^5).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::{default_gemini_base_url, EmbeddingConfig};
use crate::error::{classify_http_error, EmbeddingError, ProviderError};
use crate::failover::KeyManager;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-004"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;
    /// Embed one non-empty text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

fn check_input(text: &str) -> Result<(), EmbeddingError> {
    if text.trim().is_empty() {
        return Err(EmbeddingError::EmptyInput);
    }
    Ok(())
}

fn check_dims(vec: Vec<f32>, expected: usize) -> Result<Vec<f32>, EmbeddingError> {
    if vec.is_empty() {
        return Err(EmbeddingError::EmptyPayload);
    }
    if expected > 0 && vec.len() != expected {
        return Err(EmbeddingError::Dimensions {
            expected,
            got: vec.len(),
        });
    }
    Ok(vec)
}

/// Every element must be a number; a corrupt vector is rejected whole.
fn json_floats(values: &[Value]) -> Result<Vec<f32>, EmbeddingError> {
    values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32).ok_or(EmbeddingError::MissingPayload))
        .collect()
}

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

// ============ Gemini ============

pub struct GeminiEmbedder {
    client: reqwest::Client,
    keys: KeyManager,
    base_url: String,
    model: String,
    dims: usize,
}

impl GeminiEmbedder {
    pub fn new(config: &EmbeddingConfig, keys: KeyManager) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            keys,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(default_gemini_base_url)
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            dims: config.dims,
        })
    }

    async fn call(&self, api_key: &str, text: &str) -> Result<Value, ProviderError> {
        let body = serde_json::json!({
            "model": format!("models/{}", self.model),
            "content": { "parts": [{ "text": text }] },
        });
        let response = self
            .client
            .post(format!("{}/models/{}:embedContent", self.base_url, self.model))
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::request(format!("embedding provider unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::request(format!("invalid embedding JSON: {}", e)))
    }
}

/// Extract `embedding.values` from a Gemini `embedContent` response.
pub fn parse_gemini_embedding(json: &Value) -> Result<Vec<f32>, EmbeddingError> {
    let values = json
        .get("embedding")
        .and_then(|e| e.get("values"))
        .and_then(Value::as_array)
        .ok_or(EmbeddingError::MissingPayload)?;
    json_floats(values)
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        check_input(text)?;
        let json = self
            .keys
            .execute_with_retry(|cred| async move { self.call(&cred.key, text).await })
            .await?;
        check_dims(parse_gemini_embedding(&json)?, self.dims)
    }
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }
}

/// Extract the first vector of `embeddings` from an Ollama `/api/embed` response.
pub fn parse_ollama_embedding(json: &Value) -> Result<Vec<f32>, EmbeddingError> {
    let first = json
        .get("embeddings")
        .and_then(Value::as_array)
        .and_then(|e| e.first())
        .and_then(Value::as_array)
        .ok_or(EmbeddingError::MissingPayload)?;
    json_floats(first)
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        check_input(text)?;
        let body = serde_json::json!({ "model": self.model, "input": [text] });
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.url))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: Value = response
                            .json()
                            .await
                            .map_err(|_| EmbeddingError::MissingPayload)?;
                        return check_dims(parse_ollama_embedding(&json)?, self.dims);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let message = format!("Ollama API error {}: {}", status, body_text);
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(message);
                        continue;
                    }
                    return Err(EmbeddingError::Unreachable(message));
                }
                Err(e) => {
                    last_err = Some(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    ));
                }
            }
        }

        Err(EmbeddingError::Unreachable(last_err.unwrap_or_else(|| {
            "Ollama embedding failed after retries".to_string()
        })))
    }
}

/// Create the configured [`Embedder`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"gemini"` | [`GeminiEmbedder`] (shares the generation key pool) |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig, keys: KeyManager) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "gemini" => Ok(Arc::new(GeminiEmbedder::new(config, keys)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Chunk embeddings are stored as little-endian `f32` BLOBs.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]. Trailing bytes that do not form a full
/// `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .filter_map(|b| b.try_into().ok().map(f32::from_le_bytes))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; `0` when either side is empty, all
/// zeros, or the dimensions differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, sq_a, sq_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(d, x2, y2), (x, y)| {
            (d + x * y, x2 + x * x, y2 + y * y)
        });
    let magnitude = (sq_a * sq_b).sqrt();
    if magnitude < f32::EPSILON {
        0.0
    } else {
        dot / magnitude
    }
}

/// Cosine distance in `[0, 2]`: `0` identical, `2` opposite.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    (1.0 - cosine_similarity(a, b) as f64).clamp(0.0, 2.0)
}
