//! Error types for the retrieval-and-generation pipeline.
//!
//! Provider adapters (generation, embedding, rerank) all report failures as
//! [`ProviderError`]; the [`KeyManager`](crate::failover::KeyManager) turns
//! those into [`FailoverError`] outcomes. [`ChatError`] covers everything that
//! can go wrong before the first SSE event is written, including the
//! [`AnalysisError`]s of the data-analysis flow.

use reqwest::StatusCode;

/// A failure reported by an external provider call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// Rate limit or quota exhaustion on the current credential.
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// The credential was rejected. Signals misconfiguration, never retried.
    #[error("invalid API key: {message}")]
    InvalidCredential { message: String },

    /// Any other request failure (network, 4xx/5xx, malformed payload).
    #[error("provider request failed: {message}")]
    Request { message: String },

    /// Failure while reading an already-open stream.
    #[error("stream error: {message}")]
    Stream { message: String },

    /// The provider answered without any usable content.
    #[error("provider returned an empty response")]
    EmptyResponse,
}

impl ProviderError {
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, Self::InvalidCredential { .. })
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "quota exceeded",
    "rate limit",
    "resource_exhausted",
    "too many requests",
];

const INVALID_KEY_MARKERS: &[&str] = &[
    "api key not valid",
    "api_key_invalid",
    "invalid api key",
    "authentication failed",
];

/// Map an HTTP error status and body onto the provider error taxonomy.
///
/// Providers disagree on status codes for bad keys (Gemini answers 400 with
/// `API_KEY_INVALID`), so the body is inspected as well as the status.
pub fn classify_http_error(status: StatusCode, body: &str) -> ProviderError {
    let lower = body.to_lowercase();
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 300));

    if status == StatusCode::UNAUTHORIZED || INVALID_KEY_MARKERS.iter().any(|m| lower.contains(m)) {
        return ProviderError::InvalidCredential { message };
    }
    if status == StatusCode::TOO_MANY_REQUESTS || RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
    {
        return ProviderError::RateLimited { message };
    }
    ProviderError::Request { message }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Outcome of a failed [`KeyManager`](crate::failover::KeyManager) execution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailoverError {
    #[error("no API keys configured")]
    NoKeys,

    #[error("invalid API key at index {index}: {source}")]
    InvalidCredential {
        index: usize,
        #[source]
        source: ProviderError,
    },

    #[error("all API keys exhausted (tried {attempts} keys)")]
    Exhausted {
        attempts: usize,
        #[source]
        last: Option<ProviderError>,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl FailoverError {
    pub fn is_invalid_credential(&self) -> bool {
        match self {
            Self::InvalidCredential { .. } => true,
            Self::Provider(e) => e.is_invalid_credential(),
            _ => false,
        }
    }
}

/// Embedding generation failure. Embeddings are all-or-nothing.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding input is empty")]
    EmptyInput,

    #[error("embedding provider is disabled")]
    Disabled,

    #[error("embedding provider unreachable: {0}")]
    Unreachable(String),

    #[error("embedding response has no embedding payload")]
    MissingPayload,

    #[error("embedding payload is empty")]
    EmptyPayload,

    #[error("embedding has {got} dimensions, expected {expected}")]
    Dimensions { expected: usize, got: usize },

    #[error(transparent)]
    Failover(#[from] FailoverError),
}

/// Failure of the data-analysis flow before any answer is streamed.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("no data file found for {0}")]
    NotFound(String),

    #[error("failed to read data file: {0}")]
    Preview(String),

    #[error("failed to generate analysis code: {0}")]
    CodeGeneration(#[from] FailoverError),

    #[error("generated code contains a disallowed operation: {pattern}")]
    UnsafeCode { pattern: String, code: String },

    #[error("analysis execution failed: {message}")]
    Execution { message: String, code: String },

    #[error("analysis timed out after {0}s")]
    Timeout(u64),
}

/// Errors raised before the response stream is committed.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("failed to generate query embedding: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("failed to search documents: {0}")]
    Retrieval(anyhow::Error),

    #[error("invalid API key: {0}")]
    InvalidCredential(String),

    #[error("failed to start generation: {0}")]
    Generation(String),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_429_is_rate_limit() {
        let err = classify_http_error(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.is_rate_limit());
    }

    #[test]
    fn test_classify_quota_body_is_rate_limit() {
        let err = classify_http_error(
            StatusCode::FORBIDDEN,
            r#"{"error":{"status":"RESOURCE_EXHAUSTED","message":"Quota exceeded"}}"#,
        );
        assert!(err.is_rate_limit());
    }

    #[test]
    fn test_classify_gemini_bad_key() {
        let err = classify_http_error(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"API key not valid. Please pass a valid API key.","status":"INVALID_ARGUMENT"}}"#,
        );
        assert!(err.is_invalid_credential());
    }

    #[test]
    fn test_classify_401() {
        let err = classify_http_error(StatusCode::UNAUTHORIZED, "");
        assert!(err.is_invalid_credential());
    }

    #[test]
    fn test_classify_server_error_is_plain_request() {
        let err = classify_http_error(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, ProviderError::Request { .. }));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
