//! Generation provider contract and the Gemini backend.
//!
//! A [`GenerationBackend`] takes an explicit API key on every call; key
//! selection and rotation belong to [`KeyManager`](crate::failover::KeyManager).
//! Streaming returns a lazy [`TextStream`] of text segments. Dropping the
//! stream drops the underlying HTTP response and closes the connection.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;

use crate::config::GenerationConfig;
use crate::error::{classify_http_error, ProviderError};

/// Text segments produced by a streaming generation call, in order.
pub type TextStream = BoxStream<'static, Result<String, ProviderError>>;

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate a complete response.
    async fn generate(&self, api_key: &str, model: &str, prompt: &str)
        -> Result<String, ProviderError>;

    /// Open a streaming response. Errors returned here happen before any
    /// text is produced; errors after that arrive inside the stream.
    async fn stream(&self, api_key: &str, model: &str, prompt: &str)
        -> Result<TextStream, ProviderError>;
}

// ============ Gemini ============

pub struct GeminiBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GeminiBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        // No whole-request timeout on the client: it would also cut off
        // long-running streams. Unary calls set one per request.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    fn body(prompt: &str) -> Value {
        serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
        })
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    async fn generate(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(self.endpoint(model, "generateContent"))
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(&Self::body(prompt))
            .send()
            .await
            .map_err(|e| ProviderError::request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &body));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::request(format!("invalid JSON from Gemini: {}", e)))?;
        let text = extract_text(&json);
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(text)
    }

    async fn stream(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
    ) -> Result<TextStream, ProviderError> {
        let response = self
            .client
            .post(self.endpoint(model, "streamGenerateContent"))
            .query(&[("alt", "sse"), ("key", api_key)])
            .json(&Self::body(prompt))
            .send()
            .await
            .map_err(|e| ProviderError::request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status, &body));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| ProviderError::Stream {
                        message: e.to_string(),
                    })
            })
            .boxed();
        Ok(decode_sse_stream(bytes))
    }
}

/// Concatenate `candidates[0].content.parts[].text`.
pub fn extract_text(json: &Value) -> String {
    json.pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

// ============ SSE decoding ============

/// Splits a byte stream into complete lines. Bytes are buffered until a
/// newline so multi-byte characters split across network chunks survive.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

/// Interpret one SSE line. `None` for lines carrying no text.
fn decode_line(line: &str) -> Option<Result<String, ProviderError>> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let json: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            return Some(Err(ProviderError::Stream {
                message: format!("malformed stream payload: {}", e),
            }))
        }
    };

    if let Some(err) = json.get("error") {
        let code = err.get("code").and_then(Value::as_u64).unwrap_or(500) as u16;
        let status =
            reqwest::StatusCode::from_u16(code).unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        return Some(Err(classify_http_error(status, &err.to_string())));
    }

    let text = extract_text(&json);
    (!text.is_empty()).then_some(Ok(text))
}

struct DecodeState<S> {
    bytes: S,
    lines: LineBuffer,
    pending: VecDeque<Result<String, ProviderError>>,
    done: bool,
}

/// Turn a Gemini `alt=sse` byte stream into text segments.
///
/// The first error ends the stream.
pub fn decode_sse_stream<S>(bytes: S) -> TextStream
where
    S: Stream<Item = Result<Vec<u8>, ProviderError>> + Unpin + Send + 'static,
{
    let state = DecodeState {
        bytes,
        lines: LineBuffer::default(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.done = true;
                    st.pending.clear();
                }
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    for line in st.lines.push(&chunk) {
                        st.pending.extend(decode_line(&line));
                    }
                }
                Some(Err(e)) => st.pending.push_back(Err(e)),
                None => {
                    st.done = true;
                    if let Some(line) = st.lines.finish() {
                        st.pending.extend(decode_line(&line));
                    }
                }
            }
        }
    })
    .boxed()
}
