//! Starter-question suggestions from stored document text.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::{FailoverError, ProviderError};
use crate::failover::KeyManager;
use crate::llm::GenerationBackend;
use crate::prompt::suggestion_prompt;
use crate::store::CandidateStore;

const SAMPLE_CHUNKS: usize = 5;
const MAX_EXCERPT_CHARS: usize = 2000;
/// A partial chunk is only worth adding if this much room is left.
const MIN_PARTIAL_CHARS: usize = 100;
const MAX_QUESTIONS: usize = 4;

pub const DEFAULT_QUESTIONS: [&str; 3] = [
    "What is the main topic of this document?",
    "Can you explain the document's contents in more detail?",
    "What are the key points to know?",
];

pub struct Suggester {
    store: Arc<dyn CandidateStore>,
    backend: Arc<dyn GenerationBackend>,
    keys: KeyManager,
    models: Vec<String>,
}

impl Suggester {
    pub fn new(
        store: Arc<dyn CandidateStore>,
        backend: Arc<dyn GenerationBackend>,
        keys: KeyManager,
        models: Vec<String>,
    ) -> Self {
        Self {
            store,
            backend,
            keys,
            models,
        }
    }

    /// Up to four questions about randomly sampled chunks.
    ///
    /// An empty store yields an empty list without calling the provider. A
    /// provider failure or unparseable reply yields [`DEFAULT_QUESTIONS`].
    pub async fn suggest_questions(&self) -> Result<Vec<String>> {
        let samples = self.store.sample_contents(SAMPLE_CHUNKS).await?;
        if samples.is_empty() {
            debug!("no documents stored, no suggestions");
            return Ok(Vec::new());
        }

        let excerpt = build_excerpt(&samples, MAX_EXCERPT_CHARS);
        let prompt = suggestion_prompt(&excerpt);

        let reply = self
            .keys
            .execute_with_model_fallback(&self.models, |cred, model| {
                let prompt = &prompt;
                let backend = Arc::clone(&self.backend);
                async move { backend.generate(&cred.key, &model, prompt).await }
            })
            .await;

        let questions = match reply {
            Ok(text) => parse_questions(&text).ok_or(FailoverError::Provider(
                ProviderError::request("reply did not contain a question list"),
            )),
            Err(e) => Err(e),
        };

        Ok(questions.unwrap_or_else(|e| {
            warn!(error = %e, "suggestion generation failed, using defaults");
            default_questions()
        }))
    }
}

pub fn default_questions() -> Vec<String> {
    DEFAULT_QUESTIONS.iter().map(|q| q.to_string()).collect()
}

/// Join samples with blank lines up to `max_chars` characters. The sample
/// that does not fit is cut and marked with `...` when enough room is left.
pub fn build_excerpt(samples: &[String], max_chars: usize) -> String {
    let mut out = String::new();
    let mut used = 0usize;
    for sample in samples {
        let len = sample.chars().count();
        if used + len > max_chars {
            let remaining = max_chars - used;
            if remaining > MIN_PARTIAL_CHARS {
                out.extend(sample.chars().take(remaining));
                out.push_str("...\n\n");
            }
            break;
        }
        out.push_str(sample);
        out.push_str("\n\n");
        used += len + 2;
    }
    out
}

/// Parse the first `[`...last `]` span of `reply` as a JSON string array.
///
/// Markdown code fences are tolerated. Entries are trimmed, blanks dropped,
/// and at most four kept. `None` if nothing usable remains.
pub fn parse_questions(reply: &str) -> Option<Vec<String>> {
    let text = reply.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    let text = text.strip_suffix("```").unwrap_or(text).trim();

    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }

    let parsed: Vec<String> = serde_json::from_str(&text[start..=end]).ok()?;
    let questions: Vec<String> = parsed
        .into_iter()
        .take(MAX_QUESTIONS)
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();

    (!questions.is_empty()).then_some(questions)
}
