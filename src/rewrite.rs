//! Follow-up question rewriting.
//!
//! With no history the question is returned unchanged and no provider call
//! is made. Otherwise one generation call resolves references against the
//! history; any failure falls back to the original question.

use std::sync::Arc;

use tracing::{debug, info};

use crate::fallback::with_fallback;
use crate::failover::KeyManager;
use crate::error::{FailoverError, ProviderError};
use crate::llm::GenerationBackend;
use crate::models::ConversationTurn;
use crate::prompt::rewrite_prompt;

pub struct QueryRewriter {
    backend: Arc<dyn GenerationBackend>,
    keys: KeyManager,
    model: String,
}

impl QueryRewriter {
    pub fn new(backend: Arc<dyn GenerationBackend>, keys: KeyManager, model: impl Into<String>) -> Self {
        Self {
            backend,
            keys,
            model: model.into(),
        }
    }

    pub async fn rewrite(&self, question: &str, history: &[ConversationTurn]) -> String {
        if history.is_empty() {
            debug!("no history, using question as query");
            return question.to_string();
        }

        let rewritten = with_fallback("rewrite", self.call(question, history), || {
            question.to_string()
        })
        .await;
        info!(original = %question, rewritten = %rewritten, "query rewritten");
        rewritten
    }

    async fn call(&self, question: &str, history: &[ConversationTurn]) -> Result<String, FailoverError> {
        let prompt = rewrite_prompt(history, question);
        let text = self
            .keys
            .execute_with_retry(|cred| {
                let prompt = &prompt;
                async move { self.backend.generate(&cred.key, &self.model, prompt).await }
            })
            .await?;
        let cleaned = clean_rewrite(&text);
        if cleaned.is_empty() {
            return Err(FailoverError::Provider(ProviderError::EmptyResponse));
        }
        Ok(cleaned)
    }
}

/// Strip whitespace and wrapping quotes the model sometimes adds.
fn clean_rewrite(text: &str) -> String {
    text.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}
