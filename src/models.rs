//! Core data models used throughout grounded-chat.
//!
//! These types represent the stored chunks, retrieval candidates, dialogue
//! turns and persisted chat sessions that flow through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored fragment of an uploaded document.
///
/// Written once by ingestion. The keyword index entry is derived from
/// `content` by the store and regenerated whenever `content` changes.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub id: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub source_file: String,
}

/// A chunk to be persisted; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub content: String,
    pub embedding: Vec<f32>,
    pub source_file: String,
}

/// A per-query retrieval hit.
///
/// `distance` is the raw cosine distance between the query embedding and
/// the chunk embedding (`0` = identical, `2` = opposite), kept for
/// thresholding after reranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalCandidate {
    pub id: i64,
    pub content: String,
    pub source_file: String,
    pub distance: f64,
    pub rerank_score: Option<f64>,
}

/// Speaker of a [`ConversationTurn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "assistant")]
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "model" | "assistant" => Some(Role::Model),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// One persisted turn. Append-only; ordered by `created_at` then `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRecord {
    pub id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
