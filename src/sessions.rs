//! Chat session and message log.
//!
//! The orchestrator treats every [`SessionStore`] call as best-effort: a
//! failure is logged and the response carries on without a session.

use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{ChatMessageRecord, ChatSession, Role};

const TITLE_CHARS: usize = 30;
const DEFAULT_TITLE: &str = "New Chat";

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, title: &str) -> Result<ChatSession>;
    async fn get_session(&self, id: i64) -> Result<Option<ChatSession>>;
    /// Newest first.
    async fn list_sessions(&self) -> Result<Vec<ChatSession>>;
    async fn append_message(&self, session_id: i64, role: Role, content: &str) -> Result<i64>;
    /// Oldest first.
    async fn messages(&self, session_id: i64) -> Result<Vec<ChatMessageRecord>>;
    /// Deletes the session and its messages. `false` if it did not exist.
    async fn delete_session(&self, id: i64) -> Result<bool>;
}

/// First 30 characters of the question as asked, with `...` when truncated.
pub fn session_title(question: &str) -> String {
    if question.trim().is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    let mut chars = question.chars();
    let head: String = chars.by_ref().take(TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

// ============ SQLite ============

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, title: &str) -> Result<ChatSession> {
        let now = Utc::now().timestamp();
        let result = sqlx::query("INSERT INTO chat_sessions (title, created_at) VALUES (?, ?)")
            .bind(title)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(ChatSession {
            id: result.last_insert_rowid(),
            title: title.to_string(),
            created_at: from_ts(now),
        })
    }

    async fn get_session(&self, id: i64) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT id, title, created_at FROM chat_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ChatSession {
            id: r.get("id"),
            title: r.get("title"),
            created_at: from_ts(r.get("created_at")),
        }))
    }

    async fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at FROM chat_sessions ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ChatSession {
                id: r.get("id"),
                title: r.get("title"),
                created_at: from_ts(r.get("created_at")),
            })
            .collect())
    }

    async fn append_message(&self, session_id: i64, role: Role, content: &str) -> Result<i64> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO chat_messages (session_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn messages(&self, session_id: i64) -> Result<Vec<ChatMessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, session_id, role, content, created_at
            FROM chat_messages
            WHERE session_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for r in &rows {
            let role: String = r.get("role");
            let Some(role) = Role::parse(&role) else {
                tracing::warn!(session_id, role = %role, "skipping message with unknown role");
                continue;
            };
            records.push(ChatMessageRecord {
                id: r.get("id"),
                session_id: r.get("session_id"),
                role,
                content: r.get("content"),
                created_at: from_ts(r.get("created_at")),
            });
        }
        Ok(records)
    }

    async fn delete_session(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============ In-memory ============

#[derive(Default)]
struct MemoryState {
    sessions: Vec<ChatSession>,
    messages: Vec<ChatMessageRecord>,
    next_session_id: i64,
    next_message_id: i64,
}

/// In-memory [`SessionStore`] for tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    state: RwLock<MemoryState>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, title: &str) -> Result<ChatSession> {
        let mut state = self.state.write().unwrap();
        state.next_session_id += 1;
        let session = ChatSession {
            id: state.next_session_id,
            title: title.to_string(),
            created_at: Utc::now(),
        };
        state.sessions.push(session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: i64) -> Result<Option<ChatSession>> {
        let state = self.state.read().unwrap();
        Ok(state.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        let state = self.state.read().unwrap();
        let mut sessions = state.sessions.clone();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(sessions)
    }

    async fn append_message(&self, session_id: i64, role: Role, content: &str) -> Result<i64> {
        let mut state = self.state.write().unwrap();
        if !state.sessions.iter().any(|s| s.id == session_id) {
            bail!("session {} does not exist", session_id);
        }
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.push(ChatMessageRecord {
            id,
            session_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn messages(&self, session_id: i64) -> Result<Vec<ChatMessageRecord>> {
        let state = self.state.read().unwrap();
        Ok(state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn delete_session(&self, id: i64) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        let before = state.sessions.len();
        state.sessions.retain(|s| s.id != id);
        if state.sessions.len() == before {
            return Ok(false);
        }
        state.messages.retain(|m| m.session_id != id);
        Ok(true)
    }
}
