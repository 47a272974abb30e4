//! Implementations of the `gchat` subcommands other than `init` and `serve`.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::StreamExt;

use crate::config::Config;
use crate::db;
use crate::migrate::migrate_pool;
use crate::orchestrator::{ChatEvent, ChatRequest};
use crate::server::AppState;
use crate::sessions::{SessionStore, SqliteSessionStore};
use crate::store::sqlite::SqliteStore;
use crate::store::CandidateStore;

async fn app_state(config: &Config) -> Result<AppState> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    AppState::from_config(config, pool)
}

pub async fn run_ingest(config: &Config, path: &Path, name: Option<&str>) -> Result<()> {
    let state = app_state(config).await?;
    let report = state.ingestor.ingest_file(path, name).await?;
    println!("ingest {}", report.file_name);
    println!("  chunks: {}", report.total_chunks);
    println!("  stored: {}", report.chunks_count);
    if report.chunks_count < report.total_chunks {
        println!("  skipped: {}", report.total_chunks - report.chunks_count);
    }
    println!("ok");
    Ok(())
}

/// Stream an answer to stdout. Sources are listed after the answer.
pub async fn run_ask(
    config: &Config,
    question: &str,
    files: Vec<String>,
    session_id: Option<i64>,
) -> Result<()> {
    let state = app_state(config).await?;
    let request = ChatRequest {
        question: question.to_string(),
        selected_files: files,
        session_id,
        ..ChatRequest::default()
    };

    let mut events = Arc::clone(&state.orchestrator).chat(request).await?;
    let mut sources = Vec::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            ChatEvent::Metadata { sources: s, .. } => sources = s,
            ChatEvent::Chunk { chunk } => {
                write!(stdout, "{}", chunk)?;
                stdout.flush()?;
            }
            ChatEvent::Chart { chart_data, index } => {
                println!("\n[chart {}: {} bytes of base64 PNG]", index + 1, chart_data.len());
            }
            ChatEvent::Done { session_id, .. } => {
                println!();
                if !sources.is_empty() {
                    println!("\nSources: {}", sources.join(", "));
                }
                if let Some(id) = session_id {
                    println!("Session: {}", id);
                }
            }
            ChatEvent::Error { error, message } => {
                println!();
                bail!("{}: {}", error, message);
            }
        }
    }
    Ok(())
}

pub async fn list_documents(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let sources = store.list_sources().await?;
    if sources.is_empty() {
        println!("No documents ingested.");
        return Ok(());
    }
    println!("{:<48} {:>8}", "DOCUMENT", "CHUNKS");
    for s in &sources {
        println!("{:<48} {:>8}", s.name, s.chunks);
    }
    Ok(())
}

pub async fn delete_document(config: &Config, name: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let deleted = SqliteStore::new(pool).delete_source(name).await?;
    if deleted == 0 {
        bail!("No document named '{}'", name);
    }
    println!("Deleted {} chunks of {}", deleted, name);
    Ok(())
}

pub async fn list_sessions(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let sessions = SqliteSessionStore::new(pool).list_sessions().await?;
    if sessions.is_empty() {
        println!("No chat sessions.");
        return Ok(());
    }
    for s in &sessions {
        println!(
            "{:>6}  {}  {}",
            s.id,
            s.created_at.format("%Y-%m-%d %H:%M"),
            s.title
        );
    }
    Ok(())
}

pub async fn show_session(config: &Config, id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteSessionStore::new(pool);
    let Some(session) = store.get_session(id).await? else {
        bail!("Session {} not found", id);
    };
    println!("# {} ({})", session.title, session.id);
    for m in store.messages(id).await? {
        println!("\n[{}] {}", m.role.as_str(), m.content);
    }
    Ok(())
}

pub async fn delete_session(config: &Config, id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    if !SqliteSessionStore::new(pool).delete_session(id).await? {
        bail!("Session {} not found", id);
    }
    println!("Deleted session {}", id);
    Ok(())
}
