//! Document ingestion: chunking → embedding → storage.
//!
//! Chunks are embedded and stored independently, up to `concurrency` at a
//! time. A chunk whose embedding or insert fails is skipped with a warning;
//! ingestion fails only when no chunk at all could be stored.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::chunk::split_text;
use crate::config::IngestConfig;
use crate::embedding::Embedder;
use crate::models::NewChunk;
use crate::store::CandidateStore;

/// Outcome of ingesting one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub file_name: String,
    /// Chunks stored.
    pub chunks_count: usize,
    /// Chunks produced by the splitter.
    pub total_chunks: usize,
}

pub struct Ingestor {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn CandidateStore>,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn CandidateStore>, config: IngestConfig) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub async fn ingest_text(&self, source_file: &str, text: &str) -> Result<IngestReport> {
        if text.trim().is_empty() {
            bail!("no text to ingest for {}", source_file);
        }

        let chunks = split_text(text, self.config.chunk_size, self.config.chunk_overlap);
        let total = chunks.len();
        if total == 0 {
            bail!("no text chunks generated for {}", source_file);
        }
        info!(source_file, chunks = total, "ingesting document");

        let results: Vec<Result<i64>> = stream::iter(chunks.into_iter().enumerate())
            .map(|(i, content)| self.store_chunk(source_file, i, content))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut saved = 0usize;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(_) => saved += 1,
                Err(e) => last_error = Some(e),
            }
        }

        if saved == 0 {
            let cause = last_error.unwrap_or_else(|| anyhow!("unknown error"));
            return Err(cause.context(format!("failed to save any chunks for {}", source_file)));
        }

        info!(source_file, saved, total, "document ingested");
        Ok(IngestReport {
            file_name: source_file.to_string(),
            chunks_count: saved,
            total_chunks: total,
        })
    }

    /// Read a UTF-8 text file and ingest it under `name` (default: the file name).
    pub async fn ingest_file(&self, path: &Path, name: Option<&str>) -> Result<IngestReport> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = match name {
            Some(n) => n.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        };
        self.ingest_text(&name, &text).await
    }

    async fn store_chunk(&self, source_file: &str, index: usize, content: String) -> Result<i64> {
        let embedding = match self.embedder.embed(&content).await {
            Ok(v) => v,
            Err(e) => {
                warn!(source_file, chunk = index + 1, error = %e, "embedding failed, skipping chunk");
                return Err(e.into());
            }
        };

        let chunk = NewChunk {
            content,
            embedding,
            source_file: source_file.to_string(),
        };
        self.store.insert_chunk(&chunk).await.map_err(|e| {
            warn!(source_file, chunk = index + 1, error = %e, "insert failed, skipping chunk");
            e
        })
    }
}
