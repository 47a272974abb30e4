//! Streaming chat orchestration.
//!
//! One [`StreamingOrchestrator`] is shared by every request. Each request
//! runs in two phases:
//!
//! 1. [`StreamingOrchestrator::prepare`] does all the work that can still
//!    fail with a plain error response: validation, rewrite, embedding,
//!    retrieval, rerank, threshold filter, session resolution, and opening
//!    the generation stream. Questions about CSV or Excel sources take the
//!    data-analysis route instead (see [`crate::analysis`]): the analysis
//!    runs here and its output becomes the only context document.
//! 2. [`StreamingOrchestrator::run`] emits the event sequence over a
//!    channel. Once it starts, failures are reported only as an
//!    [`ChatEvent::Error`] event.
//!
//! # Event sequence
//!
//! ```text
//! metadata  chunk*  chart*  (done | error)
//! ```
//!
//! `metadata` is always first, chunks keep generation order, and exactly one
//! terminal event is sent. Chart events only occur on the analysis route,
//! after the last chunk. If the receiver is dropped (client disconnect)
//! the run stops and the provider stream is released.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::analysis::{tabular_targets, AnalysisBackend, AnalysisOutcome};
use crate::config::{GenerationConfig, RetrievalConfig};
use crate::context::{assemble, AssembledContext};
use crate::embedding::Embedder;
use crate::error::{ChatError, EmbeddingError, FailoverError, ProviderError};
use crate::failover::KeyManager;
use crate::keypool::Credential;
use crate::llm::{GenerationBackend, TextStream};
use crate::models::{ConversationTurn, Role};
use crate::prompt::{analysis_context, answer_prompt};
use crate::rerank::Reranker;
use crate::retrieval::{HybridRetriever, RetrievalParams};
use crate::rewrite::QueryRewriter;
use crate::sessions::{session_title, SessionStore};
use crate::store::CandidateStore;

const EVENT_BUFFER: usize = 32;

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub selected_files: Vec<String>,
    #[serde(default)]
    pub session_id: Option<i64>,
}

impl ChatRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }
}

/// One event of the chat response stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    #[serde(rename_all = "camelCase")]
    Metadata {
        sources: Vec<String>,
        source_ids: Vec<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<i64>,
        /// Set on the data-analysis route.
        #[serde(skip_serializing_if = "is_false")]
        analysis: bool,
        /// Program behind an analysis answer.
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Chunk { chunk: String },
    /// A base64 chart image produced by an analysis.
    #[serde(rename_all = "camelCase")]
    Chart { chart_data: String, index: usize },
    #[serde(rename_all = "camelCase")]
    Done {
        total_chunks: usize,
        full_length: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<i64>,
        #[serde(skip_serializing_if = "is_false")]
        analysis: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        chart_count: Option<usize>,
    },
    Error { error: String, message: String },
}

impl ChatEvent {
    /// The SSE `event:` name. Chunks are sent as unnamed data events.
    pub fn sse_name(&self) -> Option<&'static str> {
        match self {
            ChatEvent::Metadata { .. } => Some("metadata"),
            ChatEvent::Chunk { .. } => None,
            ChatEvent::Chart { .. } => Some("chart"),
            ChatEvent::Done { .. } => Some("done"),
            ChatEvent::Error { .. } => Some("error"),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done { .. } | ChatEvent::Error { .. })
    }

    fn error(error: &str, message: impl Into<String>) -> Self {
        ChatEvent::Error {
            error: error.to_string(),
            message: message.into(),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Collaborators the orchestrator is built from.
pub struct Components {
    pub generation: Arc<dyn GenerationBackend>,
    pub generation_keys: KeyManager,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn CandidateStore>,
    pub reranker: Reranker,
    pub sessions: Arc<dyn SessionStore>,
    /// `None` turns the data-analysis route off.
    pub analyzer: Option<Arc<dyn AnalysisBackend>>,
}

/// A request that has passed every pre-stream stage.
pub struct PreparedChat {
    pub context: AssembledContext,
    pub session_id: Option<i64>,
    /// Query used for retrieval and as the generation question.
    pub query: String,
    /// Present on the data-analysis route.
    pub analysis: Option<AnalysisOutcome>,
    stream: Result<TextStream, ProviderError>,
    credential: Option<Credential>,
}

pub struct StreamingOrchestrator {
    rewriter: QueryRewriter,
    embedder: Arc<dyn Embedder>,
    retriever: HybridRetriever,
    store: Arc<dyn CandidateStore>,
    analyzer: Option<Arc<dyn AnalysisBackend>>,
    reranker: Reranker,
    generation: Arc<dyn GenerationBackend>,
    keys: KeyManager,
    stream_model: String,
    sessions: Arc<dyn SessionStore>,
    retrieval: RetrievalConfig,
}

impl StreamingOrchestrator {
    pub fn new(components: Components, retrieval: RetrievalConfig, generation: &GenerationConfig) -> Self {
        let rewriter = QueryRewriter::new(
            Arc::clone(&components.generation),
            components.generation_keys.clone(),
            generation.rewrite_model(),
        );
        Self {
            rewriter,
            embedder: components.embedder,
            retriever: HybridRetriever::new(Arc::clone(&components.store)),
            store: components.store,
            analyzer: components.analyzer,
            reranker: components.reranker,
            generation: components.generation,
            keys: components.generation_keys,
            stream_model: generation.models.first().cloned().unwrap_or_default(),
            sessions: components.sessions,
            retrieval,
        }
    }

    /// Prepare and start a chat, returning the event stream.
    ///
    /// Errors returned here happen before any event is produced.
    pub async fn chat(self: Arc<Self>, request: ChatRequest) -> Result<ReceiverStream<ChatEvent>, ChatError> {
        let span = info_span!("chat", request_id = %uuid::Uuid::new_v4());
        let prepared = self.prepare(request).instrument(span.clone()).await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(&self);
        tokio::spawn(async move { this.run(prepared, tx).await }.instrument(span));
        Ok(ReceiverStream::new(rx))
    }

    pub async fn prepare(&self, request: ChatRequest) -> Result<PreparedChat, ChatError> {
        let question = request.question.as_str();
        if question.trim().is_empty() {
            return Err(ChatError::Validation("question is required".to_string()));
        }
        info!(
            history = request.history.len(),
            selected_files = request.selected_files.len(),
            "chat request"
        );

        if let Some((analyzer, source_file)) = self.analysis_route(&request.selected_files).await {
            return self.prepare_analysis(analyzer, source_file, &request).await;
        }

        let query = self.rewriter.rewrite(question, &request.history).await;

        let embedding = self.embedder.embed(&query).await.map_err(|e| match e {
            EmbeddingError::Failover(f) if f.is_invalid_credential() => {
                ChatError::InvalidCredential(f.to_string())
            }
            other => ChatError::Embedding(other),
        })?;

        let params = RetrievalParams {
            limit: self.retrieval.candidate_limit,
            vector_weight: self.retrieval.vector_weight,
        };
        let candidates = self
            .retriever
            .retrieve(&query, &embedding, params, Some(request.selected_files.as_slice()))
            .await
            .map_err(ChatError::Retrieval)?;

        let reranked = self
            .reranker
            .rerank(&query, candidates, self.retrieval.rerank_top_n)
            .await;
        let context = assemble(&reranked, self.retrieval.similarity_threshold);

        let session_id = self.resolve_session(request.session_id, question).await;

        let prompt = answer_prompt(&query, &context.entries, &request.history);
        let (stream, credential) = self.open_stream(&prompt).await?;

        Ok(PreparedChat {
            context,
            session_id,
            query,
            analysis: None,
            stream,
            credential,
        })
    }

    /// The analyzer and data file for a question about tabular sources.
    ///
    /// Any tabular file among the selected ones (or, with nothing selected,
    /// a tabular latest upload) routes to analysis, provided the analyzer
    /// has its data file. Everything else, including a failed lookup of the
    /// latest upload, stays on the retrieval route.
    async fn analysis_route(&self, selected: &[String]) -> Option<(Arc<dyn AnalysisBackend>, String)> {
        let analyzer = self.analyzer.as_ref()?;
        let latest = if selected.is_empty() {
            match self.store.latest_source().await {
                Ok(latest) => latest,
                Err(e) => {
                    warn!(error = %e, "failed to look up latest document, using retrieval");
                    None
                }
            }
        } else {
            None
        };

        let targets = tabular_targets(selected, latest.as_deref());
        if targets.is_empty() {
            return None;
        }
        match targets.into_iter().find(|f| analyzer.can_analyze(f)) {
            Some(file) => {
                info!(file = %file, "routing to data analysis");
                Some((Arc::clone(analyzer), file))
            }
            None => {
                warn!("no data file found for tabular sources, using retrieval");
                None
            }
        }
    }

    /// Run the analysis and open a stream that interprets its output.
    async fn prepare_analysis(
        &self,
        analyzer: Arc<dyn AnalysisBackend>,
        source_file: String,
        request: &ChatRequest,
    ) -> Result<PreparedChat, ChatError> {
        let question = request.question.as_str();
        let report = analyzer.analyze(question, &source_file).await?;
        let outcome = AnalysisOutcome::new(source_file, report);
        debug!(charts = outcome.charts.len(), "analysis output ready");

        let session_id = self.resolve_session(request.session_id, question).await;

        let document = analysis_context(
            &outcome.source_file,
            outcome.interpreted_output(),
            outcome.charts.len(),
        );
        let prompt = answer_prompt(question, std::slice::from_ref(&document), &request.history);
        let (stream, credential) = self.open_stream(&prompt).await?;

        Ok(PreparedChat {
            context: AssembledContext {
                entries: vec![document],
                sources: vec![outcome.source_file.clone()],
                source_ids: Vec::new(),
            },
            session_id,
            query: question.to_string(),
            analysis: Some(outcome),
            stream,
            credential,
        })
    }

    /// Reuse the caller's session or create one, then log the user turn.
    /// Failures are logged and leave the request without a session.
    async fn resolve_session(&self, requested: Option<i64>, question: &str) -> Option<i64> {
        let session_id = match requested.filter(|id| *id > 0) {
            Some(id) => id,
            None => match self.sessions.create_session(&session_title(question)).await {
                Ok(session) => {
                    debug!(session_id = session.id, title = %session.title, "created session");
                    session.id
                }
                Err(e) => {
                    warn!(error = %e, "failed to create session, continuing without one");
                    return None;
                }
            },
        };

        if let Err(e) = self.sessions.append_message(session_id, Role::User, question).await {
            warn!(session_id, error = %e, "failed to save user message");
        }
        Some(session_id)
    }

    /// Open the generation stream with the current key and the first model.
    ///
    /// An invalid key is returned as a pre-stream error. Any other failure
    /// is carried into [`run`](Self::run) and reported as an error event.
    async fn open_stream(
        &self,
        prompt: &str,
    ) -> Result<(Result<TextStream, ProviderError>, Option<Credential>), ChatError> {
        let cred = match self.keys.streaming_credential() {
            Ok(cred) => cred,
            Err(FailoverError::NoKeys) => {
                return Ok((Err(ProviderError::request("no generation API keys configured")), None))
            }
            Err(e) => return Err(ChatError::Generation(e.to_string())),
        };

        match self.generation.stream(&cred.key, &self.stream_model, prompt).await {
            Ok(stream) => Ok((Ok(stream), Some(cred))),
            Err(e) if e.is_invalid_credential() => {
                warn!(key_index = cred.index, "invalid API key when opening stream");
                Err(ChatError::InvalidCredential(e.to_string()))
            }
            Err(e) => {
                if e.is_rate_limit() {
                    self.keys.note_rate_limited(&cred);
                }
                Ok((Err(e), Some(cred)))
            }
        }
    }

    /// Emit the event sequence for a prepared request.
    pub async fn run(&self, prepared: PreparedChat, tx: mpsc::Sender<ChatEvent>) {
        let PreparedChat {
            context,
            session_id,
            analysis,
            stream,
            credential,
            ..
        } = prepared;

        let metadata = ChatEvent::Metadata {
            sources: context.sources,
            source_ids: context.source_ids,
            session_id,
            analysis: analysis.is_some(),
            code: analysis.as_ref().and_then(|a| a.code.clone()),
        };
        if tx.send(metadata).await.is_err() {
            return;
        }

        let mut stream = match (stream, &analysis) {
            (Ok(stream), _) => stream,
            (Err(e), Some(outcome)) => {
                warn!(error = %e, "interpretation unavailable, sending raw analysis output");
                self.send_raw_analysis(outcome, session_id, &tx).await;
                return;
            }
            (Err(e), None) => {
                warn!(error = %e, "failed to start streaming");
                let _ = tx
                    .send(ChatEvent::error("Failed to start streaming", e.to_string()))
                    .await;
                return;
            }
        };

        let mut full = String::new();
        let mut chunks = 0usize;

        while let Some(item) = stream.next().await {
            match item {
                Ok(text) if text.is_empty() => continue,
                Ok(text) => {
                    full.push_str(&text);
                    chunks += 1;
                    if tx.send(ChatEvent::Chunk { chunk: text }).await.is_err() {
                        info!(chunks, "client disconnected, stopping generation");
                        return;
                    }
                }
                Err(e) => {
                    if e.is_rate_limit() {
                        if let Some(cred) = &credential {
                            self.keys.note_rate_limited(cred);
                        }
                    }
                    let label = if e.is_invalid_credential() {
                        "Invalid API key"
                    } else {
                        "Streaming error"
                    };
                    warn!(chunks, error = %e, "generation stream failed");
                    let _ = tx.send(ChatEvent::error(label, e.to_string())).await;
                    return;
                }
            }
        }
        drop(stream);

        let charts = analysis.as_ref().map(|a| a.charts.as_slice()).unwrap_or_default();
        if !send_charts(charts, &tx).await {
            return;
        }

        let full_length = full.chars().count();
        info!(chunks, full_length, "streaming completed");
        let _ = tx
            .send(ChatEvent::Done {
                total_chunks: chunks,
                full_length,
                session_id,
                analysis: analysis.is_some(),
                chart_count: analysis.as_ref().map(|a| a.charts.len()),
            })
            .await;

        self.save_answer(session_id, &full).await;
    }

    /// Stream the analysis output itself, line by line, when the
    /// interpretation stream could not be opened.
    async fn send_raw_analysis(
        &self,
        outcome: &AnalysisOutcome,
        session_id: Option<i64>,
        tx: &mpsc::Sender<ChatEvent>,
    ) {
        let text = outcome.fallback_text();
        let mut chunks = 0usize;
        for line in text.lines().filter(|l| !l.is_empty()) {
            chunks += 1;
            let chunk = format!("{}\n", line);
            if tx.send(ChatEvent::Chunk { chunk }).await.is_err() {
                return;
            }
        }
        if !send_charts(&outcome.charts, tx).await {
            return;
        }
        let _ = tx
            .send(ChatEvent::Done {
                total_chunks: chunks,
                full_length: text.chars().count(),
                session_id,
                analysis: true,
                chart_count: Some(outcome.charts.len()),
            })
            .await;

        self.save_answer(session_id, text).await;
    }

    async fn save_answer(&self, session_id: Option<i64>, answer: &str) {
        let Some(id) = session_id else {
            return;
        };
        if answer.is_empty() {
            return;
        }
        if let Err(e) = self.sessions.append_message(id, Role::Model, answer).await {
            warn!(session_id = id, error = %e, "failed to save model message");
        }
    }
}

/// Send one `chart` event per payload. `false` if the client went away.
async fn send_charts(charts: &[String], tx: &mpsc::Sender<ChatEvent>) -> bool {
    for (index, chart_data) in charts.iter().enumerate() {
        let event = ChatEvent::Chart {
            chart_data: chart_data.clone(),
            index,
        };
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}
