//! HTTP API server.
//!
//! Serves the chat pipeline, document management and chat history as a JSON
//! API, with the chat answer streamed as Server-Sent Events.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/chat` | Ask a question; SSE response |
//! | `GET`  | `/api/chat/suggestions` | Starter questions from stored documents |
//! | `GET`  | `/api/documents` | List source files |
//! | `POST` | `/api/documents` | Ingest `{ fileName, text }` |
//! | `DELETE` | `/api/documents/{name}` | Delete every chunk of a source file |
//! | `GET`  | `/api/sessions` | List sessions, newest first |
//! | `POST` | `/api/sessions` | Create a session |
//! | `GET`  | `/api/sessions/{id}` | Messages of a session, oldest first |
//! | `DELETE` | `/api/sessions/{id}` | Delete a session and its messages |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Chat stream
//!
//! ```text
//! event: metadata
//! data: {"type":"metadata","sources":["a.pdf"],"sourceIds":[12],"sessionId":3}
//!
//! data: {"type":"chunk","chunk":"The answer"}
//!
//! event: done
//! data: {"type":"done","totalChunks":1,"fullLength":10,"sessionId":3}
//! ```
//!
//! On the data-analysis route `metadata` carries `"analysis":true` and the
//! generated `code`, each chart follows the chunks as an
//! `event: chart` with `{"type":"chart","chartData":"<base64>","index":0}`,
//! and `done` adds `"analysis":true` and `chartCount`.
//!
//! Errors found before the stream starts are returned as a JSON error with
//! an HTTP status. Once the stream has started, errors arrive as a single
//! `error` event.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embeddings_disabled` (400),
//! `unsafe_code` (400), `not_found` (404), `invalid_api_key` (502),
//! `provider_error` (502), `analysis_failed` (500), `internal` (500).

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::bail;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

use crate::analysis::{AnalysisBackend, ScriptAnalyzer};
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::error::{AnalysisError, ChatError, EmbeddingError};
use crate::failover::KeyManager;
use crate::ingest::{IngestReport, Ingestor};
use crate::llm::{GenerationBackend, GeminiBackend};
use crate::models::{ChatMessageRecord, ChatSession};
use crate::orchestrator::{ChatEvent, ChatRequest, Components, StreamingOrchestrator};
use crate::rerank::{CohereRerankBackend, Reranker};
use crate::sessions::{SessionStore, SqliteSessionStore};
use crate::store::sqlite::SqliteStore;
use crate::store::CandidateStore;
use crate::suggest::Suggester;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<StreamingOrchestrator>,
    pub store: Arc<dyn CandidateStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub ingestor: Arc<Ingestor>,
    pub suggester: Arc<Suggester>,
}

impl AppState {
    /// Wire every component against the SQLite pool and the configured providers.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let generation_pool = Arc::new(config.generation.key_pool());
        if generation_pool.is_empty() {
            bail!(
                "No generation API keys configured. Set {} (comma-separated) or {}.",
                config.generation.api_keys_env,
                config.generation.api_key_env
            );
        }
        let generation_keys = KeyManager::new(generation_pool);
        let generation: Arc<dyn GenerationBackend> = Arc::new(GeminiBackend::new(&config.generation)?);
        let embedder = create_embedder(&config.embedding, generation_keys.clone())?;

        let store: Arc<dyn CandidateStore> = Arc::new(SqliteStore::new(pool.clone()));
        let sessions: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(pool));

        let reranker = if config.rerank.enabled {
            Reranker::new(
                Arc::new(CohereRerankBackend::new(&config.rerank)?),
                KeyManager::new(Arc::new(config.rerank.key_pool())),
            )
        } else {
            Reranker::disabled()
        };

        let suggester = Suggester::new(
            Arc::clone(&store),
            Arc::clone(&generation),
            generation_keys.clone(),
            config.generation.models.clone(),
        );
        let ingestor = Ingestor::new(Arc::clone(&embedder), Arc::clone(&store), config.ingest.clone());

        let analyzer: Option<Arc<dyn AnalysisBackend>> = if config.analysis.enabled {
            Some(Arc::new(ScriptAnalyzer::new(
                &config.analysis,
                Arc::clone(&generation),
                generation_keys.clone(),
                config.generation.rewrite_model(),
            )))
        } else {
            None
        };

        let orchestrator = StreamingOrchestrator::new(
            Components {
                generation,
                generation_keys,
                embedder,
                store: Arc::clone(&store),
                reranker,
                sessions: Arc::clone(&sessions),
                analyzer,
            },
            config.retrieval.clone(),
            &config.generation,
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            store,
            sessions,
            ingestor: Arc::new(ingestor),
            suggester: Arc::new(suggester),
        })
    }
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::migrate_pool(&pool).await?;
    let state = AppState::from_config(config, pool)?;

    let app = router(state, &config.server.allowed_origins);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "server listening");
    println!("gchat server listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router. An empty `allowed_origins` permits any origin.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/suggestions", get(handle_suggestions))
        .route("/api/documents", get(handle_list_documents).post(handle_ingest_document))
        .route("/api/documents/{name}", delete(handle_delete_document))
        .route("/api/sessions", get(handle_list_sessions).post(handle_create_session))
        .route("/api/sessions/{id}", get(handle_get_session).delete(handle_delete_session))
        .route("/health", get(handle_health))
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn internal(err: anyhow::Error) -> AppError {
    error!(error = %err, "request failed");
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{:#}", err))
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        let message = err.to_string();
        match err {
            ChatError::Validation(_) => bad_request(message),
            ChatError::Embedding(EmbeddingError::Disabled) => {
                app_error(StatusCode::BAD_REQUEST, "embeddings_disabled", message)
            }
            ChatError::InvalidCredential(_) => {
                app_error(StatusCode::BAD_GATEWAY, "invalid_api_key", message)
            }
            ChatError::Embedding(_) | ChatError::Generation(_) => {
                app_error(StatusCode::BAD_GATEWAY, "provider_error", message)
            }
            ChatError::Retrieval(e) => internal(e),
            ChatError::Analysis(e) => analysis_error(e),
        }
    }
}

fn analysis_error(err: AnalysisError) -> AppError {
    let message = err.to_string();
    match err {
        AnalysisError::NotFound(_) => not_found(message),
        AnalysisError::UnsafeCode { .. } => app_error(StatusCode::BAD_REQUEST, "unsafe_code", message),
        AnalysisError::CodeGeneration(ref f) if f.is_invalid_credential() => {
            app_error(StatusCode::BAD_GATEWAY, "invalid_api_key", message)
        }
        AnalysisError::CodeGeneration(_) => app_error(StatusCode::BAD_GATEWAY, "provider_error", message),
        AnalysisError::Preview(_) | AnalysisError::Execution { .. } | AnalysisError::Timeout(_) => {
            error!(error = %message, "analysis failed");
            app_error(StatusCode::INTERNAL_SERVER_ERROR, "analysis_failed", message)
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/chat ============

async fn handle_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let Json(request) = payload.map_err(|e| bad_request(e.body_text()))?;
    let events = Arc::clone(&state.orchestrator).chat(request).await?;
    let sse = events.map(|event| Ok(to_sse_event(&event)));
    Ok(Sse::new(sse).keep_alive(KeepAlive::default()))
}

/// Frame a [`ChatEvent`]. Chunks are unnamed data events.
pub fn to_sse_event(event: &ChatEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "error": "Encoding error", "message": e.to_string() })
            .to_string()
    });
    let frame = Event::default().data(data);
    match event.sse_name() {
        Some(name) => frame.event(name),
        None => frame,
    }
}

// ============ GET /api/chat/suggestions ============

#[derive(Serialize)]
struct SuggestionsResponse {
    questions: Vec<String>,
}

async fn handle_suggestions(State(state): State<AppState>) -> Result<Json<SuggestionsResponse>, AppError> {
    let questions = state.suggester.suggest_questions().await.map_err(internal)?;
    Ok(Json(SuggestionsResponse { questions }))
}

// ============ /api/documents ============

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<String>,
    count: usize,
}

async fn handle_list_documents(State(state): State<AppState>) -> Result<Json<DocumentListResponse>, AppError> {
    let sources = state.store.list_sources().await.map_err(internal)?;
    let documents: Vec<String> = sources.into_iter().map(|s| s.name).collect();
    Ok(Json(DocumentListResponse {
        count: documents.len(),
        documents,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestRequest {
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    text: String,
}

async fn handle_ingest_document(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestReport>, AppError> {
    let Json(req) = payload.map_err(|e| bad_request(e.body_text()))?;
    let file_name = req.file_name.trim();
    if file_name.is_empty() {
        return Err(bad_request("fileName is required"));
    }
    if req.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let report = state
        .ingestor
        .ingest_text(file_name, &req.text)
        .await
        .map_err(internal)?;
    Ok(Json(report))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteDocumentResponse {
    file_name: String,
    deleted_chunks: u64,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DeleteDocumentResponse>, AppError> {
    let deleted = state.store.delete_source(&name).await.map_err(internal)?;
    if deleted == 0 {
        return Err(not_found(format!("no document named {}", name)));
    }
    info!(source_file = %name, deleted, "document deleted");
    Ok(Json(DeleteDocumentResponse {
        file_name: name,
        deleted_chunks: deleted,
    }))
}

// ============ /api/sessions ============

#[derive(Serialize)]
struct SessionListResponse {
    sessions: Vec<ChatSession>,
}

async fn handle_list_sessions(State(state): State<AppState>) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = state.sessions.list_sessions().await.map_err(internal)?;
    Ok(Json(SessionListResponse { sessions }))
}

#[derive(Deserialize, Default)]
struct CreateSessionRequest {
    #[serde(default)]
    title: String,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    id: i64,
    title: String,
}

async fn handle_create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Json<CreateSessionResponse>, AppError> {
    let Json(req) = payload.map_err(|e| bad_request(e.body_text()))?;
    let title = match req.title.trim() {
        "" => "New Chat",
        t => t,
    };
    let session = state.sessions.create_session(title).await.map_err(internal)?;
    Ok(Json(CreateSessionResponse {
        id: session.id,
        title: session.title,
    }))
}

#[derive(Serialize)]
struct SessionMessagesResponse {
    messages: Vec<ChatMessageRecord>,
}

async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SessionMessagesResponse>, AppError> {
    if state.sessions.get_session(id).await.map_err(internal)?.is_none() {
        return Err(not_found(format!("session {} not found", id)));
    }
    let messages = state.sessions.messages(id).await.map_err(internal)?;
    Ok(Json(SessionMessagesResponse { messages }))
}

async fn handle_delete_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.sessions.delete_session(id).await.map_err(internal)? {
        return Err(not_found(format!("session {} not found", id)));
    }
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}
