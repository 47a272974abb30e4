//! Scripted in-process providers shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use grounded_chat::analysis::{AnalysisBackend, AnalysisReport};
use grounded_chat::config::{GenerationConfig, RetrievalConfig};
use grounded_chat::embedding::Embedder;
use grounded_chat::error::{AnalysisError, EmbeddingError, ProviderError};
use grounded_chat::failover::KeyManager;
use grounded_chat::keypool::KeyPool;
use grounded_chat::llm::{GenerationBackend, TextStream};
use grounded_chat::models::NewChunk;
use grounded_chat::orchestrator::{Components, StreamingOrchestrator};
use grounded_chat::rerank::Reranker;
use grounded_chat::sessions::{InMemorySessionStore, SessionStore};
use grounded_chat::store::memory::InMemoryStore;
use grounded_chat::store::CandidateStore;

// ============ Embedding ============

/// Embeds text by looking up registered vectors, falling back to a fixed one.
/// Texts containing a failure marker return an error.
pub struct FakeEmbedder {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    fallback: Vec<f32>,
    fail_marker: Option<String>,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(fallback: Vec<f32>) -> Self {
        Self {
            vectors: Mutex::new(HashMap::new()),
            fallback,
            fail_marker: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_marker = Some(marker.to_string());
        self
    }

    pub fn with(self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.lock().unwrap().insert(text.to_string(), vector);
        self
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake"
    }

    fn dims(&self) -> usize {
        self.fallback.len()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_marker {
            if text.contains(marker.as_str()) {
                return Err(EmbeddingError::Unreachable("scripted failure".into()));
            }
        }
        Ok(self
            .vectors
            .lock()
            .unwrap()
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

// ============ Generation ============

#[derive(Clone)]
pub enum StreamScript {
    /// Items yielded in order, then the stream ends.
    Items(Vec<Result<String, ProviderError>>),
    /// Opening the stream fails.
    OpenError(ProviderError),
}

/// Generation backend with a scripted reply for unary calls and a scripted
/// stream. Records every call.
pub struct FakeGeneration {
    pub reply: Mutex<Result<String, ProviderError>>,
    pub stream: Mutex<StreamScript>,
    pub generate_calls: Mutex<Vec<(String, String)>>,
    pub stream_calls: Mutex<Vec<(String, String, String)>>,
}

impl FakeGeneration {
    pub fn new() -> Self {
        Self {
            reply: Mutex::new(Ok("rewritten query".to_string())),
            stream: Mutex::new(StreamScript::Items(vec![
                Ok("Hello".to_string()),
                Ok(", world".to_string()),
            ])),
            generate_calls: Mutex::new(Vec::new()),
            stream_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply(self, reply: Result<String, ProviderError>) -> Self {
        *self.reply.lock().unwrap() = reply;
        self
    }

    pub fn with_stream(self, script: StreamScript) -> Self {
        *self.stream.lock().unwrap() = script;
        self
    }

    pub fn generate_count(&self) -> usize {
        self.generate_calls.lock().unwrap().len()
    }

    /// Prompt of the most recent stream call.
    pub fn last_stream_prompt(&self) -> Option<String> {
        self.stream_calls.lock().unwrap().last().map(|c| c.2.clone())
    }
}

#[async_trait]
impl GenerationBackend for FakeGeneration {
    async fn generate(&self, api_key: &str, model: &str, _prompt: &str) -> Result<String, ProviderError> {
        self.generate_calls
            .lock()
            .unwrap()
            .push((api_key.to_string(), model.to_string()));
        self.reply.lock().unwrap().clone()
    }

    async fn stream(&self, api_key: &str, model: &str, prompt: &str) -> Result<TextStream, ProviderError> {
        self.stream_calls.lock().unwrap().push((
            api_key.to_string(),
            model.to_string(),
            prompt.to_string(),
        ));
        match self.stream.lock().unwrap().clone() {
            StreamScript::Items(items) => Ok(stream::iter(items).boxed()),
            StreamScript::OpenError(e) => Err(e),
        }
    }
}

// ============ Analysis ============

/// Analyzer with a fixed set of data files and a scripted result.
pub struct FakeAnalyzer {
    files: Vec<String>,
    result: Mutex<Result<AnalysisReport, String>>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl FakeAnalyzer {
    pub fn new(files: &[&str], output: &str) -> Self {
        Self {
            files: files.iter().map(|f| f.to_string()).collect(),
            result: Mutex::new(Ok(AnalysisReport {
                output: output.to_string(),
                code: Some("print(df.describe())".to_string()),
            })),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every analysis with an execution error.
    pub fn failing(self, message: &str) -> Self {
        *self.result.lock().unwrap() = Err(message.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AnalysisBackend for FakeAnalyzer {
    fn can_analyze(&self, source_file: &str) -> bool {
        self.files.iter().any(|f| f == source_file)
    }

    async fn analyze(&self, question: &str, source_file: &str) -> Result<AnalysisReport, AnalysisError> {
        self.calls
            .lock()
            .unwrap()
            .push((question.to_string(), source_file.to_string()));
        self.result
            .lock()
            .unwrap()
            .clone()
            .map_err(|message| AnalysisError::Execution {
                message,
                code: "print(df.describe())".to_string(),
            })
    }
}

// ============ Wiring ============

pub fn keys(n: usize) -> KeyManager {
    let pool = KeyPool::new("test", (0..n).map(|i| format!("test-key-{}", i)));
    KeyManager::new(Arc::new(pool))
}

pub async fn insert(store: &InMemoryStore, content: &str, embedding: Vec<f32>, file: &str) -> i64 {
    store
        .insert_chunk(&NewChunk {
            content: content.to_string(),
            embedding,
            source_file: file.to_string(),
        })
        .await
        .unwrap()
}

pub struct Harness {
    pub orchestrator: Arc<StreamingOrchestrator>,
    pub generation: Arc<FakeGeneration>,
    pub embedder: Arc<FakeEmbedder>,
    pub store: Arc<InMemoryStore>,
    pub sessions: Arc<InMemorySessionStore>,
    pub keys: KeyManager,
}

pub struct HarnessBuilder {
    generation: FakeGeneration,
    embedder: FakeEmbedder,
    store: Arc<InMemoryStore>,
    sessions: Arc<dyn SessionStore>,
    memory_sessions: Arc<InMemorySessionStore>,
    reranker: Reranker,
    key_count: usize,
    retrieval: RetrievalConfig,
    analyzer: Option<Arc<FakeAnalyzer>>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let memory_sessions = Arc::new(InMemorySessionStore::new());
        Self {
            generation: FakeGeneration::new(),
            embedder: FakeEmbedder::new(vec![1.0, 0.0]),
            store: Arc::new(InMemoryStore::new()),
            sessions: memory_sessions.clone(),
            memory_sessions,
            reranker: Reranker::disabled(),
            key_count: 2,
            retrieval: RetrievalConfig::default(),
            analyzer: None,
        }
    }

    pub fn generation(mut self, g: FakeGeneration) -> Self {
        self.generation = g;
        self
    }

    pub fn embedder(mut self, e: FakeEmbedder) -> Self {
        self.embedder = e;
        self
    }

    pub fn store(mut self, s: Arc<InMemoryStore>) -> Self {
        self.store = s;
        self
    }

    /// Replace the session store (e.g. with a failing one).
    pub fn sessions(mut self, s: Arc<dyn SessionStore>) -> Self {
        self.sessions = s;
        self
    }

    pub fn reranker(mut self, r: Reranker) -> Self {
        self.reranker = r;
        self
    }

    pub fn key_count(mut self, n: usize) -> Self {
        self.key_count = n;
        self
    }

    pub fn retrieval(mut self, r: RetrievalConfig) -> Self {
        self.retrieval = r;
        self
    }

    pub fn analyzer(mut self, a: Arc<FakeAnalyzer>) -> Self {
        self.analyzer = Some(a);
        self
    }

    pub fn build(self) -> Harness {
        let generation = Arc::new(self.generation);
        let embedder = Arc::new(self.embedder);
        let keys = keys(self.key_count);
        let orchestrator = StreamingOrchestrator::new(
            Components {
                generation: generation.clone(),
                generation_keys: keys.clone(),
                embedder: embedder.clone(),
                store: self.store.clone(),
                reranker: self.reranker,
                sessions: self.sessions,
                analyzer: self
                    .analyzer
                    .map(|a| a as Arc<dyn AnalysisBackend>),
            },
            self.retrieval,
            &GenerationConfig::default(),
        );
        Harness {
            orchestrator: Arc::new(orchestrator),
            generation,
            embedder,
            store: self.store,
            sessions: self.memory_sessions,
            keys,
        }
    }
}
