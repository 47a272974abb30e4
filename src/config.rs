//! TOML configuration.
//!
//! Everything except provider credentials lives in the config file.
//! Credentials are read from the environment (optionally populated from a
//! `.env` file) by name, so the file can be committed safely.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::keypool::KeyPool;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Empty means any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: Vec::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_limit: default_candidate_limit(),
            vector_weight: default_vector_weight(),
            rerank_top_n: default_rerank_top_n(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_candidate_limit() -> usize {
    25
}
fn default_vector_weight() -> f64 {
    0.7
}
fn default_rerank_top_n() -> usize {
    5
}
fn default_similarity_threshold() -> f64 {
    0.65
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Base URL override. Gemini and Ollama each have a sensible default.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            url: None,
            timeout_secs: default_embedding_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "gemini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-004".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Model fallback chain, tried in order.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    /// Model used for query rewriting. Defaults to the head of `models`.
    #[serde(default)]
    pub rewrite_model: Option<String>,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_gemini_keys_env")]
    pub api_keys_env: String,
    #[serde(default = "default_gemini_key_env")]
    pub api_key_env: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            rewrite_model: None,
            base_url: default_gemini_base_url(),
            timeout_secs: default_generation_timeout(),
            api_keys_env: default_gemini_keys_env(),
            api_key_env: default_gemini_key_env(),
        }
    }
}

impl GenerationConfig {
    pub fn rewrite_model(&self) -> &str {
        self.rewrite_model
            .as_deref()
            .or_else(|| self.models.first().map(String::as_str))
            .unwrap_or("gemini-2.0-flash")
    }

    pub fn key_pool(&self) -> KeyPool {
        KeyPool::from_env("gemini", &self.api_keys_env, &self.api_key_env)
    }
}

fn default_models() -> Vec<String> {
    [
        "gemini-2.0-flash",
        "gemini-2.0-flash-001",
        "gemini-flash-latest",
        "gemini-2.5-flash",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}
pub(crate) fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_generation_timeout() -> u64 {
    60
}
fn default_gemini_keys_env() -> String {
    "GEMINI_API_KEYS".to_string()
}
fn default_gemini_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default = "default_rerank_url")]
    pub url: String,
    #[serde(default = "default_rerank_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_cohere_keys_env")]
    pub api_keys_env: String,
    #[serde(default = "default_cohere_key_env")]
    pub api_key_env: String,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_rerank_model(),
            url: default_rerank_url(),
            timeout_secs: default_rerank_timeout(),
            api_keys_env: default_cohere_keys_env(),
            api_key_env: default_cohere_key_env(),
        }
    }
}

impl RerankConfig {
    pub fn key_pool(&self) -> KeyPool {
        KeyPool::from_env("cohere", &self.api_keys_env, &self.api_key_env)
    }
}

fn default_true() -> bool {
    true
}
fn default_rerank_model() -> String {
    "rerank-multilingual-v3.0".to_string()
}
fn default_rerank_url() -> String {
    "https://api.cohere.com/v1/rerank".to_string()
}
fn default_rerank_timeout() -> u64 {
    15
}
fn default_cohere_keys_env() -> String {
    "COHERE_API_KEYS".to_string()
}
fn default_cohere_key_env() -> String {
    "COHERE_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_concurrency() -> usize {
    4
}

/// Data-analysis chat for CSV and Excel sources.
///
/// `command` is run as `<command...> <data file> <code>`. It prints the
/// analysis result on stdout; a failure exits non-zero, optionally with a
/// `{"error": "..."}` line on stderr.
#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory holding the uploaded data files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_analysis_command")]
    pub command: Vec<String>,
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
    /// Model for code generation. Defaults to the head of `generation.models`.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_dir: default_data_dir(),
            command: default_analysis_command(),
            timeout_secs: default_analysis_timeout(),
            preview_rows: default_preview_rows(),
            model: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("uploads")
}
fn default_analysis_command() -> Vec<String> {
    vec!["python3".to_string(), "scripts/code_interpreter.py".to_string()]
}
fn default_analysis_timeout() -> u64 {
    60
}
fn default_preview_rows() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

impl Config {
    /// A config with every default and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            server: ServerConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            rerank: RerankConfig::default(),
            ingest: IngestConfig::default(),
            analysis: AnalysisConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Load `.env` from the working directory, if present.
///
/// Files saved by some Windows editors start with a UTF-8 BOM, which
/// `dotenvy` would fold into the first variable name; strip it first.
pub fn load_dotenv() {
    let path = Path::new(".env");
    let Ok(raw) = std::fs::read_to_string(path) else {
        return;
    };
    let content = raw.strip_prefix('\u{feff}').unwrap_or(&raw);
    for item in dotenvy::from_read_iter(content.as_bytes()) {
        match item {
            Ok((key, value)) => {
                if std::env::var_os(&key).is_none() {
                    std::env::set_var(key, value);
                }
            }
            Err(e) => tracing::warn!(error = %e, "skipping malformed .env line"),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate retrieval
    if config.retrieval.candidate_limit == 0 {
        anyhow::bail!("retrieval.candidate_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.vector_weight) {
        anyhow::bail!("retrieval.vector_weight must be in [0.0, 1.0]");
    }
    if config.retrieval.rerank_top_n == 0 {
        anyhow::bail!("retrieval.rerank_top_n must be >= 1");
    }
    let t = config.retrieval.similarity_threshold;
    if !(t > 0.0 && t <= 2.0) {
        anyhow::bail!("retrieval.similarity_threshold must be in (0.0, 2.0]");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "gemini" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, gemini, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    // Validate generation
    if config.generation.models.is_empty() {
        anyhow::bail!("generation.models must list at least one model");
    }

    // Validate ingest
    if config.ingest.chunk_size == 0 {
        anyhow::bail!("ingest.chunk_size must be > 0");
    }
    if config.ingest.concurrency == 0 {
        anyhow::bail!("ingest.concurrency must be >= 1");
    }

    // Validate analysis
    if config.analysis.enabled && config.analysis.command.is_empty() {
        anyhow::bail!("analysis.command must name a program when analysis is enabled");
    }

    Ok(())
}
