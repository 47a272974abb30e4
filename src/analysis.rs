//! Data-analysis chat for tabular sources.
//!
//! When the files a question targets include a CSV or Excel source, chat
//! answers by running an analysis over the data file instead of retrieving
//! text chunks. With no files selected, the most recently ingested source
//! decides. The routing is strict: one tabular file anywhere in the
//! selection is enough.
//!
//! The analysis itself sits behind [`AnalysisBackend`]. The shipped
//! [`ScriptAnalyzer`] previews the file, asks the generation model for
//! pandas code, screens the code and runs it through an external
//! interpreter command. Its output is then interpreted by the same
//! streaming generation call as a grounded answer.
//!
//! Charts are printed by the interpreter as `[CHART_DATA:<base64>]`
//! markers. They are cut out of the output before interpretation and sent
//! to the client as separate `chart` events.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, FailoverError, ProviderError};
use crate::failover::KeyManager;
use crate::llm::GenerationBackend;
use crate::prompt::analysis_code_prompt;

pub const TABULAR_EXTENSIONS: &[&str] = &["csv", "xlsx", "xls"];

const NO_RESULT: &str = "No results were found.";

/// Substrings that reject generated code outright.
const DISALLOWED_PATTERNS: &[&str] = &[
    "import os",
    "import sys",
    "import subprocess",
    "__import__",
    "eval(",
    "exec(",
    "compile(",
    "open(",
    "file(",
    "input(",
];

const VALUE_WIDTH: usize = 18;

static CHART_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[CHART_DATA:([^\]]+)\]").expect("chart marker pattern is valid"));

pub fn is_tabular(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| TABULAR_EXTENSIONS.iter().any(|t| ext.eq_ignore_ascii_case(t)))
}

/// Tabular files a question should be analyzed against, in request order.
///
/// `selected` wins when non-empty; otherwise `latest` (the most recently
/// ingested source) is considered. Empty means ordinary retrieval.
pub fn tabular_targets(selected: &[String], latest: Option<&str>) -> Vec<String> {
    if selected.is_empty() {
        return latest.filter(|f| is_tabular(f)).map(str::to_string).into_iter().collect();
    }
    selected.iter().filter(|f| is_tabular(f)).cloned().collect()
}

/// Split interpreter output into text and base64 chart payloads.
pub fn extract_charts(output: &str) -> (String, Vec<String>) {
    let charts = CHART_MARKER
        .captures_iter(output)
        .map(|c| c[1].to_string())
        .collect();
    let text = CHART_MARKER.replace_all(output, "").trim().to_string();
    (text, charts)
}

/// Reject code containing any disallowed operation (case-insensitive).
pub fn validate_code(code: &str) -> Result<(), AnalysisError> {
    let lower = code.to_lowercase();
    match DISALLOWED_PATTERNS.iter().find(|p| lower.contains(**p)) {
        Some(pattern) => Err(AnalysisError::UnsafeCode {
            pattern: pattern.to_string(),
            code: code.to_string(),
        }),
        None => Ok(()),
    }
}

/// Column names, the first `rows` records and the row count of a data file.
///
/// Excel workbooks are opened by the interpreter, so their preview only
/// names the file.
pub fn data_preview(path: &Path, rows: usize) -> Result<String, AnalysisError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => csv_preview(path, rows),
        "xlsx" | "xls" => Ok(format!(
            "Excel workbook {} (first sheet). Inspect df.columns and df.dtypes for its structure.\n",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        )),
        other => Err(AnalysisError::Preview(format!(
            "unsupported file type '{}' (expected csv, xlsx or xls)",
            other
        ))),
    }
}

fn csv_preview(path: &Path, rows: usize) -> Result<String, AnalysisError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| AnalysisError::Preview(e.to_string()))?;
    let header = reader
        .headers()
        .map_err(|e| AnalysisError::Preview(format!("failed to read header: {}", e)))?
        .clone();

    let mut samples = Vec::new();
    let mut total = 0usize;
    // malformed rows are skipped, not fatal
    for record in reader.records().flatten() {
        total += 1;
        if samples.len() < rows {
            samples.push(record);
        }
    }

    let columns: Vec<&str> = header.iter().collect();
    let mut out = format!("CSV columns: {}\n\n", columns.join(", "));
    if !samples.is_empty() {
        out.push_str(&format!("Sample rows (first {}):\n", samples.len()));
        out.push_str(&columns.join(" | "));
        out.push('\n');
        for record in &samples {
            let cells: Vec<String> = record.iter().map(clip).collect();
            out.push_str(&cells.join(" | "));
            out.push('\n');
        }
    }
    out.push_str(&format!("\nTotal rows: {}\n", total));
    Ok(out)
}

fn clip(value: &str) -> String {
    if value.chars().count() <= VALUE_WIDTH {
        return value.to_string();
    }
    let head: String = value.chars().take(VALUE_WIDTH - 3).collect();
    format!("{}...", head)
}

/// Code from a model reply, without markdown fences.
fn strip_code_fences(reply: &str) -> String {
    let trimmed = reply.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // drop the language tag line
    let body = body.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    body.trim_end().trim_end_matches("```").trim().to_string()
}

#[derive(Deserialize)]
struct ScriptFailure {
    error: String,
}

/// The `{"error": ...}` line of interpreter stderr, or all of stderr.
fn script_error(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|l| l.trim_start().starts_with('{'))
        .find_map(|l| serde_json::from_str::<ScriptFailure>(l).ok())
        .map(|f| f.error)
        .unwrap_or_else(|| stderr.trim().to_string())
}

/// Raw result of analyzing one data file.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    /// Interpreter stdout, chart markers included.
    pub output: String,
    /// The program that produced `output`, when there is one.
    pub code: Option<String>,
}

/// A finished analysis, ready to be interpreted and streamed.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub source_file: String,
    pub code: Option<String>,
    /// Output with chart markers removed.
    pub output: String,
    /// Base64 chart payloads, in output order.
    pub charts: Vec<String>,
}

impl AnalysisOutcome {
    pub fn new(source_file: impl Into<String>, report: AnalysisReport) -> Self {
        let (output, charts) = extract_charts(&report.output);
        Self {
            source_file: source_file.into(),
            code: report.code,
            output,
            charts,
        }
    }

    /// What the interpreter contributes to the prompt.
    pub fn interpreted_output(&self) -> &str {
        if self.output.is_empty() && !self.charts.is_empty() {
            "The requested charts were generated."
        } else {
            &self.output
        }
    }

    /// Answer text used when interpretation cannot be started.
    pub fn fallback_text(&self) -> &str {
        if self.output.is_empty() {
            NO_RESULT
        } else {
            &self.output
        }
    }
}

#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Whether a data file for `source_file` is available.
    fn can_analyze(&self, source_file: &str) -> bool;

    async fn analyze(&self, question: &str, source_file: &str) -> Result<AnalysisReport, AnalysisError>;
}

/// Generates pandas code with the chat model and runs it with an external
/// interpreter (see [`AnalysisConfig`]).
pub struct ScriptAnalyzer {
    data_dir: PathBuf,
    command: Vec<String>,
    timeout: Duration,
    preview_rows: usize,
    generation: Arc<dyn GenerationBackend>,
    keys: KeyManager,
    model: String,
}

impl ScriptAnalyzer {
    pub fn new(
        config: &AnalysisConfig,
        generation: Arc<dyn GenerationBackend>,
        keys: KeyManager,
        model: impl Into<String>,
    ) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            preview_rows: config.preview_rows,
            generation,
            keys,
            model: config.model.clone().unwrap_or_else(|| model.into()),
        }
    }

    /// `<data_dir>/<name>`, or the newest upload stored as
    /// `<stem>-<timestamp>.<ext>`. Names with directory parts never resolve.
    pub fn resolve(&self, source_file: &str) -> Option<PathBuf> {
        let name = Path::new(source_file);
        let mut components = name.components();
        if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
            return None;
        }

        let direct = self.data_dir.join(name);
        if direct.is_file() {
            return Some(direct);
        }

        let stem = name.file_stem()?.to_str()?;
        let suffix = format!(".{}", name.extension()?.to_str()?.to_lowercase());
        let prefix = format!("{}-", stem);
        let mut stored: Vec<PathBuf> = std::fs::read_dir(&self.data_dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.to_lowercase().ends_with(&suffix))
            })
            .collect();
        stored.sort();
        stored.pop()
    }

    async fn generate_code(&self, question: &str, preview: &str) -> Result<String, AnalysisError> {
        let prompt = analysis_code_prompt(question, preview);
        let reply = self
            .keys
            .execute_with_retry(|cred| {
                let prompt = &prompt;
                async move { self.generation.generate(&cred.key, &self.model, prompt).await }
            })
            .await?;
        let code = strip_code_fences(&reply);
        if code.is_empty() {
            return Err(FailoverError::Provider(ProviderError::EmptyResponse).into());
        }
        Ok(code)
    }

    /// Run `<command...> <path> <code>` and return its trimmed stdout.
    pub async fn execute(&self, path: &Path, code: &str) -> Result<String, AnalysisError> {
        let failed = |message: String| AnalysisError::Execution {
            message,
            code: code.to_string(),
        };
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| failed("no analysis command configured".to_string()))?;

        let mut command = tokio::process::Command::new(program);
        command.args(args).arg(path).arg(code).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| AnalysisError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| failed(format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(script_error(&stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl AnalysisBackend for ScriptAnalyzer {
    fn can_analyze(&self, source_file: &str) -> bool {
        self.resolve(source_file).is_some()
    }

    async fn analyze(&self, question: &str, source_file: &str) -> Result<AnalysisReport, AnalysisError> {
        let path = self
            .resolve(source_file)
            .ok_or_else(|| AnalysisError::NotFound(source_file.to_string()))?;

        let rows = self.preview_rows;
        let preview_path = path.clone();
        let preview = tokio::task::spawn_blocking(move || data_preview(&preview_path, rows))
            .await
            .map_err(|e| AnalysisError::Preview(e.to_string()))??;
        debug!(file = %path.display(), "data preview built");

        let code = self.generate_code(question, &preview).await?;
        if let Err(e) = validate_code(&code) {
            warn!(file = %source_file, error = %e, "rejected generated analysis code");
            return Err(e);
        }

        let output = self.execute(&path, &code).await?;
        info!(file = %source_file, output_len = output.len(), "analysis completed");
        Ok(AnalysisReport {
            output,
            code: Some(code),
        })
    }
}
