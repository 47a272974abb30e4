//! # grounded-chat
//!
//! Retrieval-augmented question answering over uploaded documents, with
//! answers streamed token by token and cited by source file.
//!
//! ## Architecture
//!
//! ```text
//! question ─▶ rewrite ─▶ embed ─▶ hybrid retrieve ─▶ rerank ─▶ threshold
//!                                     │                            │
//!                              ┌──────┴──────┐                     ▼
//!                              │   SQLite    │          ┌────────────────────┐
//!                              │ chunks+FTS5 │          │ stream generation  │──▶ SSE
//!                              └─────────────┘          │ (key/model failover)│
//!                                                       └─────────┬──────────┘
//!                                                                 ▼
//!                                                          chat sessions
//! ```
//!
//! Questions about CSV or Excel sources skip retrieval: the data file is
//! analyzed by an external interpreter and the result is streamed back the
//! same way, with any charts as extra events.
//!
//! Every optional stage degrades instead of failing: a failed rewrite keeps
//! the question, an empty hybrid search falls back to vector-only, a failed
//! rerank keeps retrieval order.
//!
//! ## Quick Start
//!
//! ```bash
//! export GEMINI_API_KEYS=key-a,key-b
//! gchat init
//! gchat ingest ./handbook.txt
//! gchat ask "What is the leave policy?"
//! gchat serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Provider, failover, embedding and chat error types |
//! | [`models`] | Core data types |
//! | [`keypool`] | Provider credentials with a shared rotating cursor |
//! | [`failover`] | Key rotation and model fallback for provider calls |
//! | [`fallback`] | Baseline fallbacks for optional stages |
//! | [`llm`] | Generation provider abstraction (Gemini) |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`rewrite`] | Follow-up question rewriting |
//! | [`search`] | Score normalization and fused ranking |
//! | [`store`] | Chunk storage and candidate queries |
//! | [`retrieval`] | Hybrid retrieval with vector-only fallback |
//! | [`rerank`] | Cross-encoder reranking (Cohere) |
//! | [`context`] | Similarity threshold and context assembly |
//! | [`prompt`] | Prompt builders |
//! | [`orchestrator`] | Streaming chat pipeline |
//! | [`analysis`] | Data-analysis route for CSV and Excel sources |
//! | [`sessions`] | Chat session log |
//! | [`chunk`] | Text chunking |
//! | [`ingest`] | Document ingestion |
//! | [`suggest`] | Starter-question suggestions |
//! | [`server`] | HTTP API server |
//! | [`commands`] | CLI subcommands |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Tracing subscriber setup |

pub mod analysis;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod failover;
pub mod fallback;
pub mod ingest;
pub mod keypool;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod rerank;
pub mod retrieval;
pub mod rewrite;
pub mod search;
pub mod server;
pub mod sessions;
pub mod store;
pub mod suggest;
