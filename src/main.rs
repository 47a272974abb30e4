//! # grounded-chat CLI (`gchat`)
//!
//! ## Usage
//!
//! ```bash
//! gchat --config ./config/gchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gchat init` | Create the SQLite database and run schema migrations |
//! | `gchat serve` | Start the HTTP API server |
//! | `gchat ingest <file>` | Chunk, embed and store a text document |
//! | `gchat ask "<question>"` | Stream a grounded answer to stdout |
//! | `gchat sessions list\|show\|delete` | Inspect chat history |
//! | `gchat documents list\|delete` | Inspect ingested documents |
//!
//! ## Examples
//!
//! ```bash
//! gchat init
//! gchat ingest ./handbook.txt
//! gchat ask "How many vacation days do new hires get?" --file handbook.txt
//! gchat serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use grounded_chat::{commands, config, logging, migrate, server};

/// Grounded question answering over your own documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gchat.example.toml` for a full example. API keys are
/// read from the environment (or a `.env` file), never from the config.
#[derive(Parser)]
#[command(
    name = "gchat",
    about = "grounded-chat: retrieval-augmented answers with citations, streamed",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gchat.toml")]
    config: PathBuf,

    /// Debug-level logging (ignored when RUST_LOG is set).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file, the chunk and chat tables, and the
    /// keyword index with its sync triggers. Idempotent.
    Init,

    /// Start the HTTP API server on `[server].bind`.
    Serve,

    /// Ingest a UTF-8 text file.
    Ingest {
        /// File to read.
        file: PathBuf,

        /// Source name to store chunks under (default: the file name).
        #[arg(long)]
        name: Option<String>,
    },

    /// Ask a question and stream the answer.
    Ask {
        question: String,

        /// Restrict retrieval to these source files. Repeatable.
        #[arg(long = "file")]
        files: Vec<String>,

        /// Continue an existing chat session.
        #[arg(long)]
        session: Option<i64>,
    },

    /// Manage chat sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Manage ingested documents.
    Documents {
        #[command(subcommand)]
        action: DocumentAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List sessions, newest first.
    List,
    /// Print every message of a session.
    Show { id: i64 },
    /// Delete a session and its messages.
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum DocumentAction {
    /// List source files with their chunk counts.
    List,
    /// Delete every chunk of a source file.
    Delete { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    config::load_dotenv();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging, cli.verbose);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { file, name } => {
            commands::run_ingest(&cfg, &file, name.as_deref()).await?;
        }
        Commands::Ask {
            question,
            files,
            session,
        } => {
            commands::run_ask(&cfg, &question, files, session).await?;
        }
        Commands::Sessions { action } => match action {
            SessionAction::List => commands::list_sessions(&cfg).await?,
            SessionAction::Show { id } => commands::show_session(&cfg, id).await?,
            SessionAction::Delete { id } => commands::delete_session(&cfg, id).await?,
        },
        Commands::Documents { action } => match action {
            DocumentAction::List => commands::list_documents(&cfg).await?,
            DocumentAction::Delete { name } => commands::delete_document(&cfg, &name).await?,
        },
    }

    Ok(())
}
