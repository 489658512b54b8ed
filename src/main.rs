//! # Casefile CLI (`casefile`)
//!
//! The `casefile` binary is the primary interface for Casefile. It provides
//! commands for database initialization, conversations, PDF uploads,
//! search, question answering, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! casefile --config ./config/casefile.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `casefile init` | Create the SQLite database and run schema migrations |
//! | `casefile conversation new\|list\|delete` | Manage conversations |
//! | `casefile upload <conversation> <file.pdf>` | Ingest a PDF (`--scanned` forces OCR) |
//! | `casefile documents <conversation>` | List a conversation's documents and labels |
//! | `casefile search <conversation> "<query>"` | Hybrid search over the documents |
//! | `casefile ask <conversation> "<question>"` | Ask a question; streams a cited answer |
//! | `casefile history <conversation>` | Print the conversation's messages |
//! | `casefile serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! casefile init
//! CONV=$(casefile conversation new --title "Unit 4 lease review")
//! casefile upload $CONV ./lease.pdf
//! casefile upload $CONV ./scanned-licence.pdf --scanned
//! casefile ask $CONV "What is the annual rent and when is it reviewed?"
//! casefile search $CONV "break clause" --doc "Doc A"
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use casefile::app::App;
use casefile::{commands, config, migrate, server};

/// Casefile: question answering with citations over legal PDFs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/casefile.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "casefile",
    about = "Casefile — cited question answering over legal documents",
    version,
    long_about = "Casefile ingests PDF leases, contracts, and title documents into \
    per-conversation document sets, enriches and embeds their passages, and answers \
    questions with an agent that searches the documents and cites page and section."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/casefile.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Create, list, or delete conversations.
    Conversation {
        #[command(subcommand)]
        action: ConversationAction,
    },

    /// Upload a PDF into a conversation.
    ///
    /// The document is extracted, chunked, enriched, and embedded before
    /// the command returns. It receives the conversation's next label.
    Upload {
        conversation: String,
        file: PathBuf,

        /// Treat the PDF as scanned and transcribe every page with OCR.
        #[arg(long)]
        scanned: bool,
    },

    /// List a conversation's documents.
    Documents { conversation: String },

    /// Delete a document and its chunks. Its label is not reused.
    RemoveDocument {
        conversation: String,
        /// Label like "Doc A" or document id.
        document: String,
    },

    /// Search a conversation's documents.
    Search {
        conversation: String,
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Restrict to a document (label like "Doc A" or id). Repeatable.
        #[arg(long = "doc")]
        docs: Vec<String>,
    },

    /// Ask a question about a conversation's documents.
    Ask {
        conversation: String,
        question: String,

        /// Restrict retrieval to a document (label or id). Repeatable.
        #[arg(long = "doc")]
        docs: Vec<String>,
    },

    /// Print a conversation's messages.
    History { conversation: String },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ConversationAction {
    /// Create a conversation and print its id.
    New {
        #[arg(long)]
        title: Option<String>,
    },
    List,
    /// Delete a conversation with its documents and messages.
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("casefile=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let app = App::open(&cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Conversation { action } => match action {
            ConversationAction::New { title } => {
                commands::run_conversation_new(&app, title).await?;
            }
            ConversationAction::List => {
                commands::run_conversation_list(&app).await?;
            }
            ConversationAction::Delete { id } => {
                commands::run_conversation_delete(&app, &id).await?;
            }
        },
        Commands::Upload {
            conversation,
            file,
            scanned,
        } => {
            commands::run_upload(&app, &conversation, &file, scanned).await?;
        }
        Commands::Documents { conversation } => {
            commands::run_documents(&app, &conversation).await?;
        }
        Commands::RemoveDocument {
            conversation,
            document,
        } => {
            commands::run_remove_document(&app, &conversation, &document).await?;
        }
        Commands::Search {
            conversation,
            query,
            limit,
            docs,
        } => {
            commands::run_search(&app, &conversation, &query, limit, &docs).await?;
        }
        Commands::Ask {
            conversation,
            question,
            docs,
        } => {
            commands::run_ask(&app, &conversation, &question, &docs).await?;
        }
        Commands::History { conversation } => {
            commands::run_history(&app, &conversation).await?;
        }
        Commands::Serve => {
            server::run_server(app).await?;
        }
    }

    Ok(())
}
