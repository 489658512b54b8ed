//! CLI command implementations.
//!
//! Each `run_*` function backs one `casefile` subcommand and prints its
//! result to stdout. Progress lines go to stderr.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use casefile_core::citation::{render_citation, render_unchecked};
use casefile_core::models::{Citation, Role};
use casefile_core::search::{hybrid_search, SearchRequest};

use crate::agent::AgentEvent;
use crate::app::App;

fn format_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

async fn require_conversation(app: &App, conversation_id: &str) -> Result<()> {
    if app.store.get_conversation(conversation_id).await?.is_none() {
        bail!("Conversation not found: {}", conversation_id);
    }
    Ok(())
}

/// Map `--doc` values (ids or labels such as `"Doc A"`) to document ids.
async fn resolve_documents(
    app: &App,
    conversation_id: &str,
    docs: &[String],
) -> Result<Option<Vec<String>>> {
    if docs.is_empty() {
        return Ok(None);
    }
    let documents = app.store.list_documents(conversation_id).await?;
    let mut ids = Vec::with_capacity(docs.len());
    for wanted in docs {
        let found = documents
            .iter()
            .find(|d| d.id == *wanted || d.label.eq_ignore_ascii_case(wanted))
            .with_context(|| format!("No document '{}' in this conversation", wanted))?;
        ids.push(found.id.clone());
    }
    Ok(Some(ids))
}

// ============ conversation ============

pub async fn run_conversation_new(app: &App, title: Option<String>) -> Result<()> {
    let conversation = app.store.create_conversation(title.as_deref()).await?;
    println!("{}", conversation.id);
    Ok(())
}

pub async fn run_conversation_list(app: &App) -> Result<()> {
    let conversations = app.store.list_conversations().await?;
    if conversations.is_empty() {
        println!("No conversations.");
        return Ok(());
    }
    for c in conversations {
        println!(
            "{}  {}  {}",
            c.id,
            format_date(c.created_at),
            c.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(())
}

pub async fn run_conversation_delete(app: &App, conversation_id: &str) -> Result<()> {
    if !app.store.delete_conversation(conversation_id).await? {
        bail!("Conversation not found: {}", conversation_id);
    }
    println!("Deleted conversation {}", conversation_id);
    Ok(())
}

// ============ upload / documents ============

pub async fn run_upload(app: &App, conversation_id: &str, file: &Path, scanned: bool) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.pdf".to_string());

    eprintln!("Ingesting {} ...", filename);
    let document = app
        .ingestor
        .ingest_upload(conversation_id, &filename, &bytes, scanned)
        .await?;

    println!(
        "{}  {}  {} pages  {}",
        document.label, document.filename, document.page_count, document.status
    );
    println!("    id: {}", document.id);
    Ok(())
}

pub async fn run_documents(app: &App, conversation_id: &str) -> Result<()> {
    require_conversation(app, conversation_id).await?;
    let documents = app.store.list_documents(conversation_id).await?;
    if documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for d in documents {
        println!(
            "{}  {}  {} pages  {}  {}",
            d.label,
            d.filename,
            d.page_count,
            d.status,
            format_date(d.uploaded_at)
        );
        println!("    id: {}", d.id);
    }
    Ok(())
}

pub async fn run_remove_document(app: &App, conversation_id: &str, document: &str) -> Result<()> {
    require_conversation(app, conversation_id).await?;
    let ids = resolve_documents(app, conversation_id, &[document.to_string()])
        .await?
        .unwrap_or_default();
    for id in ids {
        if app.store.delete_document(&id).await? {
            println!("Deleted document {}", id);
        }
    }
    Ok(())
}

// ============ search ============

pub async fn run_search(
    app: &App,
    conversation_id: &str,
    query: &str,
    limit: Option<usize>,
    docs: &[String],
) -> Result<()> {
    require_conversation(app, conversation_id).await?;
    let document_ids = resolve_documents(app, conversation_id, docs).await?;

    let mut params = app.config.retrieval_params();
    if let Some(limit) = limit {
        params.final_limit = limit.max(1);
    }
    let req = SearchRequest {
        conversation_id,
        document_ids: document_ids.as_deref(),
        query,
        params,
    };
    let hits = hybrid_search(app.store.as_ref(), app.embedder.as_ref(), &req).await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} ({}) p.{}",
            i + 1,
            hit.score,
            hit.document_label,
            hit.filename,
            hit.page_number
        );
        if let Some(section) = &hit.section {
            println!("    section: {}", section);
        }
        let ranks = |r: Option<usize>| r.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "    ranks: vector {} / lexical {}",
            ranks(hit.vector_rank),
            ranks(hit.lexical_rank)
        );
        let excerpt: String = hit.text.chars().take(240).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!();
    }
    Ok(())
}

// ============ ask / history ============

pub async fn run_ask(app: &App, conversation_id: &str, question: &str, docs: &[String]) -> Result<()> {
    let document_ids = resolve_documents(app, conversation_id, docs).await?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut rx = app
        .orchestrator
        .send(conversation_id, document_ids, question, cancel.clone())
        .await?;

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Status { text } => eprintln!("· {}", text),
            AgentEvent::Delta { text } => {
                print!("{}", text);
                stdout.flush()?;
            }
            AgentEvent::Done {
                citations,
                sources_cited,
                ..
            } => {
                println!();
                print_citations(&citations, sources_cited);
                return Ok(());
            }
            AgentEvent::Error { kind, message } => bail!("{} ({})", message, kind),
        }
    }

    if cancel.is_cancelled() {
        bail!("Cancelled");
    }
    bail!("Answer stream ended unexpectedly")
}

fn print_citations(citations: &[Citation], sources_cited: usize) {
    if citations.is_empty() {
        return;
    }
    println!();
    println!("--- Sources ({}) ---", sources_cited);
    for (i, citation) in citations.iter().enumerate() {
        println!("{}. {}", i + 1, render_citation(citation));
    }
}

pub async fn run_history(app: &App, conversation_id: &str) -> Result<()> {
    require_conversation(app, conversation_id).await?;
    let messages = app.store.list_messages(conversation_id).await?;
    if messages.is_empty() {
        println!("No messages.");
        return Ok(());
    }

    for m in messages {
        println!("[{}] {}", m.role.as_str(), format_date(m.created_at));
        match m.role {
            Role::User => println!("{}", m.content),
            Role::Assistant => {
                println!("{}", render_unchecked(&m.content));
                print_citations(&m.citations, m.sources_cited);
            }
        }
        println!();
    }
    Ok(())
}
