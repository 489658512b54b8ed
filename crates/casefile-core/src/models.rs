//! Core data models used throughout Casefile.
//!
//! These types represent the conversations, documents, chunks, messages,
//! and citations that flow through ingestion, retrieval, and answering.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A chat conversation that owns its uploaded documents and messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub created_at: i64,
}

/// Lifecycle of an uploaded document.
///
/// Only `Ready` documents have visible chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "ready" => Ok(DocumentStatus::Ready),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(Error::Serialization(format!(
                "unknown document status: {}",
                other
            ))),
        }
    }
}

/// An uploaded PDF within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub conversation_id: String,
    pub filename: String,
    /// Human-facing label such as `Doc A`, stable for the conversation's life.
    pub label: String,
    /// Zero-based upload position within the conversation.
    pub ordinal: i64,
    pub page_count: u32,
    pub status: DocumentStatus,
    pub uploaded_at: i64,
}

/// Plain text of a single PDF page. Pages are 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub page_number: u32,
    pub text: String,
}

/// A retrievable unit of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// Enrichment blurb; empty when enrichment degraded.
    pub context: String,
    pub section: Option<String>,
    pub page_number: u32,
    pub token_count: usize,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    /// The text that is embedded and lexically indexed.
    pub fn embeddable_text(&self) -> String {
        embeddable_text(&self.context, &self.text)
    }
}

/// Join an enrichment blurb and chunk text the way they are indexed.
pub fn embeddable_text(context: &str, text: &str) -> String {
    if context.trim().is_empty() {
        text.to_string()
    } else {
        format!("{}\n\n{}", context.trim(), text)
    }
}

/// A ready chunk joined with its vector and owning document's label.
///
/// Returned by [`Store::scoped_chunks`](crate::store::Store::scoped_chunks)
/// in `(document ordinal, chunk_index)` order.
#[derive(Debug, Clone)]
pub struct ScopedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
    pub document_label: String,
    pub filename: String,
    pub document_ordinal: i64,
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(Error::Serialization(format!("unknown role: {}", other))),
        }
    }
}

/// A structured reference extracted from an assistant answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Citation {
    Document {
        doc_label: String,
        document_id: String,
        page: u32,
        section: Option<String>,
        quote: String,
    },
    Web {
        url: String,
        title: String,
        summary: String,
    },
}

impl Citation {
    pub fn kind(&self) -> &'static str {
        match self {
            Citation::Document { .. } => "document",
            Citation::Web { .. } => "web",
        }
    }
}

/// A persisted chat message with its ordered citations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub sources_cited: usize,
    pub created_at: i64,
    pub citations: Vec<Citation>,
}

/// A message about to be written.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub citations: Vec<Citation>,
}

/// What a citation label resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelTarget {
    pub document_id: String,
    pub filename: String,
    pub page_count: u32,
}

/// Label → document mapping for one conversation, e.g. `Doc A → {id, …}`.
pub type LabelMap = BTreeMap<String, LabelTarget>;

/// Build the label map from a conversation's documents.
///
/// Failed documents are left out so citations to them cannot resolve.
pub fn label_map(documents: &[Document]) -> LabelMap {
    documents
        .iter()
        .filter(|d| d.status != DocumentStatus::Failed)
        .map(|d| {
            (
                d.label.clone(),
                LabelTarget {
                    document_id: d.id.clone(),
                    filename: d.filename.clone(),
                    page_count: d.page_count,
                },
            )
        })
        .collect()
}

/// Label for the `index`-th upload in a conversation.
///
/// `0 → "Doc A"`, `25 → "Doc Z"`, `26 → "Doc AA"`, `27 → "Doc AB"`.
pub fn label_for_index(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    format!("Doc {}", String::from_utf8_lossy(&letters))
}
