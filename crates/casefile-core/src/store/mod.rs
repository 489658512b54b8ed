//! Storage abstraction for Casefile.
//!
//! The [`Store`] trait defines every persistence operation the ingestion
//! pipeline, retriever, and agent loop need, enabling pluggable backends
//! (SQLite in the app crate, in-memory here for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! Two writes carry atomicity requirements:
//!
//! - [`create_document`](Store::create_document) assigns the next label
//!   in the conversation. Two concurrent uploads never receive the same
//!   label.
//! - [`commit_chunks`](Store::commit_chunks) writes all chunks with their
//!   vectors and flips the document to `ready` in one step. Readers never
//!   see a partial chunk set.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Chunk, Conversation, Document, Message, NewMessage, ScopedChunk};

/// Abstract storage backend for Casefile.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_conversation`](Store::create_conversation) | Start a conversation |
/// | [`get_conversation`](Store::get_conversation) | Look up a conversation |
/// | [`list_conversations`](Store::list_conversations) | All conversations, newest first |
/// | [`set_conversation_title`](Store::set_conversation_title) | Rename a conversation |
/// | [`delete_conversation`](Store::delete_conversation) | Delete with cascade |
/// | [`create_document`](Store::create_document) | Register a pending upload and assign its label |
/// | [`commit_chunks`](Store::commit_chunks) | Persist chunks + vectors and mark ready |
/// | [`mark_failed`](Store::mark_failed) | Mark an upload failed |
/// | [`get_document`](Store::get_document) | Look up a document |
/// | [`list_documents`](Store::list_documents) | Documents in upload order |
/// | [`delete_document`](Store::delete_document) | Delete a document and its chunks |
/// | [`scoped_chunks`](Store::scoped_chunks) | Ready chunks for retrieval |
/// | [`save_message`](Store::save_message) | Persist a message and its citations |
/// | [`list_messages`](Store::list_messages) | Conversation history, oldest first |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_conversation(&self, title: Option<&str>) -> Result<Conversation>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    async fn set_conversation_title(&self, id: &str, title: &str) -> Result<()>;

    /// Delete a conversation and everything it owns. Returns `false` if
    /// it did not exist.
    async fn delete_conversation(&self, id: &str) -> Result<bool>;

    /// Insert a `pending` document and assign it the next label.
    async fn create_document(
        &self,
        conversation_id: &str,
        filename: &str,
        page_count: u32,
    ) -> Result<Document>;

    /// Atomically store `chunks` with `vectors[i]` for `chunks[i]` and mark
    /// the document `ready`. On error nothing is visible.
    async fn commit_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<()>;

    async fn mark_failed(&self, document_id: &str) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Documents of a conversation ordered by upload order.
    async fn list_documents(&self, conversation_id: &str) -> Result<Vec<Document>>;

    async fn delete_document(&self, id: &str) -> Result<bool>;

    /// Chunks of `ready` documents in the conversation, optionally limited
    /// to `document_ids`, ordered by `(document ordinal, chunk_index)`.
    async fn scoped_chunks(
        &self,
        conversation_id: &str,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<ScopedChunk>>;

    /// Persist a message and its citations together.
    async fn save_message(&self, message: NewMessage) -> Result<Message>;

    /// Messages of a conversation, oldest first, with citations.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;
}
