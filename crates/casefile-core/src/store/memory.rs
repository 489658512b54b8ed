//! In-memory [`Store`] implementation for tests and embedding in tools.
//!
//! All state sits behind one `std::sync::RwLock`, so every trait method is
//! atomic with respect to the others.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    label_for_index, Chunk, Conversation, Document, DocumentStatus, Message, NewMessage, Role,
    ScopedChunk,
};

use super::Store;

struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
}

#[derive(Default)]
struct State {
    conversations: Vec<Conversation>,
    documents: Vec<Document>,
    chunks: Vec<StoredChunk>,
    messages: Vec<Message>,
    /// Next label ordinal per conversation; never decremented.
    next_ordinal: HashMap<String, i64>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::Store("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::Store("in-memory store lock poisoned".to_string()))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_conversation(&self, title: Option<&str>) -> Result<Conversation> {
        let conv = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title.map(str::to_string),
            created_at: now(),
        };
        self.write()?.conversations.push(conv.clone());
        Ok(conv)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .read()?
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut convs = self.read()?.conversations.clone();
        convs.reverse();
        Ok(convs)
    }

    async fn set_conversation_title(&self, id: &str, title: &str) -> Result<()> {
        let mut state = self.write()?;
        let conv = state
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", id)))?;
        conv.title = Some(title.to_string());
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        let before = state.conversations.len();
        state.conversations.retain(|c| c.id != id);
        if state.conversations.len() == before {
            return Ok(false);
        }
        let doc_ids: Vec<String> = state
            .documents
            .iter()
            .filter(|d| d.conversation_id == id)
            .map(|d| d.id.clone())
            .collect();
        state.chunks.retain(|c| !doc_ids.contains(&c.chunk.document_id));
        state.documents.retain(|d| d.conversation_id != id);
        state.messages.retain(|m| m.conversation_id != id);
        state.next_ordinal.remove(id);
        Ok(true)
    }

    async fn create_document(
        &self,
        conversation_id: &str,
        filename: &str,
        page_count: u32,
    ) -> Result<Document> {
        let mut state = self.write()?;
        if !state.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(Error::NotFound(format!("conversation {}", conversation_id)));
        }
        let counter = state
            .next_ordinal
            .entry(conversation_id.to_string())
            .or_insert(0);
        let ordinal = *counter;
        *counter += 1;
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            filename: filename.to_string(),
            label: label_for_index(ordinal as usize),
            ordinal,
            page_count,
            status: DocumentStatus::Pending,
            uploaded_at: now(),
        };
        state.documents.push(doc.clone());
        Ok(doc)
    }

    async fn commit_chunks(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        if chunks.len() != vectors.len() {
            return Err(Error::EmbeddingBatchFailed(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        let mut state = self.write()?;
        let doc = state
            .documents
            .iter_mut()
            .find(|d| d.id == document_id)
            .ok_or_else(|| Error::NotFound(format!("document {}", document_id)))?;
        if doc.status != DocumentStatus::Pending {
            return Err(Error::InvalidInput(format!(
                "document {} is {}, not pending",
                document_id, doc.status
            )));
        }
        doc.status = DocumentStatus::Ready;
        state
            .chunks
            .extend(chunks.iter().zip(vectors).map(|(c, v)| StoredChunk {
                chunk: c.clone(),
                vector: v.clone(),
            }));
        Ok(())
    }

    async fn mark_failed(&self, document_id: &str) -> Result<()> {
        let mut state = self.write()?;
        if let Some(doc) = state.documents.iter_mut().find(|d| d.id == document_id) {
            doc.status = DocumentStatus::Failed;
        }
        state.chunks.retain(|c| c.chunk.document_id != document_id);
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.documents.iter().find(|d| d.id == id).cloned())
    }

    async fn list_documents(&self, conversation_id: &str) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .read()?
            .documents
            .iter()
            .filter(|d| d.conversation_id == conversation_id)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.ordinal);
        Ok(docs)
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut state = self.write()?;
        let before = state.documents.len();
        state.documents.retain(|d| d.id != id);
        state.chunks.retain(|c| c.chunk.document_id != id);
        Ok(state.documents.len() != before)
    }

    async fn scoped_chunks(
        &self,
        conversation_id: &str,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<ScopedChunk>> {
        let state = self.read()?;
        let mut out = Vec::new();
        let mut docs: Vec<&Document> = state
            .documents
            .iter()
            .filter(|d| d.conversation_id == conversation_id)
            .filter(|d| d.status == DocumentStatus::Ready)
            .filter(|d| document_ids.map_or(true, |ids| ids.contains(&d.id)))
            .collect();
        docs.sort_by_key(|d| d.ordinal);

        for doc in docs {
            let mut chunks: Vec<&StoredChunk> = state
                .chunks
                .iter()
                .filter(|c| c.chunk.document_id == doc.id)
                .collect();
            chunks.sort_by_key(|c| c.chunk.chunk_index);
            out.extend(chunks.into_iter().map(|c| ScopedChunk {
                chunk: c.chunk.clone(),
                embedding: c.vector.clone(),
                document_label: doc.label.clone(),
                filename: doc.filename.clone(),
                document_ordinal: doc.ordinal,
            }));
        }

        Ok(out)
    }

    async fn save_message(&self, message: NewMessage) -> Result<Message> {
        let mut state = self.write()?;
        if !state
            .conversations
            .iter()
            .any(|c| c.id == message.conversation_id)
        {
            return Err(Error::NotFound(format!(
                "conversation {}",
                message.conversation_id
            )));
        }
        let sources_cited = match message.role {
            Role::Assistant => message.citations.len(),
            Role::User => 0,
        };
        let stored = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            sources_cited,
            created_at: now(),
            citations: message.citations,
        };
        state.messages.push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .read()?
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Citation;

    fn chunk(doc_id: &str, index: i64, text: &str) -> Chunk {
        Chunk {
            id: format!("{}-{}", doc_id, index),
            document_id: doc_id.to_string(),
            chunk_index: index,
            text: text.to_string(),
            context: String::new(),
            section: None,
            page_number: 1,
            token_count: 1,
            hash: String::new(),
        }
    }

    #[tokio::test]
    async fn test_labels_assigned_in_upload_order() {
        let store = InMemoryStore::new();
        let conv = store.create_conversation(None).await.unwrap();
        let a = store.create_document(&conv.id, "a.pdf", 1).await.unwrap();
        let b = store.create_document(&conv.id, "b.pdf", 1).await.unwrap();
        assert_eq!(a.label, "Doc A");
        assert_eq!(b.label, "Doc B");

        store.delete_document(&a.id).await.unwrap();
        let c = store.create_document(&conv.id, "c.pdf", 1).await.unwrap();
        assert_eq!(c.label, "Doc C");
    }

    #[tokio::test]
    async fn test_deleting_latest_document_keeps_its_label_retired() {
        let store = InMemoryStore::new();
        let conv = store.create_conversation(None).await.unwrap();
        store.create_document(&conv.id, "a.pdf", 1).await.unwrap();
        let b = store.create_document(&conv.id, "b.pdf", 1).await.unwrap();
        store.delete_document(&b.id).await.unwrap();
        let next = store.create_document(&conv.id, "c.pdf", 1).await.unwrap();
        assert_eq!(next.label, "Doc C");
    }

    #[tokio::test]
    async fn test_labels_are_per_conversation() {
        let store = InMemoryStore::new();
        let c1 = store.create_conversation(None).await.unwrap();
        let c2 = store.create_conversation(None).await.unwrap();
        store.create_document(&c1.id, "a.pdf", 1).await.unwrap();
        let other = store.create_document(&c2.id, "b.pdf", 1).await.unwrap();
        assert_eq!(other.label, "Doc A");
    }

    #[tokio::test]
    async fn test_pending_chunks_invisible_until_commit() {
        let store = InMemoryStore::new();
        let conv = store.create_conversation(None).await.unwrap();
        let doc = store.create_document(&conv.id, "a.pdf", 1).await.unwrap();
        assert!(store.scoped_chunks(&conv.id, None).await.unwrap().is_empty());

        store
            .commit_chunks(&doc.id, &[chunk(&doc.id, 0, "rent")], &[vec![1.0, 0.0]])
            .await
            .unwrap();
        let scoped = store.scoped_chunks(&conv.id, None).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].document_label, "Doc A");
        let doc = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
    }

    #[tokio::test]
    async fn test_commit_rejects_vector_mismatch() {
        let store = InMemoryStore::new();
        let conv = store.create_conversation(None).await.unwrap();
        let doc = store.create_document(&conv.id, "a.pdf", 1).await.unwrap();
        let err = store
            .commit_chunks(&doc.id, &[chunk(&doc.id, 0, "x")], &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "embedding_batch_failed");
        let doc = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn test_scope_filters_documents() {
        let store = InMemoryStore::new();
        let conv = store.create_conversation(None).await.unwrap();
        let a = store.create_document(&conv.id, "a.pdf", 1).await.unwrap();
        let b = store.create_document(&conv.id, "b.pdf", 1).await.unwrap();
        store
            .commit_chunks(&a.id, &[chunk(&a.id, 0, "a")], &[vec![1.0]])
            .await
            .unwrap();
        store
            .commit_chunks(&b.id, &[chunk(&b.id, 0, "b")], &[vec![1.0]])
            .await
            .unwrap();

        let only_b = store
            .scoped_chunks(&conv.id, Some(&[b.id.clone()]))
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].chunk.text, "b");
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let store = InMemoryStore::new();
        let conv = store.create_conversation(Some("Lease review")).await.unwrap();
        let doc = store.create_document(&conv.id, "a.pdf", 1).await.unwrap();
        store
            .commit_chunks(&doc.id, &[chunk(&doc.id, 0, "x")], &[vec![1.0]])
            .await
            .unwrap();
        store
            .save_message(NewMessage {
                conversation_id: conv.id.clone(),
                role: Role::Assistant,
                content: "answer".into(),
                citations: vec![Citation::Web {
                    url: "https://example.com".into(),
                    title: "Example".into(),
                    summary: "s".into(),
                }],
            })
            .await
            .unwrap();

        assert!(store.delete_conversation(&conv.id).await.unwrap());
        assert!(store.get_document(&doc.id).await.unwrap().is_none());
        assert!(store.list_messages(&conv.id).await.unwrap().is_empty());
        assert!(!store.delete_conversation(&conv.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_assistant_message_counts_sources() {
        let store = InMemoryStore::new();
        let conv = store.create_conversation(None).await.unwrap();
        let msg = store
            .save_message(NewMessage {
                conversation_id: conv.id.clone(),
                role: Role::Assistant,
                content: "a".into(),
                citations: vec![Citation::Document {
                    doc_label: "Doc A".into(),
                    document_id: "d".into(),
                    page: 2,
                    section: None,
                    quote: "q".into(),
                }],
            })
            .await
            .unwrap();
        assert_eq!(msg.sources_cited, 1);
        let listed = store.list_messages(&conv.id).await.unwrap();
        assert_eq!(listed[0].citations.len(), 1);
    }
}
