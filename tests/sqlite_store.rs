//! SQLite store behaviour against a temporary database.

mod common;

use std::collections::HashSet;
use tempfile::TempDir;

use casefile_core::error::Error;
use casefile_core::models::{Chunk, Citation, DocumentStatus, NewMessage, Role};
use casefile_core::store::Store;

use common::{sqlite_store, test_config};

fn chunk(document_id: &str, index: i64, page: u32, text: &str) -> Chunk {
    Chunk {
        id: format!("{}-{}", document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        context: "Lease between Landlord Ltd and Tenant Ltd.".to_string(),
        section: (page == 2).then(|| "Section 3 — Rent".to_string()),
        page_number: page,
        token_count: text.split_whitespace().count(),
        hash: format!("hash-{}", index),
    }
}

#[tokio::test]
async fn test_commit_makes_chunks_visible() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&test_config(&tmp)).await;
    let conv = store.create_conversation(None).await.unwrap();
    let doc = store.create_document(&conv.id, "lease.pdf", 2).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Pending);

    // Pending documents are invisible to retrieval.
    assert!(store.scoped_chunks(&conv.id, None).await.unwrap().is_empty());

    let chunks = vec![
        chunk(&doc.id, 0, 1, "The parties"),
        chunk(&doc.id, 1, 2, "The annual rent"),
    ];
    let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
    store.commit_chunks(&doc.id, &chunks, &vectors).await.unwrap();

    let stored = store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Ready);

    let scoped = store.scoped_chunks(&conv.id, None).await.unwrap();
    assert_eq!(scoped.len(), 2);
    assert_eq!(scoped[1].chunk.section.as_deref(), Some("Section 3 — Rent"));
    assert_eq!(scoped[1].embedding, vec![0.0, 1.0]);
    assert_eq!(scoped[1].document_label, "Doc A");
    assert_eq!(scoped[1].filename, "lease.pdf");
}

#[tokio::test]
async fn test_failed_commit_leaves_nothing() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&test_config(&tmp)).await;
    let conv = store.create_conversation(None).await.unwrap();
    let doc = store.create_document(&conv.id, "lease.pdf", 1).await.unwrap();

    let chunks = vec![chunk(&doc.id, 0, 1, "a"), chunk(&doc.id, 1, 1, "b")];
    let err = store
        .commit_chunks(&doc.id, &chunks, &[vec![1.0]])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmbeddingBatchFailed(_)));

    store.mark_failed(&doc.id).await.unwrap();
    let stored = store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DocumentStatus::Failed);
    assert!(store.scoped_chunks(&conv.id, None).await.unwrap().is_empty());

    // A failed document cannot be committed later.
    assert!(store
        .commit_chunks(&doc.id, &chunks[..1], &[vec![1.0]])
        .await
        .is_err());
    assert!(store.scoped_chunks(&conv.id, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scope_filter_and_order() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&test_config(&tmp)).await;
    let conv = store.create_conversation(None).await.unwrap();
    let a = store.create_document(&conv.id, "lease.pdf", 1).await.unwrap();
    let b = store.create_document(&conv.id, "licence.pdf", 1).await.unwrap();
    store
        .commit_chunks(&b.id, &[chunk(&b.id, 0, 1, "licence")], &[vec![1.0]])
        .await
        .unwrap();
    store
        .commit_chunks(&a.id, &[chunk(&a.id, 0, 1, "lease")], &[vec![1.0]])
        .await
        .unwrap();

    let all = store.scoped_chunks(&conv.id, None).await.unwrap();
    let labels: Vec<&str> = all.iter().map(|c| c.document_label.as_str()).collect();
    assert_eq!(labels, vec!["Doc A", "Doc B"]);

    let only_b = store
        .scoped_chunks(&conv.id, Some(&[b.id.clone()]))
        .await
        .unwrap();
    assert_eq!(only_b.len(), 1);
    assert_eq!(only_b[0].chunk.text, "licence");
}

#[tokio::test]
async fn test_concurrent_uploads_get_distinct_labels() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&test_config(&tmp)).await;
    let conv = store.create_conversation(None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let conv_id = conv.id.clone();
        handles.push(tokio::spawn(async move {
            store
                .create_document(&conv_id, &format!("doc{}.pdf", i), 1)
                .await
                .unwrap()
                .label
        }));
    }
    let mut labels = HashSet::new();
    for handle in handles {
        labels.insert(handle.await.unwrap());
    }
    assert_eq!(labels.len(), 8);
    assert!(labels.contains("Doc A"));
    assert!(labels.contains("Doc H"));
}

#[tokio::test]
async fn test_messages_keep_citations_in_order() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&test_config(&tmp)).await;
    let conv = store.create_conversation(None).await.unwrap();
    let doc = store.create_document(&conv.id, "lease.pdf", 3).await.unwrap();

    store
        .save_message(NewMessage {
            conversation_id: conv.id.clone(),
            role: Role::User,
            content: "What is the rent?".into(),
            citations: Vec::new(),
        })
        .await
        .unwrap();
    let citations = vec![
        Citation::Document {
            doc_label: "Doc A".into(),
            document_id: doc.id.clone(),
            page: 2,
            section: Some("Section 3 — Rent".into()),
            quote: "twelve thousand pounds".into(),
        },
        Citation::Web {
            url: "https://example.com/rent-review".into(),
            title: "Rent review guide".into(),
            summary: "Reviews are usually upward only.".into(),
        },
    ];
    let saved = store
        .save_message(NewMessage {
            conversation_id: conv.id.clone(),
            role: Role::Assistant,
            content: "raw answer".into(),
            citations: citations.clone(),
        })
        .await
        .unwrap();
    assert_eq!(saved.sources_cited, 2);

    let messages = store.list_messages(&conv.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].citations, citations);

    let err = store
        .save_message(NewMessage {
            conversation_id: "missing".into(),
            role: Role::User,
            content: "hello".into(),
            citations: Vec::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_delete_conversation_cascades() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&test_config(&tmp)).await;
    let conv = store.create_conversation(Some("Unit 4")).await.unwrap();
    let doc = store.create_document(&conv.id, "lease.pdf", 1).await.unwrap();
    store
        .commit_chunks(&doc.id, &[chunk(&doc.id, 0, 1, "rent")], &[vec![1.0]])
        .await
        .unwrap();
    store
        .save_message(NewMessage {
            conversation_id: conv.id.clone(),
            role: Role::User,
            content: "q".into(),
            citations: Vec::new(),
        })
        .await
        .unwrap();

    assert!(store.delete_conversation(&conv.id).await.unwrap());
    assert!(!store.delete_conversation(&conv.id).await.unwrap());
    assert!(store.get_document(&doc.id).await.unwrap().is_none());
    assert!(store.list_messages(&conv.id).await.unwrap().is_empty());
    assert!(store.scoped_chunks(&conv.id, None).await.unwrap().is_empty());

    let err = store.create_document(&conv.id, "late.pdf", 1).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_titles_and_listing() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&test_config(&tmp)).await;
    let first = store.create_conversation(None).await.unwrap();
    let second = store.create_conversation(Some("Second")).await.unwrap();

    store
        .set_conversation_title(&first.id, "Break clause review")
        .await
        .unwrap();
    let listed = store.list_conversations().await.unwrap();
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].title.as_deref(), Some("Break clause review"));

    let err = store.set_conversation_title("missing", "x").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_delete_document_removes_chunks_and_retires_label() {
    let tmp = TempDir::new().unwrap();
    let store = sqlite_store(&test_config(&tmp)).await;
    let conv = store.create_conversation(None).await.unwrap();
    let a = store.create_document(&conv.id, "lease.pdf", 1).await.unwrap();
    let b = store.create_document(&conv.id, "licence.pdf", 1).await.unwrap();
    store
        .commit_chunks(&b.id, &[chunk(&b.id, 0, 1, "licence")], &[vec![1.0]])
        .await
        .unwrap();

    assert!(store.delete_document(&b.id).await.unwrap());
    assert!(!store.delete_document(&b.id).await.unwrap());
    assert!(store.scoped_chunks(&conv.id, None).await.unwrap().is_empty());

    let remaining = store.list_documents(&conv.id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, a.id);

    let c = store.create_document(&conv.id, "deed.pdf", 1).await.unwrap();
    assert_eq!(c.label, "Doc C");
}
