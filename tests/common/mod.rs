//! Shared fixtures: scripted models, a deterministic embedder, generated
//! PDFs, and temporary SQLite stores.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use casefile::config::Config;
use casefile::llm::{
    ChatModel, ChatRequest, ContentBlock, ModelEvent, ModelStream, ResponsePart, StopReason,
};
use casefile::sqlite_store::SqliteStore;
use casefile::{db, migrate};
use casefile_core::embedding::Embedder;
use casefile_core::error::{Error, Result};

// ============ Chat model ============

/// One scripted model response.
pub enum Turn {
    /// Played back followed by the matching stop event, unless the
    /// script already ends with one.
    Events(Vec<ModelEvent>),
    /// Played back exactly as given.
    Raw(Vec<ModelEvent>),
    /// A response that never produces anything.
    Hang,
}

type Completer = Box<dyn Fn(&ChatRequest) -> Result<String> + Send + Sync>;

/// Plays back scripted streamed responses and answers `complete` calls
/// with a closure.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Turn>>,
    completer: Completer,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub stream_calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            completer: Box::new(|_| Ok("Lease Question".to_string())),
            requests: Mutex::new(Vec::new()),
            stream_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_completer(
        mut self,
        completer: impl Fn(&ChatRequest) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.completer = Box::new(completer);
        self
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream(&self, request: ChatRequest) -> Result<ModelStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let turn = self.turns.lock().unwrap().pop_front();
        match turn {
            Some(Turn::Events(mut events)) => {
                if !matches!(events.last(), Some(ModelEvent::Stop(_))) {
                    let calls_tool = events.iter().any(|e| {
                        matches!(e, ModelEvent::Part(ResponsePart::FunctionCall { .. }))
                    });
                    events.push(ModelEvent::Stop(if calls_tool {
                        StopReason::ToolUse
                    } else {
                        StopReason::EndTurn
                    }));
                }
                Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
            }
            Some(Turn::Raw(events)) => Ok(Box::pin(stream::iter(events.into_iter().map(Ok)))),
            Some(Turn::Hang) => Ok(Box::pin(stream::pending())),
            None => Err(Error::UpstreamModelError("script exhausted".to_string())),
        }
    }

    async fn complete(&self, request: ChatRequest) -> Result<String> {
        (self.completer)(&request)
    }
}

pub fn text(delta: &str) -> ModelEvent {
    ModelEvent::TextDelta(delta.to_string())
}

pub fn search_call(id: &str, query: &str) -> ModelEvent {
    ModelEvent::Part(ResponsePart::FunctionCall {
        id: id.to_string(),
        name: "search_documents".to_string(),
        input: serde_json::json!({ "query": query }),
    })
}

pub fn stop(reason: StopReason) -> ModelEvent {
    ModelEvent::Stop(reason)
}

/// Text of the first text block of a request's last message.
pub fn last_prompt(request: &ChatRequest) -> String {
    request
        .messages
        .last()
        .and_then(|m| {
            m.content.iter().find_map(|b| match b {
                ContentBlock::Text(t) => Some(t.clone()),
                _ => None,
            })
        })
        .unwrap_or_default()
}

/// The `<chunk>` body of an enrichment prompt.
pub fn chunk_of(prompt: &str) -> &str {
    let start = prompt.find("<chunk>").map(|i| i + "<chunk>".len()).unwrap_or(0);
    let end = prompt.rfind("</chunk>").unwrap_or(prompt.len());
    prompt.get(start..end).unwrap_or("").trim()
}

// ============ Embedder ============

/// Bag-of-words hashing embedder; similar texts get similar vectors.
pub struct HashEmbedder {
    pub dims: usize,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            dims: 64,
            calls: AtomicUsize::new(0),
        }
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut h: u64 = 0xcbf29ce484222325;
            for b in word.to_lowercase().bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % self.dims as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-64"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

// ============ PDFs ============

/// A text-layer PDF with one page per entry; lines within a page are
/// separated by `\n`.
pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for page in pages {
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("TL", vec![14.into()]),
            Operation::new("Td", vec![50.into(), 750.into()]),
        ];
        for line in page.lines() {
            operations.push(Operation::new("Tj", vec![Object::string_literal(line)]));
            operations.push(Operation::new("T*", vec![]));
        }
        operations.push(Operation::new("ET", vec![]));
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

pub const LEASE_PAGES: [&str; 3] = [
    "LEASE\nThis lease is made between Landlord Ltd and Tenant Ltd\nfor Unit 4 Riverside Park.",
    "Section 3 - Rent\nThe annual rent is twelve thousand pounds\npayable quarterly in advance.",
    "Section 7 - Repairs\nThe tenant shall keep the premises\nin good and substantial repair.",
];

/// Enrichment replies keyed on what each lease chunk is about.
pub fn lease_enrichment(request: &ChatRequest) -> Result<String> {
    let prompt = last_prompt(request);
    if !prompt.contains("<chunk>") {
        return Ok("Unit 4 Lease Rent".to_string());
    }
    let chunk = chunk_of(&prompt).to_lowercase();
    let reply = if chunk.contains("rent") {
        serde_json::json!({
            "context": "Rent clause of the lease between Landlord Ltd and Tenant Ltd.",
            "section": "Section 3 — Rent",
        })
    } else if chunk.contains("repair") {
        serde_json::json!({
            "context": "Tenant repairing obligations under the lease.",
            "section": "Section 7 - Repairs",
        })
    } else {
        serde_json::json!({
            "context": "Parties and premises of the lease.",
            "section": null,
        })
    };
    Ok(reply.to_string())
}

// ============ Store ============

pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::with_db_path(tmp.path().join("data").join("casefile.sqlite"));
    config.agent.web_search = false;
    config
}

pub async fn sqlite_store(config: &Config) -> Arc<SqliteStore> {
    let pool = db::connect(config).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    Arc::new(SqliteStore::new(pool))
}
