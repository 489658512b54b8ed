//! Tools the chat model can call during a question.
//!
//! The agent loop exposes every registered [`Tool`] to the model as a
//! function. When the model calls one, the loop looks it up in the
//! [`ToolRegistry`], emits its status line, and feeds the returned
//! [`ToolOutput`] back as the function result.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              ToolRegistry                │
//! │  ┌──────────────────┐ ┌───────────────┐  │
//! │  │ search_documents │ │ (other tools) │  │
//! │  └──────────────────┘ └───────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        Orchestrator::send() → model turns
//! ```
//!
//! Vendor web search is not a local tool: the model provider runs it and
//! the loop only reports it (see [`crate::llm::ResponsePart::ResolvedCall`]).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use casefile_core::embedding::Embedder;
use casefile_core::error::{Error, Result};
use casefile_core::search::{hybrid_search, RetrievalParams, SearchHit, SearchRequest};
use casefile_core::store::Store;

use crate::llm::ToolSpec;

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A function the chat model can call.
///
/// # Lifecycle
///
/// 1. The tool is registered via [`ToolRegistry::register`].
/// 2. [`name`](Tool::name), [`description`](Tool::description), and
///    [`parameters_schema`](Tool::parameters_schema) are sent with every
///    model request.
/// 3. [`execute`](Tool::execute) runs each time the model calls the tool.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use casefile::tools::{Tool, ToolContext, ToolOutput};
/// use casefile_core::error::Result;
/// use serde_json::{json, Value};
///
/// pub struct CountDocumentsTool;
///
/// #[async_trait]
/// impl Tool for CountDocumentsTool {
///     fn name(&self) -> &str { "count_documents" }
///     fn description(&self) -> &str { "Count the documents in scope" }
///
///     fn parameters_schema(&self) -> Value {
///         json!({ "type": "object", "properties": {}, "required": [] })
///     }
///
///     async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
///         let docs = ctx.store.list_documents(&ctx.conversation_id).await?;
///         Ok(ToolOutput::text(format!("{} documents", docs.len())))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name shown to the model. Lowercase with underscores.
    fn name(&self) -> &str;

    /// One-line description the model uses to decide when to call it.
    fn description(&self) -> &str;

    /// JSON Schema for the parameters (`type: "object"`).
    fn parameters_schema(&self) -> Value;

    /// Status line emitted before execution, if any.
    fn status(&self, _params: &Value) -> Option<String> {
        None
    }

    /// Execute the tool with the model-supplied parameters.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// What a tool hands back to the loop.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Function result sent to the model.
    pub content: String,
    /// Status line for the user, emitted after execution.
    pub summary: Option<String>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            summary: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Everything a tool may touch while answering one question.
///
/// Created by the orchestrator per `send`, scoped to one conversation and
/// an optional subset of its documents.
#[derive(Clone)]
pub struct ToolContext {
    pub store: Arc<dyn Store>,
    pub embedder: Arc<dyn Embedder>,
    pub conversation_id: String,
    /// Restrict retrieval to these documents; `None` means all ready ones.
    pub document_ids: Option<Vec<String>>,
    pub params: RetrievalParams,
    /// Maximum characters of each passage shown to the model.
    pub snippet_chars: usize,
}

impl ToolContext {
    /// Hybrid search within this context's scope.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let req = SearchRequest {
            conversation_id: &self.conversation_id,
            document_ids: self.document_ids.as_deref(),
            query,
            params: self.params,
        };
        hybrid_search(self.store.as_ref(), self.embedder.as_ref(), &req).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// ToolRegistry
// ═══════════════════════════════════════════════════════════════════════

/// Tools available to the agent, in registration order.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with the built-in document search tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SearchDocumentsTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Function declarations for a model request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tool Implementations
// ═══════════════════════════════════════════════════════════════════════

/// Searches the conversation's documents. Delegates to [`ToolContext::search`].
pub struct SearchDocumentsTool;

#[async_trait]
impl Tool for SearchDocumentsTool {
    fn name(&self) -> &str {
        "search_documents"
    }

    fn description(&self) -> &str {
        "Search uploaded documents for relevant passages. Call it several times \
         with different queries to gather comprehensive information."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query. Be specific about what you are looking for."
                }
            },
            "required": ["query"]
        })
    }

    fn status(&self, params: &Value) -> Option<String> {
        let query = params["query"].as_str().unwrap_or("");
        Some(format!("Searching: {}", query))
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let query = params["query"]
            .as_str()
            .ok_or_else(|| Error::InvalidInput("query must be a string".to_string()))?;

        let hits = ctx.search(query).await?;
        info!(
            conversation_id = %ctx.conversation_id,
            query,
            result_count = hits.len(),
            "document search"
        );

        Ok(ToolOutput {
            content: format_hits(&hits, ctx.snippet_chars),
            summary: Some(hit_summary(&hits)),
        })
    }
}

/// `Found N results across Doc A, Doc B`, labels sorted and deduplicated.
pub fn hit_summary(hits: &[SearchHit]) -> String {
    let labels: BTreeSet<&str> = hits.iter().map(|h| h.document_label.as_str()).collect();
    let across = if labels.is_empty() {
        "no documents".to_string()
    } else {
        labels.into_iter().collect::<Vec<_>>().join(", ")
    };
    format!("Found {} results across {}", hits.len(), across)
}

/// Render hits as numbered blocks for the model.
pub fn format_hits(hits: &[SearchHit], snippet_chars: usize) -> String {
    if hits.is_empty() {
        return "No relevant passages found.".to_string();
    }

    hits.iter()
        .enumerate()
        .map(|(i, hit)| {
            let mut header = format!(
                "[Result {}] {} ({}), Page {}",
                i + 1,
                hit.document_label,
                hit.filename,
                hit.page_number
            );
            if let Some(section) = &hit.section {
                header.push_str(&format!(", Section: {}", section));
            }
            format!("{}\n{}", header, truncate_chars(&hit.text, snippet_chars))
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
