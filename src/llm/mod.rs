//! Chat model abstraction.
//!
//! The agent loop and the ingestion helpers (enrichment, OCR, titles) talk
//! to models only through [`ChatModel`]. A streamed response is a sequence
//! of [`ModelEvent`]s; every completed non-text content block is decided
//! once into a [`ResponsePart`], so the loop never inspects vendor JSON to
//! tell a locally executed tool call from one the vendor already resolved.

pub mod anthropic;
pub mod sse;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

use casefile_core::error::{Error, Result};

use crate::config::ModelsConfig;

/// Stream of events from one model response.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One block of message content, in request order.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    /// Base64 image for vision transcription.
    Image { media_type: String, data: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
    /// Vendor block replayed verbatim (server tool use and its results).
    Raw(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: vec![ContentBlock::Text(text.into())],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: vec![ContentBlock::Text(text.into())],
        }
    }
}

/// A locally executed function the model may call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Which model a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// The tool-calling answer model.
    Chat,
    /// Cheap model for enrichment, OCR, and titles.
    Aux,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub tier: ModelTier,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    /// Enable vendor-side web search with this many uses.
    pub web_search_max_uses: Option<u32>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Single-turn request to the auxiliary model.
    pub fn aux(system: Option<&str>, message: ChatMessage) -> Self {
        Self {
            tier: ModelTier::Aux,
            system: system.map(str::to_string),
            messages: vec![message],
            tools: Vec::new(),
            web_search_max_uses: None,
            max_tokens: None,
        }
    }
}

/// A web result returned by the vendor's search tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebResult {
    pub url: String,
    pub title: String,
}

/// A completed non-text block of a model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    /// The model wants a local tool run; its result must be sent back.
    FunctionCall { id: String, name: String, input: Value },
    /// The vendor already executed the tool; `blocks` are replayed as-is.
    ResolvedCall {
        name: String,
        query: String,
        results: Vec<WebResult>,
        blocks: Vec<Value>,
    },
}

/// Why the model ended a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The answer is complete (`end_turn` or a stop sequence).
    EndTurn,
    /// Local tool results are expected.
    ToolUse,
    /// The vendor paused a long server-side tool loop; resend to resume.
    PauseTurn,
    /// The output budget ran out mid-answer.
    MaxTokens,
    Other(String),
}

impl StopReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop_sequence" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "pause_turn" => StopReason::PauseTurn,
            "max_tokens" => StopReason::MaxTokens,
            other => StopReason::Other(other.to_string()),
        }
    }
}

/// One item of a streamed response. A well-formed stream ends with
/// exactly one `Stop`.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    Part(ResponsePart),
    Stop(StopReason),
}

/// A chat-capable model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Start a streamed response.
    async fn stream(&self, request: ChatRequest) -> Result<ModelStream>;

    /// Run a request to completion and return its text.
    async fn complete(&self, request: ChatRequest) -> Result<String>;
}

/// Model used when `models.provider = "disabled"`.
pub struct DisabledModel;

#[async_trait]
impl ChatModel for DisabledModel {
    async fn stream(&self, _request: ChatRequest) -> Result<ModelStream> {
        Err(Error::UpstreamModelError(
            "Model provider is disabled".to_string(),
        ))
    }

    async fn complete(&self, _request: ChatRequest) -> Result<String> {
        Err(Error::UpstreamModelError(
            "Model provider is disabled".to_string(),
        ))
    }
}

/// Build the configured model client.
pub fn create_model(config: &ModelsConfig) -> anyhow::Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(anthropic::AnthropicModel::new(config)?)),
        "disabled" => Ok(Arc::new(DisabledModel)),
        other => anyhow::bail!("Unknown models provider: {}", other),
    }
}

/// Remove a surrounding Markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}
