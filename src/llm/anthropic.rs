//! Anthropic Messages API client.
//!
//! Streams `POST {base_url}/v1/messages` and turns the event stream into
//! [`ModelEvent`]s. Text arrives as deltas. Tool-use input arrives as
//! partial JSON and is emitted once the block stops. A vendor web search
//! (`server_tool_use` followed by `web_search_tool_result`) becomes a single
//! [`ResponsePart::ResolvedCall`] carrying both raw blocks for replay.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use casefile_core::error::{Error, Result};

use super::sse::{SseDecoder, SseEvent};
use super::{
    ChatMessage, ChatModel, ChatRequest, ContentBlock, ModelEvent, ModelStream, ModelTier,
    ResponsePart, StopReason, WebResult,
};
use crate::config::ModelsConfig;

const API_VERSION: &str = "2023-06-01";
const WEB_SEARCH_TOOL: &str = "web_search_20250305";

pub struct AnthropicModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    aux_model: String,
    max_tokens: u32,
    max_retries: u32,
}

impl AnthropicModel {
    /// Reads the key from `ANTHROPIC_API_KEY`.
    pub fn new(config: &ModelsConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &ModelsConfig, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            chat_model: config.chat_model.clone(),
            aux_model: config.aux_model.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Chat => &self.chat_model,
            ModelTier::Aux => &self.aux_model,
        }
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model_for(request.tier),
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "messages": request.messages.iter().map(message_json).collect::<Vec<_>>(),
            "stream": stream,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }

        let mut tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        if let Some(max_uses) = request.web_search_max_uses {
            tools.push(json!({
                "type": WEB_SEARCH_TOOL,
                "name": "web_search",
                "max_uses": max_uses,
            }));
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        body
    }

    /// Send with retry on 429, 5xx, 529, and connection errors.
    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let result = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .header("content-type", "application/json")
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let text = response.text().await.unwrap_or_default();
                    let err = format!("Anthropic API error {}: {}", status, text);
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(attempt, status = status.as_u16(), "model request retry");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(Error::UpstreamModelError(err));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "model connection error");
                    last_err = Some(format!("Anthropic connection error: {}", e));
                }
            }
        }

        Err(Error::UpstreamModelError(last_err.unwrap_or_else(|| {
            "Anthropic request failed after retries".to_string()
        })))
    }
}

#[async_trait]
impl ChatModel for AnthropicModel {
    async fn stream(&self, request: ChatRequest) -> Result<ModelStream> {
        let body = self.build_body(&request, true);
        let response = self.send(&body).await?;

        let events = response
            .bytes_stream()
            .scan(
                (SseDecoder::new(), AnthropicStreamParser::default()),
                |(decoder, parser), chunk| {
                    let out: Vec<Result<ModelEvent>> = match chunk {
                        Ok(bytes) => decoder
                            .push(&bytes)
                            .iter()
                            .flat_map(|event| parser.handle(event))
                            .collect(),
                        Err(e) => vec![Err(Error::UpstreamModelError(format!(
                            "stream interrupted: {}",
                            e
                        )))],
                    };
                    futures::future::ready(Some(out))
                },
            )
            .flat_map(stream::iter);

        Ok(Box::pin(events))
    }

    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let body = self.build_body(&request, false);
        let response = self.send(&body).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| Error::UpstreamModelError(format!("invalid response: {}", e)))?;
        Ok(response_text(&json))
    }
}

fn message_json(message: &ChatMessage) -> Value {
    let content: Vec<Value> = message.content.iter().map(block_json).collect();
    json!({ "role": message.role, "content": content })
}

fn block_json(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text(text) => json!({ "type": "text", "text": text }),
        ContentBlock::Image { media_type, data } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use", "id": id, "name": name, "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
        ContentBlock::Raw(value) => value.clone(),
    }
}

/// Concatenate the text blocks of a non-streamed response.
fn response_text(json: &Value) -> String {
    json.get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

// ═══════════════════════════════════════════════════════════════════════
// Stream parser
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug)]
enum Block {
    Text,
    ToolUse {
        id: String,
        name: String,
        initial: Value,
        json: String,
    },
    ServerToolUse {
        start: Value,
        json: String,
    },
    SearchResult {
        start: Value,
    },
    Other,
}

/// Converts Messages API stream events into [`ModelEvent`]s.
#[derive(Debug, Default)]
pub struct AnthropicStreamParser {
    blocks: HashMap<u64, Block>,
    /// Completed server tool uses waiting for their result block.
    server_uses: Vec<Value>,
    stop_reason: Option<StopReason>,
}

impl AnthropicStreamParser {
    pub fn handle(&mut self, event: &SseEvent) -> Vec<Result<ModelEvent>> {
        if event.data.is_empty() {
            return Vec::new();
        }
        let data: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                return vec![Err(Error::UpstreamModelError(format!(
                    "malformed stream event: {}",
                    e
                )))]
            }
        };
        let kind = event
            .event
            .as_deref()
            .or_else(|| data.get("type").and_then(Value::as_str))
            .unwrap_or_default();
        let index = data.get("index").and_then(Value::as_u64).unwrap_or(0);

        match kind {
            "content_block_start" => {
                let block = data.get("content_block").cloned().unwrap_or(Value::Null);
                self.start_block(index, block);
                Vec::new()
            }
            "content_block_delta" => self.delta(index, data.get("delta").unwrap_or(&Value::Null)),
            "content_block_stop" => self.stop_block(index),
            "error" => {
                let message = data
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error");
                vec![Err(Error::UpstreamModelError(message.to_string()))]
            }
            "message_delta" => {
                if let Some(reason) = data.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
                Vec::new()
            }
            "message_stop" => {
                let reason = self.stop_reason.take().unwrap_or(StopReason::EndTurn);
                vec![Ok(ModelEvent::Stop(reason))]
            }
            "message_start" | "ping" => Vec::new(),
            other => {
                debug!(event = other, "ignoring stream event");
                Vec::new()
            }
        }
    }

    fn start_block(&mut self, index: u64, block: Value) {
        let kind = block.get("type").and_then(Value::as_str).unwrap_or_default();
        let state = match kind {
            "text" => Block::Text,
            "tool_use" => Block::ToolUse {
                id: str_field(&block, "id"),
                name: str_field(&block, "name"),
                initial: block.get("input").cloned().unwrap_or_else(|| json!({})),
                json: String::new(),
            },
            "server_tool_use" => Block::ServerToolUse {
                start: block,
                json: String::new(),
            },
            "web_search_tool_result" => Block::SearchResult { start: block },
            _ => Block::Other,
        };
        self.blocks.insert(index, state);
    }

    fn delta(&mut self, index: u64, delta: &Value) -> Vec<Result<ModelEvent>> {
        match delta.get("type").and_then(Value::as_str) {
            Some("text_delta") => {
                let text = str_field(delta, "text");
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![Ok(ModelEvent::TextDelta(text))]
                }
            }
            Some("input_json_delta") => {
                let partial = delta
                    .get("partial_json")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match self.blocks.get_mut(&index) {
                    Some(Block::ToolUse { json, .. }) | Some(Block::ServerToolUse { json, .. }) => {
                        json.push_str(partial);
                    }
                    _ => {}
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn stop_block(&mut self, index: u64) -> Vec<Result<ModelEvent>> {
        match self.blocks.remove(&index) {
            Some(Block::ToolUse {
                id,
                name,
                initial,
                json,
            }) => match parse_input(&json, initial) {
                Ok(input) => vec![Ok(ModelEvent::Part(ResponsePart::FunctionCall {
                    id,
                    name,
                    input,
                }))],
                Err(e) => vec![Err(e)],
            },
            Some(Block::ServerToolUse { mut start, json }) => {
                let initial = start.get("input").cloned().unwrap_or_else(|| json!({}));
                match parse_input(&json, initial) {
                    Ok(input) => {
                        start["input"] = input;
                        self.server_uses.push(start);
                        Vec::new()
                    }
                    Err(e) => vec![Err(e)],
                }
            }
            Some(Block::SearchResult { start }) => {
                let tool_use_id = str_field(&start, "tool_use_id");
                let pos = self
                    .server_uses
                    .iter()
                    .position(|u| u.get("id").and_then(Value::as_str) == Some(tool_use_id.as_str()));
                let Some(pos) = pos else {
                    warn!(tool_use_id = %tool_use_id, "search result without matching server tool use");
                    return Vec::new();
                };
                let use_block = self.server_uses.remove(pos);
                let part = ResponsePart::ResolvedCall {
                    name: str_field(&use_block, "name"),
                    query: use_block
                        .pointer("/input/query")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    results: web_results(&start),
                    blocks: vec![use_block, start],
                };
                vec![Ok(ModelEvent::Part(part))]
            }
            _ => Vec::new(),
        }
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_input(json: &str, initial: Value) -> Result<Value> {
    if json.trim().is_empty() {
        return Ok(initial);
    }
    serde_json::from_str(json)
        .map_err(|e| Error::UpstreamModelError(format!("invalid tool input JSON: {}", e)))
}

fn web_results(block: &Value) -> Vec<WebResult> {
    block
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|i| i.get("type").and_then(Value::as_str) == Some("web_search_result"))
                .map(|i| WebResult {
                    url: str_field(i, "url"),
                    title: str_field(i, "title"),
                })
                .collect()
        })
        .unwrap_or_default()
}
