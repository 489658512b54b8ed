//! Question answering over a conversation's documents.
//!
//! [`Orchestrator::send`] persists the user's message, then drives the
//! chat model through a bounded tool-calling loop on a background task
//! and reports progress as [`AgentEvent`]s on an ordered channel:
//!
//! ```text
//! AwaitingModel ──FunctionCall──▶ ExecutingTool ──result──▶ AwaitingModel
//!       │  ▲                                                    (≤ max_turns)
//!       │  └──pause_turn (blocks handed back)
//!       └──end_turn──▶ StreamingText ──▶ Done (message persisted)
//!
//! max_tokens / no stop event / upstream error / deadline ──▶ one `error` event
//! cancel token / receiver dropped ──▶ stop, nothing persisted
//! ```
//!
//! Text produced in a response that also calls tools stays in the model
//! context and is never shown. A final response is streamed to the
//! consumer once the response is known to be final, with citation tags
//! rendered as they complete.

use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use casefile_core::citation::{extract, render_partial, render_unchecked};
use casefile_core::embedding::Embedder;
use casefile_core::error::{Error, Result};
use casefile_core::models::{
    label_map, Citation, DocumentStatus, LabelMap, Message, NewMessage, Role,
};
use casefile_core::search::RetrievalParams;
use casefile_core::store::Store;

use crate::config::Config;
use crate::llm::{
    ChatMessage, ChatModel, ChatRequest, ChatRole, ContentBlock, ModelEvent, ModelTier,
    ResponsePart, StopReason,
};
use crate::tools::{ToolContext, ToolRegistry};

const EVENT_BUFFER: usize = 64;
const TITLE_MAX_CHARS: usize = 100;

const SYSTEM_PROMPT: &str = "\
You are a legal document assistant for commercial real estate lawyers. You help lawyers \
review and understand documents during due diligence.

## How to work
1. When the user asks about the documents, ALWAYS call the search_documents tool first.
2. You may search several times with different queries to find all relevant information.
3. For cross-document questions, search for the topic in each document's terms.
4. Base your answers strictly on the search results. Do not fabricate information.

## Citation format
Every factual claim taken from a document MUST carry a citation in exactly this form:
<cite doc=\"DOC_LABEL\" page=\"PAGE_NUMBER\" section=\"SECTION_OR_CLAUSE\">exact or close quote</cite>

For example:
<cite doc=\"Doc A\" page=\"3\" section=\"Section 1 — Definitions\">The Term means a period of fifteen years</cite>

Rules:
- Always include the document label and page number exactly as shown in the search results.
- Include the section attribute when the search result names one; omit it otherwise.
- Use one citation per source passage.

## Style
- Be concise and precise. Lawyers value accuracy over verbosity.
- Structure longer answers with headings and bullet points.
- If the information is not in any document, say so clearly.
";

const WEB_PROMPT: &str = "
## Web search
You may search the web for law or market context the documents do not contain. \
Cite web sources as:
<webcite url=\"URL\" title=\"PAGE_TITLE\">one-sentence summary</webcite>
Never present web content as if it came from the documents.
";

// ═══════════════════════════════════════════════════════════════════════
// Events and settings
// ═══════════════════════════════════════════════════════════════════════

/// Progress of one question, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Status {
        text: String,
    },
    Delta {
        text: String,
    },
    Done {
        message_id: String,
        /// Final answer with every citation rendered.
        content: String,
        citations: Vec<Citation>,
        label_map: LabelMap,
        sources_cited: usize,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl AgentEvent {
    fn status(text: impl Into<String>) -> Self {
        AgentEvent::Status { text: text.into() }
    }

    fn error(e: &Error) -> Self {
        AgentEvent::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}


#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Maximum model calls per question.
    pub max_turns: usize,
    pub deadline: Duration,
    /// Vendor web search budget; `None` disables it.
    pub web_search: Option<u32>,
    pub history_messages: usize,
    pub retrieval: RetrievalParams,
    pub snippet_chars: usize,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_turns: config.agent.max_turns,
            deadline: Duration::from_secs(config.agent.deadline_secs),
            web_search: config
                .agent
                .web_search
                .then_some(config.agent.max_web_searches),
            history_messages: config.agent.history_messages,
            retrieval: config.retrieval_params(),
            snippet_chars: config.retrieval.snippet_chars,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════

/// Runs questions against conversations. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    settings: AgentSettings,
    active: Arc<Mutex<HashSet<String>>>,
}

/// Releases a conversation's busy flag when the loop ends.
struct BusyGuard {
    active: Arc<Mutex<HashSet<String>>>,
    conversation_id: String,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.conversation_id);
        }
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
        tools: ToolRegistry,
        settings: AgentSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            model,
            tools: Arc::new(tools),
            settings,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn acquire(&self, conversation_id: &str) -> Result<BusyGuard> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| Error::Internal("busy set poisoned".to_string()))?;
        if !active.insert(conversation_id.to_string()) {
            return Err(Error::ConversationBusy(conversation_id.to_string()));
        }
        Ok(BusyGuard {
            active: self.active.clone(),
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Ask a question. `document_ids` limits retrieval to a subset of the
    /// conversation's documents.
    ///
    /// Fails immediately with `NotFound`, `InvalidInput`, or
    /// `ConversationBusy`; every later failure arrives as a single
    /// [`AgentEvent::Error`]. The user message is persisted before this
    /// returns.
    pub async fn send(
        &self,
        conversation_id: &str,
        document_ids: Option<Vec<String>>,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("message must not be empty".to_string()));
        }
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;

        let guard = self.acquire(conversation_id)?;

        let documents = self.store.list_documents(conversation_id).await?;
        let history = self.store.list_messages(conversation_id).await?;

        self.store
            .save_message(NewMessage {
                conversation_id: conversation_id.to_string(),
                role: Role::User,
                content: text.to_string(),
                citations: Vec::new(),
            })
            .await?;

        if history.is_empty() && conversation.title.is_none() {
            self.spawn_title(conversation_id, text);
        }

        let has_documents = documents.iter().any(|d| {
            d.status == DocumentStatus::Ready
                && document_ids
                    .as_ref()
                    .map_or(true, |ids| ids.iter().any(|id| id == &d.id))
        });

        let mut messages = replay_history(&history, self.settings.history_messages);
        push_message(&mut messages, ChatMessage::user_text(text));

        let run = AgentRun {
            model: self.model.clone(),
            store: self.store.clone(),
            tools: self.tools.clone(),
            ctx: ToolContext {
                store: self.store.clone(),
                embedder: self.embedder.clone(),
                conversation_id: conversation_id.to_string(),
                document_ids,
                params: self.settings.retrieval,
                snippet_chars: self.settings.snippet_chars,
            },
            labels: label_map(&documents),
            messages,
            max_turns: self.settings.max_turns,
            web_search: self.settings.web_search,
            has_documents,
            carried: Vec::new(),
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let deadline = self.settings.deadline;
        let conversation_id = conversation_id.to_string();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = tx.closed() => Err(Error::Cancelled),
                result = tokio::time::timeout(deadline, run.run(&tx)) => {
                    result.unwrap_or(Err(Error::Timeout(deadline.as_secs())))
                }
            };

            match outcome {
                Ok(()) => debug!(conversation_id = %conversation_id, "agent finished"),
                Err(Error::Cancelled) => {
                    info!(conversation_id = %conversation_id, "agent cancelled; nothing persisted")
                }
                Err(e) => {
                    warn!(conversation_id = %conversation_id, error = %e, "agent failed");
                    let _ = tx.send(AgentEvent::error(&e)).await;
                }
            }
            // Free the conversation before the consumer sees the channel close.
            drop(guard);
            drop(tx);
        });

        Ok(rx)
    }

    fn spawn_title(&self, conversation_id: &str, text: &str) {
        let model = self.model.clone();
        let store = self.store.clone();
        let conversation_id = conversation_id.to_string();
        let text = text.to_string();

        tokio::spawn(async move {
            match generate_title(model.as_ref(), &text).await {
                Ok(title) if !title.is_empty() => {
                    if let Err(e) = store.set_conversation_title(&conversation_id, &title).await {
                        warn!(conversation_id = %conversation_id, error = %e, "failed to store title");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(conversation_id = %conversation_id, error = %e, "title generation failed"),
            }
        });
    }
}

/// Ask the auxiliary model for a 3-5 word title.
pub async fn generate_title(model: &dyn ChatModel, first_message: &str) -> Result<String> {
    let prompt = format!(
        "Generate a concise 3-5 word title for a conversation that starts with: '{}'. \
         Return only the title, nothing else.",
        first_message
    );
    let request = ChatRequest::aux(
        Some("Generate concise conversation titles."),
        ChatMessage::user_text(prompt),
    );
    let raw = model.complete(request).await?;
    Ok(clean_title(&raw))
}

fn clean_title(raw: &str) -> String {
    let title = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if title.chars().count() > TITLE_MAX_CHARS {
        let cut: String = title.chars().take(TITLE_MAX_CHARS - 3).collect();
        format!("{}...", cut)
    } else {
        title.to_string()
    }
}

/// Prior turns as model context, citation tags rendered to brackets.
fn replay_history(history: &[Message], limit: usize) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(limit);
    let mut messages = Vec::new();
    for message in &history[start..] {
        let chat = match message.role {
            Role::User => ChatMessage::user_text(&message.content),
            Role::Assistant => ChatMessage::assistant_text(render_unchecked(&message.content)),
        };
        push_message(&mut messages, chat);
    }
    messages
}

/// Append, merging consecutive same-role messages and keeping a user turn first.
fn push_message(messages: &mut Vec<ChatMessage>, message: ChatMessage) {
    if messages.is_empty() && message.role == ChatRole::Assistant {
        return;
    }
    match messages.last_mut() {
        Some(last) if last.role == message.role => last.content.extend(message.content),
        _ => messages.push(message),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Loop
// ═══════════════════════════════════════════════════════════════════════

struct AgentRun {
    model: Arc<dyn ChatModel>,
    store: Arc<dyn Store>,
    tools: Arc<ToolRegistry>,
    ctx: ToolContext,
    labels: LabelMap,
    messages: Vec<ChatMessage>,
    max_turns: usize,
    web_search: Option<u32>,
    has_documents: bool,
    /// Text of paused responses, shown once the answer completes.
    carried: Vec<String>,
}

/// Position of the loop. Each state owns the response it acts on.
enum AgentState {
    AwaitingModel,
    ExecutingTool(Response),
    StreamingText(Response),
    Done,
}

/// One model response, collected.
#[derive(Default)]
struct Response {
    /// Content blocks in arrival order, for replay.
    blocks: Vec<ContentBlock>,
    /// Text deltas in arrival order.
    deltas: Vec<String>,
    calls: Vec<(String, String, serde_json::Value)>,
    /// `None` when the stream ended without a stop event.
    stop: Option<StopReason>,
}

impl Response {
    fn push_text(&mut self, delta: String) {
        match self.blocks.last_mut() {
            Some(ContentBlock::Text(text)) => text.push_str(&delta),
            _ => self.blocks.push(ContentBlock::Text(delta.clone())),
        }
        self.deltas.push(delta);
    }

    fn text(&self) -> String {
        self.deltas.concat()
    }
}

async fn emit(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) -> Result<()> {
    tx.send(event).await.map_err(|_| Error::Cancelled)
}

impl AgentRun {
    async fn run(mut self, tx: &mpsc::Sender<AgentEvent>) -> Result<()> {
        let conversation_id = self.ctx.conversation_id.clone();
        if self.has_documents {
            emit(tx, AgentEvent::status("Searching documents...")).await?;
        }

        let mut turn = 0;
        let mut state = AgentState::AwaitingModel;
        loop {
            state = match state {
                AgentState::AwaitingModel => {
                    turn += 1;
                    debug!(conversation_id = %conversation_id, turn, "model call");
                    let response = self.call_model(tx).await?;
                    self.next_state(turn, response)?
                }
                AgentState::ExecutingTool(response) => {
                    debug!(
                        conversation_id = %conversation_id,
                        turn,
                        calls = response.calls.len(),
                        "executing tools"
                    );
                    self.execute_calls(tx, response).await?;
                    AgentState::AwaitingModel
                }
                AgentState::StreamingText(response) => {
                    debug!(conversation_id = %conversation_id, turn, "final response");
                    self.finish(tx, response).await?;
                    AgentState::Done
                }
                AgentState::Done => return Ok(()),
            };
        }
    }

    /// Decide what a finished model response leads to.
    fn next_state(&mut self, turn: usize, mut response: Response) -> Result<AgentState> {
        let more_turns = turn < self.max_turns;
        match response.stop {
            None => Err(Error::UpstreamModelError(
                "model stream ended without a stop event".to_string(),
            )),
            Some(StopReason::MaxTokens) => Err(Error::UpstreamModelError(
                "model response cut off at the output token limit".to_string(),
            )),
            Some(_) if !response.calls.is_empty() => {
                if !more_turns {
                    warn!(conversation_id = %self.ctx.conversation_id, turn, "tool loop cap reached");
                    return Err(Error::ToolLoopExceeded(self.max_turns));
                }
                // Text beside a tool call is context for the model, not answer.
                self.carried.clear();
                Ok(AgentState::ExecutingTool(response))
            }
            Some(StopReason::PauseTurn) => {
                if !more_turns {
                    warn!(conversation_id = %self.ctx.conversation_id, turn, "paused past the turn cap");
                    return Err(Error::ToolLoopExceeded(self.max_turns));
                }
                debug!(conversation_id = %self.ctx.conversation_id, turn, "resuming paused response");
                self.carried.append(&mut response.deltas);
                push_message(
                    &mut self.messages,
                    ChatMessage {
                        role: ChatRole::Assistant,
                        content: response.blocks,
                    },
                );
                Ok(AgentState::AwaitingModel)
            }
            Some(_) => {
                let mut deltas = std::mem::take(&mut self.carried);
                deltas.append(&mut response.deltas);
                response.deltas = deltas;
                Ok(AgentState::StreamingText(response))
            }
        }
    }

    async fn call_model(&mut self, tx: &mpsc::Sender<AgentEvent>) -> Result<Response> {
        let request = ChatRequest {
            tier: ModelTier::Chat,
            system: Some(match self.web_search {
                Some(_) => format!("{}{}", SYSTEM_PROMPT, WEB_PROMPT),
                None => SYSTEM_PROMPT.to_string(),
            }),
            messages: self.messages.clone(),
            tools: self.tools.specs(),
            web_search_max_uses: self.web_search,
            max_tokens: None,
        };

        let mut stream = self.model.stream(request).await?;
        let mut response = Response::default();

        while let Some(event) = stream.next().await {
            match event? {
                ModelEvent::TextDelta(delta) => response.push_text(delta),
                ModelEvent::Part(ResponsePart::FunctionCall { id, name, input }) => {
                    response.blocks.push(ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    });
                    response.calls.push((id, name, input));
                }
                ModelEvent::Part(ResponsePart::ResolvedCall {
                    name,
                    query,
                    results,
                    blocks,
                }) => {
                    info!(tool = %name, query = %query, result_count = results.len(), "web search");
                    emit(tx, AgentEvent::status(format!("Web search: {}", query))).await?;
                    response.blocks.extend(blocks.into_iter().map(ContentBlock::Raw));
                }
                ModelEvent::Stop(reason) => {
                    response.stop = Some(reason);
                    break;
                }
            }
        }

        Ok(response)
    }

    async fn execute_calls(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        response: Response,
    ) -> Result<()> {
        let mut results = Vec::with_capacity(response.calls.len());

        for (id, name, input) in response.calls {
            let (content, is_error) = match self.tools.find(&name) {
                Some(tool) => {
                    if let Some(status) = tool.status(&input) {
                        emit(tx, AgentEvent::status(status)).await?;
                    }
                    match tool.execute(input, &self.ctx).await {
                        Ok(output) => {
                            if let Some(summary) = output.summary {
                                emit(tx, AgentEvent::status(summary)).await?;
                            }
                            (output.content, false)
                        }
                        Err(e) => {
                            warn!(tool = %name, error = %e, "tool failed");
                            (format!("Tool error: {}", e), true)
                        }
                    }
                }
                None => {
                    warn!(tool = %name, "model called unknown tool");
                    (format!("Unknown tool: {}", name), true)
                }
            };
            results.push(ContentBlock::ToolResult {
                tool_use_id: id,
                content,
                is_error,
            });
        }

        push_message(
            &mut self.messages,
            ChatMessage {
                role: ChatRole::Assistant,
                content: response.blocks,
            },
        );
        self.messages.push(ChatMessage {
            role: ChatRole::User,
            content: results,
        });
        Ok(())
    }

    async fn finish(&self, tx: &mpsc::Sender<AgentEvent>, response: Response) -> Result<()> {
        // Replay deltas through the partial renderer so tags never leak.
        let mut raw = String::new();
        let mut shown = String::new();
        for delta in &response.deltas {
            raw.push_str(delta);
            let rendered = render_partial(&raw, &self.labels);
            if let Some(fresh) = rendered.strip_prefix(shown.as_str()) {
                if !fresh.is_empty() {
                    emit(tx, AgentEvent::Delta { text: fresh.to_string() }).await?;
                    shown = rendered;
                }
            }
        }

        let text = response.text();
        let extraction = extract(&text, &self.labels);
        if let Some(rest) = extraction.cleaned.strip_prefix(shown.as_str()) {
            if !rest.is_empty() {
                emit(tx, AgentEvent::Delta { text: rest.to_string() }).await?;
            }
        }
        if !extraction.dropped.is_empty() {
            warn!(
                conversation_id = %self.ctx.conversation_id,
                dropped = extraction.dropped.len(),
                "citations rendered as prose"
            );
        }

        let message = self
            .store
            .save_message(NewMessage {
                conversation_id: self.ctx.conversation_id.clone(),
                role: Role::Assistant,
                content: text,
                citations: extraction.citations.clone(),
            })
            .await?;

        info!(
            conversation_id = %self.ctx.conversation_id,
            message_id = %message.id,
            sources_cited = message.sources_cited,
            "answer persisted"
        );

        emit(
            tx,
            AgentEvent::Done {
                message_id: message.id,
                content: extraction.cleaned,
                citations: extraction.citations,
                label_map: self.labels.clone(),
                sources_cited: message.sources_cited,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: Role, content: &str) -> Message {
        Message {
            id: "m".into(),
            conversation_id: "c".into(),
            role,
            content: content.into(),
            sources_cited: 0,
            created_at: 0,
            citations: Vec::new(),
        }
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("  \"Lease Rent Review\" \n"), "Lease Rent Review");
        let long = "x".repeat(150);
        let cleaned = clean_title(&long);
        assert_eq!(cleaned.chars().count(), 100);
        assert!(cleaned.ends_with("..."));
    }

    #[test]
    fn test_replay_history_renders_citations() {
        let history = vec![
            message(Role::User, "What is the rent?"),
            message(
                Role::Assistant,
                "It is <cite doc=\"Doc A\" page=\"2\">£12,000</cite>.",
            ),
        ];
        let replay = replay_history(&history, 20);
        assert_eq!(replay.len(), 2);
        assert_eq!(
            replay[1].content,
            vec![ContentBlock::Text("It is £12,000 [Doc A, p.2].".into())]
        );
    }

    #[test]
    fn test_replay_history_limit_and_alternation() {
        let history = vec![
            message(Role::User, "q1"),
            message(Role::Assistant, "a1"),
            message(Role::User, "q2"),
            message(Role::User, "q3"),
        ];
        // Limit 3 starts at an assistant turn, which is skipped.
        let replay = replay_history(&history, 3);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].role, ChatRole::User);
        assert_eq!(replay[0].content.len(), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = AgentEvent::status("Searching: rent");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["text"], "Searching: rent");

        let err = AgentEvent::error(&Error::ToolLoopExceeded(6));
        assert!(matches!(err, AgentEvent::Error { ref kind, .. } if kind == "tool_loop_exceeded"));
    }
}
