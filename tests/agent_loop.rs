//! Question answering end to end with scripted model responses.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use casefile::agent::{AgentEvent, AgentSettings, Orchestrator};
use casefile::config::Config;
use casefile::ingest::Ingestor;
use casefile::llm::{ChatRole, ContentBlock, ModelEvent, ResponsePart, StopReason, WebResult};
use casefile::tools::ToolRegistry;
use casefile_core::chunk::WordCounter;
use casefile_core::error::Error;
use casefile_core::models::{Citation, Role};
use casefile_core::store::memory::InMemoryStore;
use casefile_core::store::Store;

use common::*;

async fn collect(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => return events,
            Err(_) => panic!("agent did not finish; events so far: {:?}", events),
        }
    }
}

fn orchestrator(
    config: &Config,
    store: Arc<dyn Store>,
    model: Arc<ScriptedModel>,
    tweak: impl FnOnce(&mut AgentSettings),
) -> Orchestrator {
    let mut settings = AgentSettings::from_config(config);
    tweak(&mut settings);
    Orchestrator::new(
        store,
        Arc::new(HashEmbedder::new()),
        model,
        ToolRegistry::with_builtins(),
        settings,
    )
}

#[tokio::test]
async fn test_lease_question_answered_with_citation() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store = sqlite_store(&config).await;
    let model = Arc::new(
        ScriptedModel::new(vec![
            Turn::Events(vec![search_call("toolu_1", "annual rent")]),
            Turn::Events(vec![
                text("The annual rent is "),
                text("<cite doc=\"Doc A\" page=\"2\" section=\"Section 3 — Rent\">twelve thousand pounds</cite>."),
            ]),
        ])
        .with_completer(lease_enrichment),
    );

    let ingestor = Ingestor::new(&config, store.clone(), Arc::new(HashEmbedder::new()), model.clone())
        .unwrap()
        .with_counter(Arc::new(WordCounter));
    let conversation = store.create_conversation(None).await.unwrap();
    let document = ingestor
        .ingest_upload(&conversation.id, "lease.pdf", &pdf_with_pages(&LEASE_PAGES), false)
        .await
        .unwrap();

    let agent = orchestrator(&config, store.clone(), model.clone(), |_| {});
    let rx = agent
        .send(&conversation.id, None, "What is the annual rent?", CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;

    let statuses: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Status { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(statuses[0], "Searching documents...");
    assert_eq!(statuses[1], "Searching: annual rent");
    assert!(statuses[2].starts_with("Found "));
    assert!(statuses[2].ends_with("across Doc A"));

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Delta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    let expected = "The annual rent is twelve thousand pounds [Doc A, Section 3 — Rent, p.2].";
    assert_eq!(streamed, expected);
    assert!(!streamed.contains("<cite"));

    let Some(AgentEvent::Done {
        content,
        citations,
        label_map,
        sources_cited,
        ..
    }) = events.last()
    else {
        panic!("expected done, got {:?}", events.last());
    };
    assert_eq!(content, expected);
    assert_eq!(*sources_cited, 1);
    assert_eq!(label_map["Doc A"].document_id, document.id);
    assert_eq!(
        citations[0],
        Citation::Document {
            doc_label: "Doc A".into(),
            document_id: document.id.clone(),
            page: 2,
            section: Some("Section 3 — Rent".into()),
            quote: "twelve thousand pounds".into(),
        }
    );

    // The search result block given back to the model leads with the rent clause.
    let requests = model.chat_requests();
    assert_eq!(requests.len(), 2);
    let tool_turn = requests[1].messages.last().unwrap();
    assert_eq!(tool_turn.role, ChatRole::User);
    let ContentBlock::ToolResult {
        tool_use_id,
        content,
        is_error,
    } = &tool_turn.content[0]
    else {
        panic!("expected tool result, got {:?}", tool_turn.content);
    };
    assert_eq!(tool_use_id, "toolu_1");
    assert!(!is_error);
    assert!(content.starts_with("[Result 1] Doc A (lease.pdf), Page 2, Section: Section 3 — Rent"));

    let messages = store.list_messages(&conversation.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert!(messages[1].content.contains("<cite doc=\"Doc A\""));
    assert_eq!(messages[1].citations.len(), 1);
    assert_eq!(messages[1].sources_cited, 1);

    let mut title = None;
    for _ in 0..50 {
        title = store.get_conversation(&conversation.id).await.unwrap().unwrap().title;
        if title.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(title.as_deref(), Some("Unit 4 Lease Rent"));
}

#[tokio::test]
async fn test_tool_loop_cap() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let turns = (0..10)
        .map(|i| Turn::Events(vec![search_call(&format!("toolu_{}", i), "rent")]))
        .collect();
    let model = Arc::new(ScriptedModel::new(turns));
    let agent = orchestrator(&config, store.clone(), model.clone(), |s| s.max_turns = 3);

    let conversation = store.create_conversation(Some("Loop")).await.unwrap();
    let rx = agent
        .send(&conversation.id, None, "What is the rent?", CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;

    assert_eq!(model.stream_calls(), 3);
    match events.last() {
        Some(AgentEvent::Error { kind, .. }) => assert_eq!(kind, "tool_loop_exceeded"),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(
        events.iter().filter(|e| matches!(e, AgentEvent::Error { .. })).count(),
        1
    );
    assert!(!events.iter().any(|e| matches!(e, AgentEvent::Done { .. })));

    // Only the question survives a failed turn.
    let messages = store.list_messages(&conversation.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn test_text_beside_tool_call_is_not_shown() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let model = Arc::new(ScriptedModel::new(vec![
        Turn::Events(vec![text("Let me look that up."), search_call("toolu_1", "rent")]),
        Turn::Events(vec![text("No document mentions rent.")]),
    ]));
    let agent = orchestrator(&config, store.clone(), model.clone(), |_| {});

    let conversation = store.create_conversation(Some("Quiet")).await.unwrap();
    let rx = agent
        .send(&conversation.id, None, "What is the rent?", CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Delta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "No document mentions rent.");

    // The thinking-aloud text is still replayed to the model.
    let requests = model.chat_requests();
    let replayed = &requests[1].messages[requests[1].messages.len() - 2];
    assert_eq!(replayed.role, ChatRole::Assistant);
    assert_eq!(
        replayed.content[0],
        ContentBlock::Text("Let me look that up.".into())
    );
}

fn web_search(query: &str) -> ModelEvent {
    ModelEvent::Part(ResponsePart::ResolvedCall {
        name: "web_search".into(),
        query: query.into(),
        results: vec![WebResult {
            url: "https://example.org/rents".into(),
            title: "Rent index".into(),
        }],
        blocks: vec![
            serde_json::json!({"type": "server_tool_use", "id": "srv_1", "name": "web_search", "input": {"query": query}}),
            serde_json::json!({"type": "web_search_tool_result", "tool_use_id": "srv_1", "content": []}),
        ],
    })
}

fn deltas(events: &[AgentEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Delta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_web_search_answers_in_one_turn() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let model = Arc::new(ScriptedModel::new(vec![Turn::Events(vec![
        web_search("UK rent law"),
        text("<webcite url=\"https://example.org/rents\" title=\"Rent index\">Rents rose 4%</webcite>."),
    ])]));
    let agent = orchestrator(&config, store.clone(), model.clone(), |_| {});
    let conversation = store.create_conversation(Some("Market")).await.unwrap();

    let rx = agent
        .send(&conversation.id, None, "How have rents moved?", CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;

    assert_eq!(model.stream_calls(), 1);
    assert!(matches!(
        &events[0],
        AgentEvent::Status { text } if text == "Web search: UK rent law"
    ));
    assert_eq!(deltas(&events), "Rents rose 4% [Web · Rent index].");
    match events.last() {
        Some(AgentEvent::Done { citations, sources_cited, .. }) => {
            assert_eq!(*sources_cited, 1);
            assert!(matches!(&citations[0], Citation::Web { url, .. } if url == "https://example.org/rents"));
        }
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn test_paused_response_is_resumed() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let model = Arc::new(ScriptedModel::new(vec![
        Turn::Events(vec![
            web_search("UK rent law"),
            text("Rents rose "),
            stop(StopReason::PauseTurn),
        ]),
        Turn::Events(vec![text("4% last year.")]),
    ]));
    let agent = orchestrator(&config, store.clone(), model.clone(), |_| {});
    let conversation = store.create_conversation(Some("Paused")).await.unwrap();

    let rx = agent
        .send(&conversation.id, None, "How have rents moved?", CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;

    assert_eq!(model.stream_calls(), 2);
    assert_eq!(deltas(&events), "Rents rose 4% last year.");
    assert!(matches!(
        events.last(),
        Some(AgentEvent::Done { content, .. }) if content == "Rents rose 4% last year."
    ));

    // The paused blocks are handed back as the trailing assistant turn.
    let requests = model.chat_requests();
    let resumed = requests[1].messages.last().unwrap();
    assert_eq!(resumed.role, ChatRole::Assistant);
    assert!(matches!(resumed.content[0], ContentBlock::Raw(_)));
    assert_eq!(
        resumed.content.last(),
        Some(&ContentBlock::Text("Rents rose ".into()))
    );

    let messages = store.list_messages(&conversation.id).await.unwrap();
    assert_eq!(messages[1].content, "Rents rose 4% last year.");
}

#[tokio::test]
async fn test_incomplete_responses_are_not_persisted() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let cases = vec![
        Turn::Events(vec![text("The rent is"), stop(StopReason::MaxTokens)]),
        Turn::Raw(vec![text("The rent is")]),
    ];
    for turn in cases {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let model = Arc::new(ScriptedModel::new(vec![turn]));
        let agent = orchestrator(&config, store.clone(), model, |_| {});
        let conversation = store.create_conversation(Some("Cut")).await.unwrap();

        let rx = agent
            .send(&conversation.id, None, "What is the rent?", CancellationToken::new())
            .await
            .unwrap();
        let events = collect(rx).await;

        assert_eq!(events.len(), 1, "{:?}", events);
        assert!(matches!(
            &events[0],
            AgentEvent::Error { kind, .. } if kind == "upstream_model_error"
        ));
        assert_eq!(store.list_messages(&conversation.id).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_busy_conversation_and_cancellation() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let model = Arc::new(ScriptedModel::new(vec![Turn::Hang, Turn::Hang]));
    let agent = orchestrator(&config, store.clone(), model.clone(), |_| {});
    let conversation = store.create_conversation(Some("Busy")).await.unwrap();

    let first = CancellationToken::new();
    let mut rx = agent
        .send(&conversation.id, None, "First question", first.clone())
        .await
        .unwrap();

    let err = agent
        .send(&conversation.id, None, "Second question", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConversationBusy(_)));

    first.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert!(closed.is_none(), "a cancelled question emits nothing");

    // Only the first question was stored; no assistant message.
    let messages = store.list_messages(&conversation.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "First question");

    // The conversation is free again.
    let again = CancellationToken::new();
    let rx = agent
        .send(&conversation.id, None, "Third question", again.clone())
        .await
        .unwrap();
    again.cancel();
    drop(rx);
}

#[tokio::test]
async fn test_deadline_emits_timeout() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let model = Arc::new(ScriptedModel::new(vec![Turn::Hang]));
    let agent = orchestrator(&config, store.clone(), model, |s| {
        s.deadline = Duration::from_millis(50)
    });
    let conversation = store.create_conversation(Some("Slow")).await.unwrap();

    let rx = agent
        .send(&conversation.id, None, "Anything?", CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        AgentEvent::Error { kind, .. } => assert_eq!(kind, "timeout"),
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_upstream_failure_is_one_error_event() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    // An empty script fails the first model call.
    let model = Arc::new(ScriptedModel::new(vec![]));
    let agent = orchestrator(&config, store.clone(), model, |_| {});
    let conversation = store.create_conversation(Some("Down")).await.unwrap();

    let rx = agent
        .send(&conversation.id, None, "Hello", CancellationToken::new())
        .await
        .unwrap();
    let events = collect(rx).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        AgentEvent::Error { kind, .. } if kind == "upstream_model_error"
    ));
}

#[tokio::test]
async fn test_send_rejects_bad_input() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let agent = orchestrator(&config, store.clone(), Arc::new(ScriptedModel::new(vec![])), |_| {});

    let err = agent
        .send("nope", None, "Hello", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let conversation = store.create_conversation(None).await.unwrap();
    let err = agent
        .send(&conversation.id, None, "   ", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(store.list_messages(&conversation.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_history_is_replayed_rendered() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let model = Arc::new(ScriptedModel::new(vec![
        Turn::Events(vec![text("It is <cite doc=\"Doc A\" page=\"2\">£12,000</cite>.")]),
        Turn::Events(vec![text("Quarterly.")]),
    ]));
    let agent = orchestrator(&config, store.clone(), model.clone(), |_| {});
    let conversation = store.create_conversation(Some("Rent")).await.unwrap();

    let rx = agent
        .send(&conversation.id, None, "What is the rent?", CancellationToken::new())
        .await
        .unwrap();
    collect(rx).await;
    let rx = agent
        .send(&conversation.id, None, "How is it paid?", CancellationToken::new())
        .await
        .unwrap();
    collect(rx).await;

    let requests = model.chat_requests();
    let second = &requests[1].messages;
    assert_eq!(second.len(), 3);
    assert_eq!(
        second[1].content,
        vec![ContentBlock::Text("It is £12,000 [Doc A, p.2].".into())]
    );
    assert_eq!(last_prompt(&requests[1]), "How is it paid?");
}
