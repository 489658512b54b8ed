//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/conversations/{id}/search` | Hybrid search within a conversation |
//! | `POST` | `/conversations/{id}/messages` | Ask a question; streams server-sent events |
//!
//! # Event stream
//!
//! `POST /conversations/{id}/messages` answers with `text/event-stream`.
//! Event names are `status`, `content`, `done`, and `error`; each data
//! payload is the JSON form of the corresponding [`AgentEvent`]. Closing
//! the connection cancels the question and nothing is persisted.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Not found: conversation 42" } }
//! ```
//!
//! Codes are the error kinds of [`casefile_core::Error`].
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use casefile_core::error::Error;
use casefile_core::search::{hybrid_search, SearchHit, SearchRequest};

use crate::agent::AgentEvent;
use crate::app::App;

/// Starts the server on `[server].bind` and runs until the process ends.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let router = build_router(app);

    info!(bind = %bind_addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// The application's routes with CORS applied.
pub fn build_router(app: App) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/conversations/{id}/search", post(handle_search))
        .route("/conversations/{id}/messages", post(handle_message))
        .layer(cors)
        .with_state(app)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Converts a core error into an HTTP response.
struct AppError(Error);

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) | Error::UploadRejected(_) | Error::DocumentUnreadable(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::ConversationBusy(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::UpstreamModelError(_) | Error::EmbeddingBatchFailed(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.kind().to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /conversations/{id}/search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    document_ids: Option<Vec<String>>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(app): State<App>,
    Path(conversation_id): Path<String>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    if app.store.get_conversation(&conversation_id).await?.is_none() {
        return Err(Error::NotFound(format!("conversation {}", conversation_id)).into());
    }

    let mut params = app.config.retrieval_params();
    if let Some(limit) = body.limit {
        params.final_limit = limit.max(1);
    }
    let req = SearchRequest {
        conversation_id: &conversation_id,
        document_ids: body.document_ids.as_deref(),
        query: &body.query,
        params,
    };
    let results = hybrid_search(app.store.as_ref(), app.embedder.as_ref(), &req).await?;
    Ok(Json(SearchResponse { results }))
}

// ============ POST /conversations/{id}/messages ============

#[derive(Deserialize)]
struct MessageBody {
    content: String,
    #[serde(default)]
    document_ids: Option<Vec<String>>,
}

/// Cancels the question when the response stream is dropped.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

async fn handle_message(
    State(app): State<App>,
    Path(conversation_id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let cancel = CancellationToken::new();
    let rx = app
        .orchestrator
        .send(&conversation_id, body.document_ids, &body.content, cancel.clone())
        .await?;

    Ok(Sse::new(event_stream(rx, CancelOnDrop(cancel))).keep_alive(KeepAlive::default()))
}

fn event_stream(
    rx: mpsc::Receiver<AgentEvent>,
    guard: CancelOnDrop,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Ok(to_sse(&event)), (rx, guard)))
    })
}

/// Event name on the wire for an agent event.
pub fn sse_name(event: &AgentEvent) -> &'static str {
    match event {
        AgentEvent::Status { .. } => "status",
        AgentEvent::Delta { .. } => "content",
        AgentEvent::Done { .. } => "done",
        AgentEvent::Error { .. } => "error",
    }
}

fn to_sse(event: &AgentEvent) -> Event {
    Event::default()
        .event(sse_name(event))
        .json_data(event)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}
