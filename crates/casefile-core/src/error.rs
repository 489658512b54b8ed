//! Error taxonomy shared by ingestion, retrieval, and the agent loop.

use thiserror::Error;

/// Result type alias using Casefile's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Casefile operations.
///
/// `EnrichmentDegraded` and `CitationUnresolvable` are never returned
/// from a top-level operation; they describe degraded paths that are
/// logged and carried forward.
#[derive(Error, Debug)]
pub enum Error {
    /// The PDF could not be opened or parsed.
    #[error("Document unreadable: {0}")]
    DocumentUnreadable(String),

    /// The upload was refused before parsing (size or type).
    #[error("Upload rejected: {0}")]
    UploadRejected(String),

    /// A chunk's enrichment call failed after all retries.
    #[error("Enrichment degraded for chunk {chunk_index}: {reason}")]
    EnrichmentDegraded { chunk_index: usize, reason: String },

    /// The embedding provider failed or returned malformed vectors.
    #[error("Embedding batch failed: {0}")]
    EmbeddingBatchFailed(String),

    /// The model kept requesting tools past the turn cap.
    #[error("Tool loop exceeded after {0} turns")]
    ToolLoopExceeded(usize),

    /// The chat or auxiliary model returned an error or a broken stream.
    #[error("Upstream model error: {0}")]
    UpstreamModelError(String),

    /// A citation referenced an unknown label or an out-of-range page.
    #[error("Citation unresolvable: {0}")]
    CitationUnresolvable(String),

    /// Another question is already being answered in this conversation.
    #[error("Conversation busy: {0}")]
    ConversationBusy(String),

    /// The overall answer deadline elapsed.
    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// The consumer went away before the answer completed.
    #[error("Cancelled")]
    Cancelled,

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage backend failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable snake_case identifier used in `error` events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::DocumentUnreadable(_) => "document_unreadable",
            Error::UploadRejected(_) => "upload_rejected",
            Error::EnrichmentDegraded { .. } => "enrichment_degraded",
            Error::EmbeddingBatchFailed(_) => "embedding_batch_failed",
            Error::ToolLoopExceeded(_) => "tool_loop_exceeded",
            Error::UpstreamModelError(_) => "upstream_model_error",
            Error::CitationUnresolvable(_) => "citation_unresolvable",
            Error::ConversationBusy(_) => "conversation_busy",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::Store(_) => "store",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
