//! Contextual chunk enrichment.
//!
//! Each chunk gets one auxiliary-model call that sees the whole document
//! (truncated) and the chunk, and returns a short situating context plus
//! the section heading the chunk falls under. Calls run with bounded
//! concurrency and results come back in chunk order. A chunk whose call
//! keeps failing is stored without context; enrichment never fails an
//! upload.

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use casefile_core::error::{Error, Result};

use crate::config::EnrichmentConfig;
use crate::llm::{strip_code_fence, ChatMessage, ChatModel, ChatRequest};

const TRUNCATION_MARKER: &str = "\n\n[... document truncated ...]";

const SYSTEM: &str = "You situate excerpts of legal documents for search. \
Respond with a single JSON object and nothing else.";

/// Enrichment result for one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub context: String,
    pub section: Option<String>,
}

#[derive(Deserialize)]
struct RawEnrichment {
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    section: Option<String>,
}

pub struct Enricher {
    model: Arc<dyn ChatModel>,
    config: EnrichmentConfig,
}

impl Enricher {
    pub fn new(model: Arc<dyn ChatModel>, config: EnrichmentConfig) -> Self {
        Self { model, config }
    }

    /// Enrich every chunk of one document. Output order matches `chunks`.
    pub async fn enrich_all(&self, document_text: &str, chunks: &[String]) -> Vec<Enrichment> {
        if !self.config.enabled {
            return vec![Enrichment::default(); chunks.len()];
        }

        let document = truncate_document(document_text, self.config.max_document_chars);
        let concurrency = self.config.concurrency.max(1);

        stream::iter(chunks.iter().enumerate())
            .map(|(index, chunk)| {
                let document = &document;
                async move { self.enrich_one(index, document, chunk).await }
            })
            .buffered(concurrency)
            .collect()
            .await
    }

    async fn enrich_one(&self, index: usize, document: &str, chunk: &str) -> Enrichment {
        let mut last_err = String::new();
        for attempt in 0..=self.config.max_retries {
            match self.call(document, chunk).await {
                Ok(enrichment) => {
                    debug!(chunk_index = index, attempt, "chunk enriched");
                    return enrichment;
                }
                Err(e) => {
                    debug!(chunk_index = index, attempt, error = %e, "enrichment attempt failed");
                    last_err = e.to_string();
                }
            }
        }

        let degraded = Error::EnrichmentDegraded {
            chunk_index: index,
            reason: last_err,
        };
        warn!(kind = degraded.kind(), "{}", degraded);
        Enrichment::default()
    }

    async fn call(&self, document: &str, chunk: &str) -> Result<Enrichment> {
        let request = ChatRequest::aux(
            Some(SYSTEM),
            ChatMessage::user_text(build_prompt(document, chunk)),
        );
        let reply = self.model.complete(request).await?;
        parse_reply(&reply)
    }
}

fn build_prompt(document: &str, chunk: &str) -> String {
    format!(
        "<document>\n{}\n</document>\n\n\
         Here is a chunk from the document above:\n<chunk>\n{}\n</chunk>\n\n\
         Return a JSON object with exactly two keys:\n\
         - \"context\": 1-3 sentences situating this chunk within the whole document \
           (which document it is, which part, what it is about), to improve search retrieval.\n\
         - \"section\": the section, clause, or heading label this chunk falls under \
           (e.g. \"Section 3 — Rent\"), or null if there is none.",
        document, chunk
    )
}

/// Cut the document to `max_chars` characters, marking the cut.
pub fn truncate_document(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{}", &text[..idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// Parse the model's JSON reply. `null`, `""`, and `"null"` sections are absent.
pub fn parse_reply(reply: &str) -> Result<Enrichment> {
    let raw: RawEnrichment = serde_json::from_str(strip_code_fence(reply))?;
    let section = raw
        .section
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"));
    Ok(Enrichment {
        context: raw.context.unwrap_or_default().trim().to_string(),
        section,
    })
}
