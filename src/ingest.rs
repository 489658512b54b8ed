//! Upload ingestion pipeline.
//!
//! Coordinates the full upload flow: validation → page extraction →
//! chunking → enrichment → embedding → storage. A document row exists
//! only once extraction succeeded; from then on the document ends either
//! `ready` with all of its chunks or `failed` with none.

use std::sync::Arc;
use tracing::{error, info};

use casefile_core::chunk::{chunk_pages, finalize_chunks, ChunkParams, TokenCounter};
use casefile_core::embedding::{embed_all, Embedder};
use casefile_core::error::{Error, Result};
use casefile_core::models::{Document, PageText};
use casefile_core::store::Store;

use crate::config::Config;
use crate::enrich::Enricher;
use crate::extract::{validate_upload, Extractor};
use crate::llm::ChatModel;

/// BPE token counter using the `cl100k_base` encoding.
pub struct TiktokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenCounter {
    pub fn cl100k() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

pub struct Ingestor {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    extractor: Extractor,
    enricher: Enricher,
    counter: Arc<dyn TokenCounter>,
    chunk_params: ChunkParams,
    batch_size: usize,
    max_bytes: usize,
}

impl Ingestor {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store,
            embedder,
            extractor: Extractor::new(config, model.clone()),
            enricher: Enricher::new(model, config.enrichment.clone()),
            counter: Arc::new(TiktokenCounter::cl100k()?),
            chunk_params: config.chunk_params(),
            batch_size: config.embedding.batch_size,
            max_bytes: config.upload.max_bytes,
        })
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Ingest one uploaded PDF into a conversation.
    ///
    /// Returns the `ready` document. Validation and extraction failures
    /// return before any document is created; later failures leave the
    /// document `failed`.
    pub async fn ingest_upload(
        &self,
        conversation_id: &str,
        filename: &str,
        bytes: &[u8],
        scanned: bool,
    ) -> Result<Document> {
        if self.store.get_conversation(conversation_id).await?.is_none() {
            return Err(Error::NotFound(format!("conversation {}", conversation_id)));
        }

        validate_upload(filename, bytes, self.max_bytes)?;
        let pages = self.extractor.extract(bytes, scanned).await?;

        let document = self
            .store
            .create_document(conversation_id, filename, pages.len() as u32)
            .await?;
        info!(
            document_id = %document.id,
            label = %document.label,
            pages = pages.len(),
            "document created"
        );

        if let Err(e) = self.process(&document, &pages).await {
            error!(document_id = %document.id, error = %e, "ingestion failed");
            if let Err(mark_err) = self.store.mark_failed(&document.id).await {
                error!(document_id = %document.id, error = %mark_err, "could not mark document failed");
            }
            return Err(e);
        }

        self.store
            .get_document(&document.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", document.id)))
    }

    async fn process(&self, document: &Document, pages: &[PageText]) -> Result<()> {
        let drafts = chunk_pages(pages, self.chunk_params, self.counter.as_ref());
        if drafts.is_empty() {
            return Err(Error::DocumentUnreadable("no extractable text".to_string()));
        }

        let document_text = pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunk_texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let enrichments = self
            .enricher
            .enrich_all(&document_text, &chunk_texts)
            .await
            .into_iter()
            .map(|e| (e.context, e.section))
            .collect();

        let chunks = finalize_chunks(&document.id, &drafts, enrichments);
        let embeddable: Vec<String> = chunks.iter().map(|c| c.embeddable_text()).collect();
        let vectors = embed_all(self.embedder.as_ref(), &embeddable, self.batch_size).await?;

        self.store
            .commit_chunks(&document.id, &chunks, &vectors)
            .await?;

        info!(
            document_id = %document.id,
            chunk_count = chunks.len(),
            "document ready"
        );
        Ok(())
    }
}
