//! Page text extraction for uploaded PDFs.
//!
//! Uploads are validated before anything is stored: only PDFs are
//! accepted and size is capped. Text comes from the embedded text layer
//! (`pdf-extract`, with `lopdf` for page structure). Scanned documents, or
//! documents whose text layer is nearly empty, go through OCR instead:
//! each page is rasterised with `pdftoppm` and transcribed by the
//! auxiliary vision model. OCR never fails a document; a page that cannot
//! be rendered or transcribed becomes empty text.

use async_trait::async_trait;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use casefile_core::error::{Error, Result};
use casefile_core::models::PageText;

use crate::config::{Config, OcrConfig};
use crate::llm::{ChatMessage, ChatModel, ChatRequest, ChatRole, ContentBlock, ModelTier};

const PDF_MAGIC: &[u8] = b"%PDF";

const OCR_PROMPT: &str = "Transcribe all text on this page of a legal document exactly as written. \
Preserve headings, clause and section numbers, paragraph breaks, and table layout. \
Do not summarise, correct, or add commentary. Return only the transcription.";

/// Reject uploads that are not PDFs or are too large.
pub fn validate_upload(filename: &str, bytes: &[u8], max_bytes: usize) -> Result<()> {
    if bytes.is_empty() {
        return Err(Error::DocumentUnreadable("empty file".to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(Error::UploadRejected(format!(
            "{} is {} bytes; the limit is {}",
            filename,
            bytes.len(),
            max_bytes
        )));
    }
    if !bytes.starts_with(PDF_MAGIC) {
        if filename.to_ascii_lowercase().ends_with(".pdf") {
            return Err(Error::DocumentUnreadable(
                "missing %PDF header".to_string(),
            ));
        }
        return Err(Error::UploadRejected(format!(
            "{}: only PDF files are accepted",
            filename
        )));
    }
    Ok(())
}

/// Parse the PDF structure and return its page count.
pub fn page_count(bytes: &[u8]) -> Result<u32> {
    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| Error::DocumentUnreadable(format!("PDF parse failed: {}", e)))?;
    let pages = doc.get_pages().len() as u32;
    if pages == 0 {
        return Err(Error::DocumentUnreadable("PDF has no pages".to_string()));
    }
    Ok(pages)
}

/// Per-page text from the embedded text layer, exactly `pages` entries.
pub fn text_layer(bytes: &[u8], pages: u32) -> Result<Vec<PageText>> {
    let mut texts = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| Error::DocumentUnreadable(format!("PDF text extraction failed: {}", e)))?;
    texts.resize(pages as usize, String::new());

    Ok(texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| PageText {
            page_number: i as u32 + 1,
            text: text.trim().to_string(),
        })
        .collect())
}

fn total_chars(pages: &[PageText]) -> usize {
    pages.iter().map(|p| p.text.trim().chars().count()).sum()
}

// ═══════════════════════════════════════════════════════════════════════
// Page rendering
// ═══════════════════════════════════════════════════════════════════════

/// Rasterises one PDF page to PNG.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render_png(&self, pdf: &[u8], page: u32, dpi: u32) -> anyhow::Result<Vec<u8>>;
}

/// Renders with poppler's `pdftoppm`.
pub struct Pdftoppm {
    program: String,
    timeout: Duration,
}

impl Pdftoppm {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            program: config.renderer.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[async_trait]
impl PageRenderer for Pdftoppm {
    async fn render_png(&self, pdf: &[u8], page: u32, dpi: u32) -> anyhow::Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.pdf");
        let prefix = dir.path().join("page");
        tokio::fs::write(&input, pdf).await?;

        let page_arg = page.to_string();
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(["-png", "-singlefile", "-r", &dpi.to_string()])
            .args(["-f", &page_arg, "-l", &page_arg])
            .arg(&input)
            .arg(&prefix)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| anyhow::anyhow!("{} timed out on page {}", self.program, page))??;
        if !output.status.success() {
            anyhow::bail!(
                "{} failed on page {}: {}",
                self.program,
                page,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(tokio::fs::read(prefix.with_extension("png")).await?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════════════════

/// Turns validated PDF bytes into page texts.
pub struct Extractor {
    model: Arc<dyn ChatModel>,
    renderer: Arc<dyn PageRenderer>,
    ocr: OcrConfig,
}

impl Extractor {
    pub fn new(config: &Config, model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            renderer: Arc::new(Pdftoppm::new(&config.ocr)),
            ocr: config.ocr.clone(),
        }
    }

    /// Replace the page renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Extract one entry per page, 1-indexed and contiguous.
    ///
    /// `scanned` forces OCR. Otherwise OCR runs only when auto fallback is
    /// on and the text layer is below `min_text_chars`.
    pub async fn extract(&self, bytes: &[u8], scanned: bool) -> Result<Vec<PageText>> {
        let owned = bytes.to_vec();
        let direct = tokio::task::spawn_blocking(move || -> Result<(u32, Vec<PageText>)> {
            let pages = page_count(&owned)?;
            // A broken text layer is not fatal when OCR can cover it.
            let texts = text_layer(&owned, pages).unwrap_or_else(|e| {
                warn!(error = %e, "text layer unavailable");
                blank_pages(pages)
            });
            Ok((pages, texts))
        })
        .await
        .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))?;
        let (pages, texts) = direct?;

        let chars = total_chars(&texts);
        let use_ocr = scanned || (self.ocr.auto_fallback && chars < self.ocr.min_text_chars);
        if !use_ocr {
            if chars == 0 {
                return Err(Error::DocumentUnreadable("no extractable text".to_string()));
            }
            return Ok(texts);
        }

        info!(pages, scanned, text_chars = chars, "extracting with OCR");
        let ocr = self.ocr_pages(bytes, pages).await;
        if total_chars(&ocr) > 0 {
            return Ok(ocr);
        }
        if chars > 0 {
            warn!(pages, "OCR produced no text; keeping the text layer");
            return Ok(texts);
        }
        Err(Error::DocumentUnreadable(
            "no extractable text after OCR".to_string(),
        ))
    }

    async fn ocr_pages(&self, bytes: &[u8], pages: u32) -> Vec<PageText> {
        let mut out = Vec::with_capacity(pages as usize);
        for page_number in 1..=pages {
            let text = match self.ocr_page(bytes, page_number).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(page = page_number, error = %e, "OCR failed for page");
                    String::new()
                }
            };
            out.push(PageText { page_number, text });
        }
        out
    }

    async fn ocr_page(&self, bytes: &[u8], page: u32) -> anyhow::Result<String> {
        let png = self
            .renderer
            .render_png(bytes, page, self.ocr.dpi())
            .await?;
        let data = base64::engine::general_purpose::STANDARD.encode(png);

        let request = ChatRequest {
            tier: ModelTier::Aux,
            system: None,
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: vec![
                    ContentBlock::Image {
                        media_type: "image/png".to_string(),
                        data,
                    },
                    ContentBlock::Text(OCR_PROMPT.to_string()),
                ],
            }],
            tools: Vec::new(),
            web_search_max_uses: None,
            max_tokens: None,
        };
        Ok(self.model.complete(request).await?.trim().to_string())
    }
}

fn blank_pages(pages: u32) -> Vec<PageText> {
    (1..=pages)
        .map(|page_number| PageText {
            page_number,
            text: String::new(),
        })
        .collect()
}
