//! Page-aware paragraph chunker with token overlap.
//!
//! Turns a document's per-page text into [`ChunkDraft`]s that respect a
//! `max_tokens` budget and carry an `overlap_tokens` lead-in from the
//! previous chunk on the same page.
//!
//! # Algorithm
//!
//! 1. Split each page into paragraphs at blank lines.
//! 2. Paragraphs longer than `max_tokens` are hard-split at word
//!    boundaries (and a single oversized word at char boundaries).
//! 3. Greedily pack consecutive paragraphs into the current chunk while
//!    the result stays within `max_tokens`.
//! 4. On overflow, flush the chunk and start the next one with the last
//!    `overlap_tokens` tokens of the flushed chunk, word-aligned. The
//!    lead-in is dropped when it would push the new chunk over budget.
//! 5. A page boundary always flushes. Overlap never crosses pages, so a
//!    chunk's page number is both the page of its first token and the
//!    only page it touches.
//!
//! Token counting is pluggable through [`TokenCounter`]; the app crate
//! supplies a BPE counter, tests use [`WordCounter`].
//!
//! # Example
//!
//! ```rust
//! use casefile_core::chunk::{chunk_pages, ChunkParams, WordCounter};
//! use casefile_core::models::PageText;
//!
//! let pages = vec![PageText { page_number: 1, text: "Hello world.\n\nSecond paragraph.".into() }];
//! let drafts = chunk_pages(&pages, ChunkParams::default(), &WordCounter);
//! assert_eq!(drafts.len(), 1);
//! assert_eq!(drafts[0].page_number, 1);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, PageText};

/// Counts tokens in a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Whitespace word counter. One word is one token.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCounter;

impl TokenCounter for WordCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Chunk budget and overlap, in tokens.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            overlap_tokens: 50,
        }
    }
}

/// A chunk before enrichment and embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub text: String,
    pub page_number: u32,
    pub token_count: usize,
    /// Byte length of the lead-in copied from the previous chunk,
    /// including its `\n\n` separator.
    pub overlap_len: usize,
}

impl ChunkDraft {
    /// The part of the chunk not repeated from its predecessor.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap_len..]
    }
}

/// Split pages into ordered chunk drafts.
///
/// # Guarantees
///
/// - No draft is empty or whitespace-only.
/// - `token_count <= max_tokens` for every draft.
/// - Joining every draft's [`fresh_text`](ChunkDraft::fresh_text)
///   reproduces the words of every page, in order.
/// - Output is a pure function of the inputs.
pub fn chunk_pages(
    pages: &[PageText],
    params: ChunkParams,
    counter: &dyn TokenCounter,
) -> Vec<ChunkDraft> {
    let max = params.max_tokens.max(1);
    let mut drafts = Vec::new();

    for page in pages {
        let mut current = String::new();
        let mut overlap_len = 0usize;

        for paragraph in split_paragraphs(&page.text) {
            for unit in split_oversized(&paragraph, max, counter) {
                if current.is_empty() {
                    current = unit;
                    overlap_len = 0;
                    continue;
                }

                let candidate = format!("{}\n\n{}", current, unit);
                if counter.count(&candidate) <= max {
                    current = candidate;
                    continue;
                }

                let lead_in = overlap_suffix(&current, params.overlap_tokens, counter)
                    .map(str::to_string);
                push_draft(&mut drafts, &current, page.page_number, overlap_len, counter);

                current = unit;
                overlap_len = 0;
                if let Some(lead) = lead_in {
                    let with_lead = format!("{}\n\n{}", lead, current);
                    if counter.count(&with_lead) <= max {
                        overlap_len = lead.len() + 2;
                        current = with_lead;
                    }
                }
            }
        }

        if !current.trim().is_empty() {
            push_draft(&mut drafts, &current, page.page_number, overlap_len, counter);
        }
    }

    drafts
}

/// Turn drafts into chunks for a document, assigning ids and hashes.
///
/// `enrichments[i]` is `(context, section)` for `drafts[i]`.
pub fn finalize_chunks(
    document_id: &str,
    drafts: &[ChunkDraft],
    enrichments: Vec<(String, Option<String>)>,
) -> Vec<Chunk> {
    drafts
        .iter()
        .zip(enrichments)
        .enumerate()
        .map(|(i, (draft, (context, section)))| Chunk {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            chunk_index: i as i64,
            text: draft.text.clone(),
            context,
            section,
            page_number: draft.page_number,
            token_count: draft.token_count,
            hash: content_hash(&draft.text),
        })
        .collect()
}

/// Hex SHA-256 of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn push_draft(
    drafts: &mut Vec<ChunkDraft>,
    text: &str,
    page_number: u32,
    overlap_len: usize,
    counter: &dyn TokenCounter,
) {
    drafts.push(ChunkDraft {
        text: text.to_string(),
        page_number,
        token_count: counter.count(text),
        overlap_len,
    });
}

/// Split page text at blank lines, trimming each paragraph.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut buf: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !buf.is_empty() {
                paragraphs.push(buf.join("\n").trim().to_string());
                buf.clear();
            }
        } else {
            buf.push(line);
        }
    }
    if !buf.is_empty() {
        paragraphs.push(buf.join("\n").trim().to_string());
    }

    paragraphs.retain(|p| !p.is_empty());
    paragraphs
}

/// Hard-split a paragraph that exceeds `max` tokens at word boundaries.
fn split_oversized(paragraph: &str, max: usize, counter: &dyn TokenCounter) -> Vec<String> {
    if counter.count(paragraph) <= max {
        return vec![paragraph.to_string()];
    }

    let words = word_spans(paragraph);
    let mut pieces = Vec::new();
    let mut i = 0;

    while i < words.len() {
        // Estimate from per-word counts, then shrink until the joined
        // slice really fits.
        let mut j = i;
        let mut estimate = 0usize;
        while j < words.len() {
            let w = counter.count(&paragraph[words[j].0..words[j].1]).max(1);
            if j > i && estimate + w > max {
                break;
            }
            estimate += w;
            j += 1;
        }
        while j > i + 1 && counter.count(&paragraph[words[i].0..words[j - 1].1]) > max {
            j -= 1;
        }

        let piece = &paragraph[words[i].0..words[j - 1].1];
        if j == i + 1 && counter.count(piece) > max {
            pieces.extend(split_chars(piece, max, counter));
        } else {
            pieces.push(piece.to_string());
        }
        i = j;
    }

    pieces
}

/// Split a single word that alone exceeds `max` tokens.
fn split_chars(word: &str, max: usize, counter: &dyn TokenCounter) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = word;

    while !rest.is_empty() {
        let first = first_char_len(rest);
        let mut end = snap_to_char_boundary(rest, (max * 4).max(first));
        while end > first && counter.count(&rest[..end]) > max {
            end = snap_to_char_boundary(rest, end * 3 / 4).max(first);
        }
        pieces.push(rest[..end].to_string());
        rest = &rest[end..];
    }

    pieces
}

/// The longest word-aligned suffix of `text` within `overlap` tokens.
fn overlap_suffix<'a>(text: &'a str, overlap: usize, counter: &dyn TokenCounter) -> Option<&'a str> {
    if overlap == 0 {
        return None;
    }

    let mut best = None;
    for (start, _) in word_spans(text).into_iter().rev() {
        if counter.count(&text[start..]) <= overlap {
            best = Some(&text[start..]);
        } else {
            break;
        }
    }
    best
}

/// Byte spans of whitespace-separated words.
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }

    spans
}

fn first_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(0)
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
