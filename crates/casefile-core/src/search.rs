//! Hybrid retrieval: cosine ranking and BM25 fused with Reciprocal Rank Fusion.
//!
//! # Algorithm
//!
//! 1. Load the ready, in-scope chunks from the [`Store`] in
//!    `(document ordinal, chunk_index)` order. A chunk's position in this
//!    list is its *ordinal* and the tie-breaker everywhere below.
//! 2. Embed the query once.
//! 3. Vector list: cosine similarity against every chunk, top
//!    `vector_candidates`.
//! 4. Lexical list: BM25 over every chunk's embeddable text, rebuilt per
//!    query, top `lexical_candidates`. Zero-score chunks are left out.
//! 5. Fuse: a chunk at 1-indexed rank `r` in a list contributes
//!    `1 / (rrf_k + r)`. Sort by fused score, ties by ordinal.
//! 6. Truncate to `final_limit`.
//!
//! Every step is deterministic, so identical inputs yield identical output.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::bm25::Bm25Index;
use crate::embedding::{cosine_similarity, embed_query, Embedder};
use crate::error::Result;
use crate::models::ScopedChunk;
use crate::store::Store;

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    pub vector_candidates: usize,
    pub lexical_candidates: usize,
    pub rrf_k: f64,
    pub final_limit: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            vector_candidates: 20,
            lexical_candidates: 20,
            rrf_k: 60.0,
            final_limit: 10,
        }
    }
}

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub conversation_id: &'a str,
    /// Restrict to these documents; `None` searches the whole conversation.
    pub document_ids: Option<&'a [String]>,
    pub query: &'a str,
    pub params: RetrievalParams,
}

/// One fused result. At most one per chunk per query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub document_label: String,
    pub filename: String,
    pub chunk_index: i64,
    pub page_number: u32,
    pub section: Option<String>,
    pub text: String,
    pub context: String,
    /// 1-indexed rank in the vector list, if present.
    pub vector_rank: Option<usize>,
    /// 1-indexed rank in the lexical list, if present.
    pub lexical_rank: Option<usize>,
    pub score: f64,
}

/// Run a hybrid search against a [`Store`] backend.
///
/// An empty query or an empty scope returns no hits without calling the
/// embedder.
pub async fn hybrid_search<S, E>(
    store: &S,
    embedder: &E,
    req: &SearchRequest<'_>,
) -> Result<Vec<SearchHit>>
where
    S: Store + ?Sized,
    E: Embedder + ?Sized,
{
    if req.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chunks = store
        .scoped_chunks(req.conversation_id, req.document_ids)
        .await?;
    if chunks.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = embed_query(embedder, req.query).await?;
    Ok(rank_chunks(req.query, &query_vec, &chunks, &req.params))
}

/// Rank already-loaded chunks. Pure and deterministic.
pub fn rank_chunks(
    query: &str,
    query_vec: &[f32],
    chunks: &[ScopedChunk],
    params: &RetrievalParams,
) -> Vec<SearchHit> {
    let vector = rank_by_vector(query_vec, chunks, params.vector_candidates);
    let lexical = rank_by_bm25(query, chunks, params.lexical_candidates);

    let vector_ranks = rank_lookup(&vector);
    let lexical_ranks = rank_lookup(&lexical);

    let mut fused = rrf_fuse(&[vector.as_slice(), lexical.as_slice()], params.rrf_k);
    fused.truncate(params.final_limit);

    debug!(
        vector_candidates = vector.len(),
        lexical_candidates = lexical.len(),
        returned = fused.len(),
        "hybrid search fused"
    );

    fused
        .into_iter()
        .map(|(ordinal, score)| {
            let sc = &chunks[ordinal];
            SearchHit {
                chunk_id: sc.chunk.id.clone(),
                document_id: sc.chunk.document_id.clone(),
                document_label: sc.document_label.clone(),
                filename: sc.filename.clone(),
                chunk_index: sc.chunk.chunk_index,
                page_number: sc.chunk.page_number,
                section: sc.chunk.section.clone(),
                text: sc.chunk.text.clone(),
                context: sc.chunk.context.clone(),
                vector_rank: vector_ranks.get(&ordinal).copied(),
                lexical_rank: lexical_ranks.get(&ordinal).copied(),
                score,
            }
        })
        .collect()
}

/// Ordinals of the `limit` chunks most similar to `query_vec`.
pub fn rank_by_vector(query_vec: &[f32], chunks: &[ScopedChunk], limit: usize) -> Vec<usize> {
    let scores: Vec<f64> = chunks
        .iter()
        .map(|c| cosine_similarity(query_vec, &c.embedding) as f64)
        .collect();
    top_ordinals(&scores, limit, false)
}

/// Ordinals of the `limit` best BM25 matches with a positive score.
pub fn rank_by_bm25(query: &str, chunks: &[ScopedChunk], limit: usize) -> Vec<usize> {
    let texts: Vec<String> = chunks.iter().map(|c| c.chunk.embeddable_text()).collect();
    let scores = Bm25Index::new(&texts).scores(query);
    top_ordinals(&scores, limit, true)
}

fn top_ordinals(scores: &[f64], limit: usize, positive_only: bool) -> Vec<usize> {
    let mut ordinals: Vec<usize> = (0..scores.len())
        .filter(|&i| !positive_only || scores[i] > 0.0)
        .collect();
    ordinals.sort_by(|&a, &b| by_score_then_ordinal((a, scores[a]), (b, scores[b])));
    ordinals.truncate(limit);
    ordinals
}

/// Descending score, then ascending ordinal. NaN sorts last.
fn by_score_then_ordinal(a: (usize, f64), b: (usize, f64)) -> Ordering {
    let sa = if a.1.is_nan() { f64::NEG_INFINITY } else { a.1 };
    let sb = if b.1.is_nan() { f64::NEG_INFINITY } else { b.1 };
    sb.total_cmp(&sa).then(a.0.cmp(&b.0))
}

fn rank_lookup(list: &[usize]) -> BTreeMap<usize, usize> {
    list.iter()
        .enumerate()
        .map(|(i, &ordinal)| (ordinal, i + 1))
        .collect()
}

/// Fuse ranked lists of ordinals with Reciprocal Rank Fusion.
///
/// Each list is ordered best first; rank is 1-indexed. Returns
/// `(ordinal, score)` sorted by score descending, ordinal ascending.
pub fn rrf_fuse(lists: &[&[usize]], k: f64) -> Vec<(usize, f64)> {
    let mut scores: BTreeMap<usize, f64> = BTreeMap::new();
    for list in lists {
        for (i, &ordinal) in list.iter().enumerate() {
            *scores.entry(ordinal).or_insert(0.0) += 1.0 / (k + (i + 1) as f64);
        }
    }

    let mut fused: Vec<(usize, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| by_score_then_ordinal(*a, *b));
    fused
}
