//! Okapi BM25 over an in-memory corpus.
//!
//! The corpus is small (one conversation's chunks), so the index is
//! rebuilt for every query rather than persisted.
//!
//! ```text
//! score(q, d) = Σ idf(t) · tf(t,d)·(k1+1) / (tf(t,d) + k1·(1 - b + b·|d|/avgdl))
//! idf(t)      = ln((N - df(t) + 0.5) / (df(t) + 0.5) + 1)
//! ```
//!
//! The `+ 1` inside the logarithm keeps IDF positive, so a term present
//! in every chunk still contributes a small positive score.

use std::collections::HashMap;

/// Term-frequency saturation.
pub const DEFAULT_K1: f64 = 1.5;
/// Length normalization strength.
pub const DEFAULT_B: f64 = 0.75;

/// Lowercase and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// A BM25 index over a fixed list of documents.
#[derive(Debug)]
pub struct Bm25Index {
    term_freqs: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    doc_freq: HashMap<String, usize>,
    avgdl: f64,
    k1: f64,
    b: f64,
}

impl Bm25Index {
    pub fn new<S: AsRef<str>>(docs: &[S]) -> Self {
        Self::with_params(docs, DEFAULT_K1, DEFAULT_B)
    }

    pub fn with_params<S: AsRef<str>>(docs: &[S], k1: f64, b: f64) -> Self {
        let mut term_freqs = Vec::with_capacity(docs.len());
        let mut doc_lens = Vec::with_capacity(docs.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for doc in docs {
            let tokens = tokenize(doc.as_ref());
            doc_lens.push(tokens.len());
            let mut tf: HashMap<String, usize> = HashMap::new();
            for t in tokens {
                *tf.entry(t).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            term_freqs.push(tf);
        }

        let total: usize = doc_lens.iter().sum();
        let avgdl = if doc_lens.is_empty() {
            0.0
        } else {
            total as f64 / doc_lens.len() as f64
        };

        Self {
            term_freqs,
            doc_lens,
            doc_freq,
            avgdl,
            k1,
            b,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.len() as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Score every document against `query`, in corpus order.
    ///
    /// Repeated query terms count once.
    pub fn scores(&self, query: &str) -> Vec<f64> {
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();

        let idfs: Vec<(String, f64)> = terms
            .into_iter()
            .filter(|t| self.doc_freq.contains_key(t))
            .map(|t| {
                let idf = self.idf(&t);
                (t, idf)
            })
            .collect();

        self.term_freqs
            .iter()
            .zip(self.doc_lens.iter())
            .map(|(tf, &len)| {
                let norm = if self.avgdl > 0.0 {
                    1.0 - self.b + self.b * len as f64 / self.avgdl
                } else {
                    1.0
                };
                idfs.iter()
                    .map(|(term, idf)| {
                        let f = tf.get(term).copied().unwrap_or(0) as f64;
                        if f == 0.0 {
                            0.0
                        } else {
                            idf * f * (self.k1 + 1.0) / (f + self.k1 * norm)
                        }
                    })
                    .sum()
            })
            .collect()
    }
}
