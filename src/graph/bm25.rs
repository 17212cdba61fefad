//! Okapi BM25 inverted index for keyword scoring.
//!
//! Held in memory and rebuilt from the nodes table at startup; mutated in
//! lock-step with store writes. Scores are raw BM25 — the retriever min-max
//! normalizes them per query before blending. SQLite FTS5 was deliberately
//! not used here: its bm25() ranking does not expose k1/b.

use rusqlite::Connection;
use std::collections::HashMap;

use crate::error::StoreError;

/// Lowercased alphanumeric tokens. Unicode-aware: any alphanumeric run (plus
/// underscores) is a token.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            for lower in ch.to_lowercase() {
                current.push(lower);
            }
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

pub struct Bm25Index {
    k1: f64,
    b: f64,
    /// term → number of documents containing it
    doc_freqs: HashMap<String, usize>,
    /// node id → term frequencies
    doc_terms: HashMap<i64, HashMap<String, usize>>,
    /// node id → document length in tokens
    doc_lens: HashMap<i64, usize>,
    total_len: usize,
}

impl Bm25Index {
    pub fn new(k1: f64, b: f64) -> Self {
        Self {
            k1,
            b,
            doc_freqs: HashMap::new(),
            doc_terms: HashMap::new(),
            doc_lens: HashMap::new(),
            total_len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_terms.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.doc_terms.contains_key(&id)
    }

    pub fn vocab_size(&self) -> usize {
        self.doc_freqs.len()
    }

    /// Add (or replace) a document.
    pub fn add(&mut self, id: i64, text: &str) {
        if self.contains(id) {
            self.remove(id);
        }
        let tokens = tokenize(text);
        let mut tf: HashMap<String, usize> = HashMap::new();
        for token in &tokens {
            *tf.entry(token.clone()).or_insert(0) += 1;
        }
        for term in tf.keys() {
            *self.doc_freqs.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_len += tokens.len();
        self.doc_lens.insert(id, tokens.len());
        self.doc_terms.insert(id, tf);
    }

    /// Remove a document, reversing its postings. Missing ids are a no-op.
    pub fn remove(&mut self, id: i64) {
        let Some(tf) = self.doc_terms.remove(&id) else {
            return;
        };
        for term in tf.keys() {
            if let Some(df) = self.doc_freqs.get_mut(term) {
                *df -= 1;
                if *df == 0 {
                    self.doc_freqs.remove(term);
                }
            }
        }
        if let Some(len) = self.doc_lens.remove(&id) {
            self.total_len -= len;
        }
    }

    /// Ids of all indexed documents.
    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.doc_terms.keys().copied()
    }

    /// Score all documents against the query. Returns the top `k`
    /// `(id, bm25_score)` pairs with score > 0, best first. Scores are not
    /// normalized.
    pub fn search(&self, query: &str, k: usize) -> Vec<(i64, f64)> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || self.is_empty() {
            return Vec::new();
        }

        let n_docs = self.doc_terms.len() as f64;
        let avg_dl = self.total_len as f64 / n_docs.max(1.0);

        let mut scores: Vec<(i64, f64)> = Vec::new();
        for (&id, tf) in &self.doc_terms {
            let dl = *self.doc_lens.get(&id).unwrap_or(&0) as f64;
            let mut score = 0.0;

            for term in &query_tokens {
                let Some(&freq) = tf.get(term) else {
                    continue;
                };
                let df = *self.doc_freqs.get(term).unwrap_or(&0) as f64;
                // IDF: ln((N - df + 0.5) / (df + 0.5) + 1)
                let idf = ((n_docs - df + 0.5) / (df + 0.5) + 1.0).ln();
                // TF with length normalization
                let freq = freq as f64;
                let tf_norm = (freq * (self.k1 + 1.0))
                    / (freq + self.k1 * (1.0 - self.b + self.b * dl / avg_dl));
                score += idf * tf_norm;
            }

            if score > 0.0 {
                scores.push((id, score));
            }
        }

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scores.truncate(k);
        scores
    }

    /// Rebuild the index from the nodes table.
    pub fn rebuild(&mut self, conn: &Connection) -> Result<usize, StoreError> {
        self.doc_freqs.clear();
        self.doc_terms.clear();
        self.doc_lens.clear();
        self.total_len = 0;

        let mut stmt = conn.prepare("SELECT id, content FROM nodes")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (id, content) in &rows {
            self.add(*id, content);
        }
        tracing::debug!(docs = rows.len(), terms = self.vocab_size(), "BM25 index rebuilt");
        Ok(rows.len())
    }
}
