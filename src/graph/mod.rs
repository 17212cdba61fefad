//! Core engine — graph store, indices, ingestion, retrieval, and maintenance.
//!
//! This module contains the persistent store ([`store`]), the derived indices
//! ([`ann`], [`bm25`], [`cache`]), the temporal model ([`temporal`]), the
//! write path ([`ingest`]), the hybrid read path ([`retriever`]), graph
//! metrics ([`metrics`]), sleep-time maintenance ([`sleep`]), version history
//! ([`versions`]), the search quality log ([`logger`]), and statistics
//! ([`stats`]). Type definitions live in [`types`].

pub mod ann;
pub mod bm25;
pub mod cache;
pub mod ingest;
pub mod logger;
pub mod metrics;
pub mod retriever;
pub mod sleep;
pub mod stats;
pub mod store;
pub mod temporal;
pub mod types;
pub mod versions;

use cache::{EmbeddingCache, GraphCache};

/// The in-memory derived indices, mutated in lock-step with store writes and
/// rebuilt wholesale from the database after a snapshot restore.
pub struct Indices {
    pub ann: ann::AnnIndex,
    pub bm25: bm25::Bm25Index,
    pub graph: GraphCache,
    pub vectors: EmbeddingCache,
}

impl Indices {
    /// Rebuild every index from the database.
    pub fn rebuild(&mut self, conn: &rusqlite::Connection) -> Result<(), crate::error::StoreError> {
        self.ann.rebuild(conn)?;
        self.bm25.rebuild(conn)?;
        self.graph.rebuild(conn)?;
        self.vectors.rebuild(conn)?;
        Ok(())
    }
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert raw little-endian bytes back to an f32 embedding.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// Convert a cosine similarity threshold to an L2 distance threshold.
///
/// sqlite-vec computes L2 distance. For L2-normalized vectors:
///   L2_dist = sqrt(2 * (1 - cosine_similarity))
pub fn cosine_threshold_to_l2(cosine_threshold: f64) -> f64 {
    (2.0 * (1.0 - cosine_threshold)).sqrt()
}

/// Inverse of [`cosine_threshold_to_l2`]: L2 distance between unit vectors to
/// cosine similarity.
pub fn l2_distance_to_cosine(distance: f64) -> f64 {
    1.0 - (distance * distance) / 2.0
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// L2-normalize a vector in place. A zero vector is left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Whether a vector has unit L2 norm within `tol`.
pub fn is_unit_norm(v: &[f32], tol: f64) -> bool {
    let norm: f64 = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>();
    (norm.sqrt() - 1.0).abs() <= tol
}

/// Truncate content to `max_chars`, appending "..." if truncated. Respects
/// char boundaries.
pub fn truncate_preview(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        content.to_string()
    } else {
        let end = content
            .char_indices()
            .take_while(|(i, _)| *i < max_chars)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max_chars);
        format!("{}...", &content[..end])
    }
}
