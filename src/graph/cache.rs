//! In-memory projections of the graph: adjacency and embeddings.
//!
//! Both caches are rebuilt from the store at startup and mutated in lock-step
//! with store writes. They hold only ids and derived state — no owning
//! references between nodes; all traversal goes through these projections or
//! the store itself.

use rusqlite::Connection;
use std::collections::HashMap;

use crate::error::StoreError;
use crate::graph::types::{Edge, EdgeKind};

/// Directed adjacency over the edge rows.
///
/// `out` mirrors edge rows exactly (paired kinds appear in both directions
/// because they are stored as two rows); `incoming` is the reverse index used
/// by PageRank.
#[derive(Default)]
pub struct GraphCache {
    out: HashMap<i64, Vec<(i64, f64, EdgeKind)>>,
    incoming: HashMap<i64, Vec<(i64, f64)>>,
    edge_rows: usize,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an edge list, replacing any previous contents.
    pub fn build(&mut self, edges: &[Edge]) {
        self.out.clear();
        self.incoming.clear();
        self.edge_rows = 0;
        for e in edges {
            self.add_edge(e.source_id, e.target_id, e.weight, e.kind.clone());
        }
    }

    /// Rebuild from the database.
    pub fn rebuild(&mut self, conn: &Connection) -> Result<usize, StoreError> {
        let edges = crate::graph::store::all_edges(conn)?;
        self.build(&edges);
        tracing::debug!(edges = self.edge_rows, "graph cache rebuilt");
        Ok(self.edge_rows)
    }

    /// Outgoing edges of a node.
    pub fn neighbors(&self, id: i64) -> &[(i64, f64, EdgeKind)] {
        self.out.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Incoming `(source, weight)` pairs of a node.
    pub fn incoming(&self, id: i64) -> &[(i64, f64)] {
        self.incoming.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sum of outgoing edge weights, for PageRank normalization.
    pub fn out_weight(&self, id: i64) -> f64 {
        self.neighbors(id).iter().map(|(_, w, _)| w).sum()
    }

    /// Insert or refresh one directed edge, mirroring the store's upsert:
    /// an existing (target, kind) entry keeps the higher weight.
    pub fn add_edge(&mut self, source: i64, target: i64, weight: f64, kind: EdgeKind) {
        let entries = self.out.entry(source).or_default();
        if let Some(entry) = entries
            .iter_mut()
            .find(|(t, _, k)| *t == target && *k == kind)
        {
            entry.1 = entry.1.max(weight);
        } else {
            entries.push((target, weight, kind));
            self.edge_rows += 1;
        }

        let rev = self.incoming.entry(target).or_default();
        if let Some(entry) = rev.iter_mut().find(|(s, _)| *s == source) {
            entry.1 = entry.1.max(weight);
        } else {
            rev.push((source, weight));
        }
    }

    pub fn remove_edge(&mut self, source: i64, target: i64, kind: &EdgeKind) {
        if let Some(entries) = self.out.get_mut(&source) {
            let before = entries.len();
            entries.retain(|(t, _, k)| !(*t == target && k == kind));
            self.edge_rows -= before - entries.len();
        }
        // keep the reverse entry only if another edge kind still connects them
        let still_connected = self
            .out
            .get(&source)
            .map(|es| es.iter().any(|(t, _, _)| *t == target))
            .unwrap_or(false);
        if !still_connected {
            if let Some(rev) = self.incoming.get_mut(&target) {
                rev.retain(|(s, _)| *s != source);
            }
        }
    }

    /// Drop a node and every edge touching it.
    pub fn remove_node(&mut self, id: i64) {
        if let Some(entries) = self.out.remove(&id) {
            self.edge_rows -= entries.len();
            for (target, _, _) in entries {
                if let Some(rev) = self.incoming.get_mut(&target) {
                    rev.retain(|(s, _)| *s != id);
                }
            }
        }
        if let Some(rev) = self.incoming.remove(&id) {
            for (source, _) in rev {
                if let Some(entries) = self.out.get_mut(&source) {
                    let before = entries.len();
                    entries.retain(|(t, _, _)| *t != id);
                    self.edge_rows -= before - entries.len();
                }
            }
        }
    }

    /// Number of directed edge rows cached.
    pub fn edge_count(&self) -> usize {
        self.edge_rows
    }

    /// Ids with at least one outgoing or incoming edge.
    pub fn connected_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .out
            .keys()
            .chain(self.incoming.keys())
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Normalized dense vectors keyed by node id.
#[derive(Default)]
pub struct EmbeddingCache {
    vectors: HashMap<i64, Vec<f32>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&mut self, conn: &Connection) -> Result<usize, StoreError> {
        self.vectors = crate::graph::store::all_embeddings(conn)?
            .into_iter()
            .collect();
        Ok(self.vectors.len())
    }

    pub fn insert(&mut self, id: i64, vector: Vec<f32>) {
        self.vectors.insert(id, vector);
    }

    pub fn remove(&mut self, id: i64) {
        self.vectors.remove(&id);
    }

    pub fn get(&self, id: i64) -> Option<&Vec<f32>> {
        self.vectors.get(&id)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Ids in ascending order, for deterministic scans.
    pub fn sorted_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.vectors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
