//! Nearest-neighbour index over node embeddings, backed by sqlite-vec.
//!
//! The `nodes_vec` vec0 virtual table lives in the same database file as the
//! nodes table, so index updates commit atomically with node writes: the set
//! of indexed ids can never drift from the set of stored nodes. KNN queries
//! return L2 distance over unit vectors, converted to cosine similarity here.

use rusqlite::{params, Connection};

use crate::error::StoreError;
use crate::graph::{embedding_to_bytes, is_unit_norm, l2_distance_to_cosine};

pub struct AnnIndex {
    dim: usize,
}

impl AnnIndex {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dimensions(&self) -> usize {
        self.dim
    }

    /// Add a vector for a node id.
    ///
    /// Rejects wrong-dimension or non-unit vectors with
    /// `StoreError::IntegrityViolation` so the enclosing transaction rolls
    /// back and no partial index state survives.
    pub fn add(&self, conn: &Connection, id: i64, vector: &[f32]) -> Result<(), StoreError> {
        if vector.len() != self.dim {
            return Err(StoreError::IntegrityViolation(format!(
                "embedding for node {id} has {} dimensions, expected {}",
                vector.len(),
                self.dim
            )));
        }
        if !is_unit_norm(vector, 1e-4) {
            return Err(StoreError::IntegrityViolation(format!(
                "embedding for node {id} is not unit-normalized"
            )));
        }
        conn.execute(
            "INSERT INTO nodes_vec (id, embedding) VALUES (?1, ?2)",
            params![id, embedding_to_bytes(vector)],
        )?;
        Ok(())
    }

    /// Replace the vector for a node id.
    pub fn replace(&self, conn: &Connection, id: i64, vector: &[f32]) -> Result<(), StoreError> {
        self.remove(conn, id)?;
        self.add(conn, id, vector)
    }

    /// Remove a node's vector. Removing a missing id is a no-op.
    pub fn remove(&self, conn: &Connection, id: i64) -> Result<(), StoreError> {
        conn.execute("DELETE FROM nodes_vec WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// K-nearest-neighbour search. Returns `(id, cosine_similarity)` pairs,
    /// best first. Fewer than `k` results is not an error.
    pub fn search(
        &self,
        conn: &Connection,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(i64, f64)>, StoreError> {
        if k == 0 || self.count(conn)? == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(
            "SELECT id, distance FROM nodes_vec \
             WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![embedding_to_bytes(vector), k as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, dist)| (id, l2_distance_to_cosine(dist)))
            .collect())
    }

    /// Like [`Self::search`], keeping only hits at or above `min_similarity`.
    pub fn search_min(
        &self,
        conn: &Connection,
        vector: &[f32],
        k: usize,
        min_similarity: f64,
    ) -> Result<Vec<(i64, f64)>, StoreError> {
        let mut hits = self.search(conn, vector, k)?;
        hits.retain(|(_, sim)| *sim >= min_similarity);
        Ok(hits)
    }

    /// Number of indexed vectors.
    pub fn count(&self, conn: &Connection) -> Result<i64, StoreError> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes_vec", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Repopulate the index from the nodes table. Used at startup when the
    /// persisted index disagrees with the store (count or model mismatch).
    pub fn rebuild(&self, conn: &Connection) -> Result<usize, StoreError> {
        conn.execute("DELETE FROM nodes_vec", [])?;
        let rows = crate::graph::store::all_embeddings(conn)?;
        let mut added = 0;
        for (id, embedding) in rows {
            if embedding.len() != self.dim {
                tracing::warn!(node = id, "skipping embedding with wrong dimension");
                continue;
            }
            conn.execute(
                "INSERT INTO nodes_vec (id, embedding) VALUES (?1, ?2)",
                params![id, embedding_to_bytes(&embedding)],
            )?;
            added += 1;
        }
        tracing::info!(vectors = added, "ANN index rebuilt");
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::services::EMBEDDING_DIM;

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    fn spike(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    #[test]
    fn add_and_search_returns_nearest_first() {
        let conn = test_db();
        let ann = AnnIndex::new(EMBEDDING_DIM);

        ann.add(&conn, 1, &spike(0)).unwrap();
        ann.add(&conn, 2, &spike(100)).unwrap();

        let hits = ann.search(&conn, &spike(0), 10).unwrap();
        assert_eq!(hits[0].0, 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        // orthogonal vector scores ~0
        let other = hits.iter().find(|(id, _)| *id == 2).unwrap();
        assert!(other.1.abs() < 1e-5);
    }

    #[test]
    fn fewer_than_k_is_not_an_error() {
        let conn = test_db();
        let ann = AnnIndex::new(EMBEDDING_DIM);
        ann.add(&conn, 1, &spike(3)).unwrap();

        let hits = ann.search(&conn, &spike(3), 50).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn empty_index_returns_empty() {
        let conn = test_db();
        let ann = AnnIndex::new(EMBEDDING_DIM);
        assert!(ann.search(&conn, &spike(0), 5).unwrap().is_empty());
    }

    #[test]
    fn wrong_dimension_rejected() {
        let conn = test_db();
        let ann = AnnIndex::new(EMBEDDING_DIM);
        let short = vec![1.0f32; 8];
        match ann.add(&conn, 1, &short) {
            Err(StoreError::IntegrityViolation(_)) => {}
            other => panic!("expected IntegrityViolation, got {other:?}"),
        }
    }

    #[test]
    fn non_unit_vector_rejected() {
        let conn = test_db();
        let ann = AnnIndex::new(EMBEDDING_DIM);
        let mut v = spike(0);
        v[0] = 2.0;
        assert!(ann.add(&conn, 1, &v).is_err());
    }

    #[test]
    fn remove_then_search_excludes_id() {
        let conn = test_db();
        let ann = AnnIndex::new(EMBEDDING_DIM);
        ann.add(&conn, 1, &spike(0)).unwrap();
        ann.add(&conn, 2, &spike(1)).unwrap();
        ann.remove(&conn, 1).unwrap();

        let hits = ann.search(&conn, &spike(0), 10).unwrap();
        assert!(hits.iter().all(|(id, _)| *id != 1));
        assert_eq!(ann.count(&conn).unwrap(), 1);
    }

    #[test]
    fn search_min_filters_by_similarity() {
        let conn = test_db();
        let ann = AnnIndex::new(EMBEDDING_DIM);
        ann.add(&conn, 1, &spike(0)).unwrap();
        ann.add(&conn, 2, &spike(50)).unwrap();

        let hits = ann.search_min(&conn, &spike(0), 10, 0.5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn rebuild_repopulates_from_nodes_table() {
        let conn = test_db();
        let ann = AnnIndex::new(EMBEDDING_DIM);

        let emb = spike(4);
        conn.execute(
            "INSERT INTO nodes (content, created_at, embedding) VALUES ('a', '2026-01-01T00:00:00+00:00', ?1)",
            params![crate::graph::embedding_to_bytes(&emb)],
        )
        .unwrap();

        assert_eq!(ann.count(&conn).unwrap(), 0);
        let added = ann.rebuild(&conn).unwrap();
        assert_eq!(added, 1);
        assert_eq!(ann.count(&conn).unwrap(), 1);
    }
}
