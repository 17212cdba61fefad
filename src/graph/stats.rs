//! Store statistics and per-node graph views.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;

use crate::error::StoreError;
use crate::graph::types::Neighbor;
use crate::graph::{store, truncate_preview};

/// Response from the stats endpoint.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub nodes: u64,
    pub edges: u64,
    pub entities: u64,
    pub nodes_by_category: HashMap<String, u64>,
    pub edges_by_type: HashMap<String, u64>,
    pub top_pagerank: Vec<PagerankEntry>,
    pub communities: u64,
}

#[derive(Debug, Serialize)]
pub struct PagerankEntry {
    pub id: i64,
    pub pagerank: f64,
    pub preview: String,
}

/// Aggregate counts across the store.
pub fn stats(conn: &Connection) -> Result<StatsResponse, StoreError> {
    let count = |sql: &str| -> Result<u64, StoreError> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    };

    let nodes = count("SELECT COUNT(*) FROM nodes")?;
    let edges = count("SELECT COUNT(*) FROM edges")?;
    let entities = count("SELECT COUNT(*) FROM entities")?;
    let communities =
        count("SELECT COUNT(DISTINCT community_id) FROM nodes WHERE community_id IS NOT NULL")?;

    let mut nodes_by_category = HashMap::new();
    let mut stmt = conn.prepare("SELECT category, COUNT(*) FROM nodes GROUP BY category")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (category, n) in rows {
        nodes_by_category.insert(category, n as u64);
    }

    let mut edges_by_type = HashMap::new();
    let mut stmt = conn.prepare("SELECT edge_type, COUNT(*) FROM edges GROUP BY edge_type")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (edge_type, n) in rows {
        edges_by_type.insert(edge_type, n as u64);
    }

    let mut stmt = conn.prepare(
        "SELECT id, pagerank, content FROM nodes ORDER BY pagerank DESC, id LIMIT 10",
    )?;
    let top_pagerank = stmt
        .query_map([], |row| {
            let content: String = row.get(2)?;
            Ok(PagerankEntry {
                id: row.get(0)?,
                pagerank: row.get(1)?,
                preview: truncate_preview(&content, 80),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StatsResponse {
        nodes,
        edges,
        entities,
        nodes_by_category,
        edges_by_type,
        top_pagerank,
        communities,
    })
}

/// Neighborhood view of one node.
#[derive(Debug, Serialize)]
pub struct NodeGraph {
    pub id: i64,
    pub preview: String,
    pub category: String,
    pub neighbors: Vec<NeighborView>,
}

#[derive(Debug, Serialize)]
pub struct NeighborView {
    #[serde(flatten)]
    pub neighbor: Neighbor,
    pub preview: String,
}

/// The node and its outgoing connections, with content previews.
pub fn get_graph(conn: &Connection, id: i64) -> Result<NodeGraph, StoreError> {
    let node = store::get_node(conn, id)?;
    let mut neighbors = Vec::new();
    for neighbor in store::neighbors(conn, id)? {
        let content: String = conn.query_row(
            "SELECT content FROM nodes WHERE id = ?1",
            params![neighbor.id],
            |row| row.get(0),
        )?;
        neighbors.push(NeighborView {
            preview: truncate_preview(&content, 100),
            neighbor,
        });
    }

    Ok(NodeGraph {
        id: node.id,
        preview: truncate_preview(&node.content, 100),
        category: node.category,
        neighbors,
    })
}
