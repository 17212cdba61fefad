//! Persistent graph store — node, edge, and entity primitives.
//!
//! All functions operate on a borrowed [`Connection`] so the write path can
//! compose them inside a single transaction ([`rusqlite::Transaction`] derefs
//! to `Connection`). Mutations that span tables open their own transaction.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::StoreError;
use crate::graph::types::{Edge, EdgeKind, Importance, Neighbor, Node};
use crate::graph::{bytes_to_embedding, embedding_to_bytes};

/// Current UTC timestamp in the store's canonical format.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

const NODE_COLUMNS: &str = "id, content, category, importance, created_at, last_accessed, \
     access_count, emotional_tone, emotional_intensity, emotional_reflection, \
     t_event_start, t_event_end, pagerank, community_id";

/// Fields for a new node row. The embedding is stored alongside the node and
/// mirrored into the vec0 index by the caller.
pub struct NewNode<'a> {
    pub content: &'a str,
    pub category: &'a str,
    pub importance: Importance,
    pub emotional_tone: Option<&'a str>,
    pub emotional_intensity: i64,
    pub emotional_reflection: Option<&'a str>,
    pub t_event_start: Option<String>,
    pub t_event_end: Option<String>,
    pub embedding: &'a [f32],
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let importance: String = row.get(3)?;
    Ok(Node {
        id: row.get(0)?,
        content: row.get(1)?,
        category: row.get(2)?,
        importance: Importance::from_str(&importance).unwrap_or(Importance::Normal),
        created_at: row.get(4)?,
        last_accessed: row.get(5)?,
        access_count: row.get(6)?,
        emotional_tone: row.get(7)?,
        emotional_intensity: row.get(8)?,
        emotional_reflection: row.get(9)?,
        t_event_start: row.get(10)?,
        t_event_end: row.get(11)?,
        pagerank: row.get(12)?,
        community_id: row.get(13)?,
    })
}

/// Insert a new node row. Returns the assigned id.
pub fn insert_node(conn: &Connection, new: &NewNode<'_>) -> Result<i64, StoreError> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO nodes (content, category, importance, created_at, access_count, \
         emotional_tone, emotional_intensity, emotional_reflection, \
         t_event_start, t_event_end, embedding) \
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            new.content,
            new.category,
            new.importance.as_str(),
            now,
            new.emotional_tone,
            new.emotional_intensity,
            new.emotional_reflection,
            new.t_event_start,
            new.t_event_end,
            embedding_to_bytes(new.embedding),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Get a node by id, or `StoreError::NotFound`.
pub fn get_node(conn: &Connection, id: i64) -> Result<Node, StoreError> {
    try_get_node(conn, id)?.ok_or(StoreError::NotFound(id))
}

pub fn try_get_node(conn: &Connection, id: i64) -> Result<Option<Node>, StoreError> {
    let node = conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
            params![id],
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

/// All nodes ordered by id.
pub fn list_nodes(conn: &Connection) -> Result<Vec<Node>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"))?;
    let nodes = stmt
        .query_map([], node_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(nodes)
}

/// Batch-fetch nodes by id.
pub fn fetch_nodes(conn: &Connection, ids: &[i64]) -> Result<HashMap<i64, Node>, StoreError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let sql_params: Vec<&dyn rusqlite::types::ToSql> = ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();
    let rows = stmt
        .query_map(sql_params.as_slice(), node_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|n| (n.id, n)).collect())
}

/// Stored embedding of a node, if any.
pub fn get_embedding(conn: &Connection, id: i64) -> Result<Option<Vec<f32>>, StoreError> {
    let blob: Option<Option<Vec<u8>>> = conn
        .query_row(
            "SELECT embedding FROM nodes WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match blob {
        None => Err(StoreError::NotFound(id)),
        Some(None) => Ok(None),
        Some(Some(bytes)) => Ok(Some(bytes_to_embedding(&bytes))),
    }
}

/// All (id, embedding) pairs, for index rebuilds and the duplicate scan.
pub fn all_embeddings(conn: &Connection) -> Result<Vec<(i64, Vec<f32>)>, StoreError> {
    let mut stmt = conn.prepare("SELECT id, embedding FROM nodes WHERE embedding IS NOT NULL")?;
    let rows = stmt
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            Ok((id, bytes_to_embedding(&bytes)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Replace a node's content and embedding. Bumps nothing else; version
/// snapshots are the caller's concern.
pub fn set_content(
    conn: &Connection,
    id: i64,
    content: &str,
    embedding: &[f32],
) -> Result<(), StoreError> {
    let rows = conn.execute(
        "UPDATE nodes SET content = ?1, embedding = ?2 WHERE id = ?3",
        params![content, embedding_to_bytes(embedding), id],
    )?;
    if rows == 0 {
        return Err(StoreError::NotFound(id));
    }
    Ok(())
}

pub fn set_category(conn: &Connection, id: i64, category: &str) -> Result<(), StoreError> {
    let rows = conn.execute(
        "UPDATE nodes SET category = ?1 WHERE id = ?2",
        params![category, id],
    )?;
    if rows == 0 {
        return Err(StoreError::NotFound(id));
    }
    Ok(())
}

pub fn set_importance(
    conn: &Connection,
    id: i64,
    importance: Importance,
) -> Result<(), StoreError> {
    let rows = conn.execute(
        "UPDATE nodes SET importance = ?1 WHERE id = ?2",
        params![importance.as_str(), id],
    )?;
    if rows == 0 {
        return Err(StoreError::NotFound(id));
    }
    Ok(())
}

/// Update `last_accessed` and bump `access_count` for the given nodes.
pub fn touch_nodes(conn: &Connection, ids: &[i64]) -> Result<(), StoreError> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = now_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE nodes SET last_accessed = ?1, access_count = access_count + 1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![now, id])?;
    }
    Ok(())
}

// ── Edges ────────────────────────────────────────────────────────────────────

/// Insert or refresh one directed edge row.
///
/// Idempotent on (source, target, type): a repeated add keeps the higher
/// weight and refreshes `last_touched_at`, never duplicating rows.
pub fn add_edge(
    conn: &Connection,
    source_id: i64,
    target_id: i64,
    weight: f64,
    kind: &EdgeKind,
) -> Result<(), StoreError> {
    if source_id == target_id {
        return Err(StoreError::IntegrityViolation(format!(
            "self-edge on node {source_id}"
        )));
    }
    if !(0.0..=1.0).contains(&weight) {
        return Err(StoreError::IntegrityViolation(format!(
            "edge weight {weight} outside [0,1]"
        )));
    }
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO edges (source_id, target_id, edge_type, weight, created_at, last_touched_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
         ON CONFLICT(source_id, target_id, edge_type) \
         DO UPDATE SET weight = MAX(weight, excluded.weight), last_touched_at = excluded.last_touched_at",
        params![source_id, target_id, kind.as_str(), weight, now],
    )?;
    Ok(())
}

/// Insert a mirrored pair of edges of equal weight. Panics in debug builds if
/// the kind is not a paired kind.
pub fn add_paired_edge(
    conn: &Connection,
    a: i64,
    b: i64,
    weight: f64,
    kind: &EdgeKind,
) -> Result<(), StoreError> {
    debug_assert!(kind.is_paired());
    add_edge(conn, a, b, weight, kind)?;
    add_edge(conn, b, a, weight, kind)?;
    Ok(())
}

/// Remove one directed edge row. Removing a missing edge is a no-op.
pub fn remove_edge(
    conn: &Connection,
    source_id: i64,
    target_id: i64,
    kind: &EdgeKind,
) -> Result<bool, StoreError> {
    let rows = conn.execute(
        "DELETE FROM edges WHERE source_id = ?1 AND target_id = ?2 AND edge_type = ?3",
        params![source_id, target_id, kind.as_str()],
    )?;
    Ok(rows > 0)
}

/// Outgoing neighbors of a node.
pub fn neighbors(conn: &Connection, id: i64) -> Result<Vec<Neighbor>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT target_id, weight, edge_type FROM edges WHERE source_id = ?1 ORDER BY weight DESC",
    )?;
    let rows = stmt
        .query_map(params![id], |row| {
            let kind: String = row.get(2)?;
            Ok(Neighbor {
                id: row.get(0)?,
                weight: row.get(1)?,
                kind: EdgeKind::parse(&kind),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All edge rows, for cache rebuilds and PageRank.
pub fn all_edges(conn: &Connection) -> Result<Vec<Edge>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT source_id, target_id, edge_type, weight, created_at, last_touched_at FROM edges",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let kind: String = row.get(2)?;
            Ok(Edge {
                source_id: row.get(0)?,
                target_id: row.get(1)?,
                kind: EdgeKind::parse(&kind),
                weight: row.get(3)?,
                created_at: row.get(4)?,
                last_touched_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Entities ─────────────────────────────────────────────────────────────────

/// Canonical form of an entity surface: lowercase, trimmed, single spaces.
pub fn canonicalize_entity(surface: &str) -> String {
    surface
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Get or create the canonical entity for a surface form. Returns its id.
pub fn upsert_entity(
    conn: &Connection,
    surface: &str,
    entity_type: &str,
) -> Result<i64, StoreError> {
    let name = canonicalize_entity(surface);
    if name.is_empty() {
        return Err(StoreError::IntegrityViolation("empty entity name".into()));
    }
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM entities WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO entities (name, entity_type) VALUES (?1, ?2)",
        params![name, entity_type],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Link a node to an entity. Returns false if the link already existed.
pub fn link_entity(conn: &Connection, node_id: i64, entity_id: i64) -> Result<bool, StoreError> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO node_entities (node_id, entity_id) VALUES (?1, ?2)",
        params![node_id, entity_id],
    )?;
    Ok(rows > 0)
}

/// Remove all entity links for a node (before re-extraction on update).
pub fn unlink_all_entities(conn: &Connection, node_id: i64) -> Result<usize, StoreError> {
    let rows = conn.execute(
        "DELETE FROM node_entities WHERE node_id = ?1",
        params![node_id],
    )?;
    Ok(rows)
}

/// Ids of all nodes linked to an entity.
pub fn nodes_for_entity(conn: &Connection, entity_id: i64) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare("SELECT node_id FROM node_entities WHERE entity_id = ?1")?;
    let rows = stmt
        .query_map(params![entity_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Number of entities shared between two nodes.
pub fn shared_entity_count(conn: &Connection, a: i64, b: i64) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM node_entities x JOIN node_entities y \
         ON x.entity_id = y.entity_id WHERE x.node_id = ?1 AND y.node_id = ?2",
        params![a, b],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Entity count per node, for the hub penalty.
pub fn entity_counts(conn: &Connection) -> Result<HashMap<i64, usize>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT node_id, COUNT(*) FROM node_entities GROUP BY node_id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as usize))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

/// Whether a node is linked to at least one entity of the given type.
pub fn node_has_entity_type(
    conn: &Connection,
    node_id: i64,
    entity_type: &str,
) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM node_entities ne JOIN entities e ON ne.entity_id = e.id \
             WHERE ne.node_id = ?1 AND e.entity_type = ?2 LIMIT 1",
            params![node_id, entity_type],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Entity name → node ids index, used by the deep-sleep relation pass.
pub fn entity_name_index(conn: &Connection) -> Result<HashMap<String, Vec<i64>>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT e.name, ne.node_id FROM node_entities ne JOIN entities e ON ne.entity_id = e.id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut index: HashMap<String, Vec<i64>> = HashMap::new();
    for (name, node_id) in rows {
        let entry = index.entry(name).or_default();
        if !entry.contains(&node_id) {
            entry.push(node_id);
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_db() -> Connection {
        db::open_memory_database().unwrap()
    }

    fn spike(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; crate::services::EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    fn insert(conn: &Connection, content: &str, category: &str, dim: usize) -> i64 {
        insert_node(
            conn,
            &NewNode {
                content,
                category,
                importance: Importance::Normal,
                emotional_tone: None,
                emotional_intensity: 5,
                emotional_reflection: None,
                t_event_start: None,
                t_event_end: None,
                embedding: &spike(dim),
            },
        )
        .unwrap()
    }

    #[test]
    fn insert_and_get_node() {
        let conn = test_db();
        let id = insert(&conn, "Python debugging with pdb", "technical", 0);
        let node = get_node(&conn, id).unwrap();
        assert_eq!(node.content, "Python debugging with pdb");
        assert_eq!(node.category, "technical");
        assert_eq!(node.importance, Importance::Normal);
        assert_eq!(node.access_count, 0);
        assert!(node.last_accessed.is_none());
    }

    #[test]
    fn ids_are_monotonic() {
        let conn = test_db();
        let a = insert(&conn, "first", "general", 0);
        let b = insert(&conn, "second", "general", 1);
        assert!(b > a);
    }

    #[test]
    fn get_missing_node_is_not_found() {
        let conn = test_db();
        match get_node(&conn, 999) {
            Err(StoreError::NotFound(999)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn embedding_roundtrip() {
        let conn = test_db();
        let id = insert(&conn, "note", "general", 7);
        let emb = get_embedding(&conn, id).unwrap().unwrap();
        assert_eq!(emb.len(), crate::services::EMBEDDING_DIM);
        assert_eq!(emb[7], 1.0);
    }

    #[test]
    fn add_edge_is_idempotent_and_max_merges() {
        let conn = test_db();
        let a = insert(&conn, "a", "general", 0);
        let b = insert(&conn, "b", "general", 1);

        add_edge(&conn, a, b, 0.4, &EdgeKind::Semantic).unwrap();
        add_edge(&conn, a, b, 0.8, &EdgeKind::Semantic).unwrap();
        add_edge(&conn, a, b, 0.2, &EdgeKind::Semantic).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM edges", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let weight: f64 = conn
            .query_row("SELECT weight FROM edges", [], |r| r.get(0))
            .unwrap();
        assert_eq!(weight, 0.8);
    }

    #[test]
    fn paired_edge_creates_mirrored_rows() {
        let conn = test_db();
        let a = insert(&conn, "a", "general", 0);
        let b = insert(&conn, "b", "general", 1);

        add_paired_edge(&conn, a, b, 0.7, &EdgeKind::Entity).unwrap();

        let edges = all_edges(&conn).unwrap();
        assert_eq!(edges.len(), 2);
        let forward = edges.iter().find(|e| e.source_id == a).unwrap();
        let reverse = edges.iter().find(|e| e.source_id == b).unwrap();
        assert_eq!(forward.weight, reverse.weight);
        assert_eq!(forward.kind, reverse.kind);
    }

    #[test]
    fn edge_weight_out_of_range_rejected() {
        let conn = test_db();
        let a = insert(&conn, "a", "general", 0);
        let b = insert(&conn, "b", "general", 1);
        match add_edge(&conn, a, b, 1.2, &EdgeKind::Semantic) {
            Err(StoreError::IntegrityViolation(_)) => {}
            other => panic!("expected IntegrityViolation, got {other:?}"),
        }
    }

    #[test]
    fn self_edge_rejected() {
        let conn = test_db();
        let a = insert(&conn, "a", "general", 0);
        assert!(add_edge(&conn, a, a, 0.5, &EdgeKind::Semantic).is_err());
    }

    #[test]
    fn entity_canonicalization() {
        assert_eq!(canonicalize_entity("  John   Smith "), "john smith");
        assert_eq!(canonicalize_entity("PyTorch"), "pytorch");
    }

    #[test]
    fn upsert_entity_dedups_by_canonical_name() {
        let conn = test_db();
        let a = upsert_entity(&conn, "John Smith", "person").unwrap();
        let b = upsert_entity(&conn, "  john  smith", "person").unwrap();
        assert_eq!(a, b);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn entity_links_and_counts() {
        let conn = test_db();
        let n1 = insert(&conn, "a", "general", 0);
        let n2 = insert(&conn, "b", "general", 1);
        let e1 = upsert_entity(&conn, "rust", "tech").unwrap();
        let e2 = upsert_entity(&conn, "python", "tech").unwrap();

        assert!(link_entity(&conn, n1, e1).unwrap());
        assert!(!link_entity(&conn, n1, e1).unwrap()); // idempotent
        link_entity(&conn, n1, e2).unwrap();
        link_entity(&conn, n2, e1).unwrap();

        let counts = entity_counts(&conn).unwrap();
        assert_eq!(counts[&n1], 2);
        assert_eq!(counts[&n2], 1);

        assert_eq!(shared_entity_count(&conn, n1, n2).unwrap(), 1);
        assert!(node_has_entity_type(&conn, n1, "tech").unwrap());
        assert!(!node_has_entity_type(&conn, n1, "person").unwrap());
    }

    #[test]
    fn touch_updates_access_tracking() {
        let conn = test_db();
        let id = insert(&conn, "a", "general", 0);
        touch_nodes(&conn, &[id]).unwrap();
        touch_nodes(&conn, &[id]).unwrap();

        let node = get_node(&conn, id).unwrap();
        assert_eq!(node.access_count, 2);
        assert!(node.last_accessed.is_some());
    }

    #[test]
    fn fetch_nodes_batches() {
        let conn = test_db();
        let a = insert(&conn, "a", "general", 0);
        let b = insert(&conn, "b", "general", 1);
        let map = fetch_nodes(&conn, &[a, b, 999]).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key(&a));
        assert!(map.contains_key(&b));
    }
}
