//! SQL DDL for all HippoGraph tables.
//!
//! Defines the `nodes`, `edges`, `entities`, `node_entities`, `note_versions`,
//! `search_logs`, and `schema_meta` tables, plus the `nodes_vec` (vec0)
//! virtual table. All DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

use crate::services::EMBEDDING_DIM;

/// All schema DDL statements for HippoGraph's core tables.
const SCHEMA_SQL: &str = r#"
-- Notes
CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    importance TEXT NOT NULL DEFAULT 'normal' CHECK(importance IN ('critical','normal','low')),
    created_at TEXT NOT NULL,
    last_accessed TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    emotional_tone TEXT,
    emotional_intensity INTEGER NOT NULL DEFAULT 5 CHECK(emotional_intensity BETWEEN 0 AND 10),
    emotional_reflection TEXT,
    t_event_start TEXT,
    t_event_end TEXT,
    pagerank REAL NOT NULL DEFAULT 0.0,
    community_id INTEGER,
    embedding BLOB
);

CREATE INDEX IF NOT EXISTS idx_nodes_category ON nodes(category);
CREATE INDEX IF NOT EXISTS idx_nodes_created ON nodes(created_at);
CREATE INDEX IF NOT EXISTS idx_nodes_event_start ON nodes(t_event_start);

-- Typed, weighted connections between notes. Semantic and entity edges are
-- stored as two mirrored rows; typed-relation, consolidation, and
-- temporal-chain edges are single directed rows.
CREATE TABLE IF NOT EXISTS edges (
    source_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    target_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    edge_type TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 0.5 CHECK(weight >= 0.0 AND weight <= 1.0),
    created_at TEXT NOT NULL,
    last_touched_at TEXT NOT NULL,
    PRIMARY KEY (source_id, target_id, edge_type)
);

CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
CREATE INDEX IF NOT EXISTS idx_edges_touched ON edges(last_touched_at);

-- Canonical extracted concepts
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    entity_type TEXT NOT NULL DEFAULT 'concept'
);

CREATE TABLE IF NOT EXISTS node_entities (
    node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    PRIMARY KEY (node_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_node_entities_node ON node_entities(node_id);
CREATE INDEX IF NOT EXISTS idx_node_entities_entity ON node_entities(entity_id);

-- Immutable content snapshots, at most 5 per node
CREATE TABLE IF NOT EXISTS note_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    note_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    version_number INTEGER NOT NULL,
    content TEXT NOT NULL,
    category TEXT NOT NULL,
    importance TEXT NOT NULL,
    emotional_tone TEXT,
    emotional_intensity INTEGER,
    emotional_reflection TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(note_id, version_number)
);

-- Search quality log: one row per query
CREATE TABLE IF NOT EXISTS search_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    query TEXT NOT NULL,
    query_hash TEXT NOT NULL,
    query_cleaned TEXT,
    is_temporal INTEGER NOT NULL DEFAULT 0,
    temporal_direction TEXT,

    limit_requested INTEGER,
    category_filter TEXT,
    time_after TEXT,
    time_before TEXT,
    entity_type_filter TEXT,
    detail_mode TEXT,

    results_count INTEGER NOT NULL,
    total_activated INTEGER NOT NULL,
    top1_score REAL,
    top1_node_id INTEGER,

    latency_total_ms REAL,
    latency_embedding_ms REAL,
    latency_ann_ms REAL,
    latency_spreading_ms REAL,
    latency_bm25_ms REAL,
    latency_temporal_ms REAL,
    latency_rerank_ms REAL,
    latency_filters_ms REAL,

    blend_alpha REAL,
    blend_beta REAL,
    blend_gamma REAL,
    blend_delta REAL,
    bm25_matches INTEGER NOT NULL DEFAULT 0,
    temporal_matches INTEGER NOT NULL DEFAULT 0,
    rerank_applied INTEGER NOT NULL DEFAULT 0,
    degraded INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_search_logs_timestamp ON search_logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_search_logs_results ON search_logs(results_count);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // vec0 virtual table must be created separately (sqlite-vec syntax).
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS nodes_vec USING vec0(
            id INTEGER PRIMARY KEY,
            embedding FLOAT[{EMBEDDING_DIM}]
        );"
    ))?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for t in [
            "nodes",
            "edges",
            "entities",
            "node_entities",
            "note_versions",
            "search_logs",
            "schema_meta",
        ] {
            assert!(tables.contains(&t.to_string()), "missing table {t}");
        }

        // Verify the vec extension is live
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error
    }

    #[test]
    fn edge_weight_range_is_enforced() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO nodes (content, created_at) VALUES ('a', '2026-01-01T00:00:00+00:00'), ('b', '2026-01-01T00:00:00+00:00')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO edges (source_id, target_id, edge_type, weight, created_at, last_touched_at)
             VALUES (1, 2, 'semantic', 1.5, '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
            [],
        );
        assert!(result.is_err());
    }
}
