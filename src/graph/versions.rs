//! Note version history — immutable content snapshots, at most 5 per node.
//!
//! The newest version row always mirrors the node's current state: an update
//! captures the prior state (if not already versioned) and then the new one,
//! so restoring the newest version is a no-op and restoring an older one is
//! itself undoable. A node keeps its id across restores.

use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;

use crate::error::StoreError;
use crate::graph::store;
use crate::graph::types::{Importance, Node, NoteVersion};

/// Maximum versions retained per node; the oldest is evicted on overflow.
pub const MAX_VERSIONS: u32 = 5;

/// Snapshot the node's current state as a new version. Returns the assigned
/// version number. Evicts versions older than the newest [`MAX_VERSIONS`].
pub fn save_version(conn: &Connection, node: &Node) -> Result<u32, StoreError> {
    let max_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version_number), 0) FROM note_versions WHERE note_id = ?1",
        params![node.id],
        |row| row.get(0),
    )?;
    let new_version = max_version + 1;

    conn.execute(
        "INSERT INTO note_versions \
         (note_id, version_number, content, category, importance, \
          emotional_tone, emotional_intensity, emotional_reflection, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            node.id,
            new_version,
            node.content,
            node.category,
            node.importance.as_str(),
            node.emotional_tone,
            node.emotional_intensity,
            node.emotional_reflection,
            store::now_rfc3339(),
        ],
    )?;

    // Overflow eviction: keep only the newest MAX_VERSIONS rows
    conn.execute(
        "DELETE FROM note_versions WHERE note_id = ?1 AND version_number <= ?2",
        params![node.id, new_version as i64 - MAX_VERSIONS as i64],
    )?;

    Ok(new_version)
}

/// Highest version number saved for a node; 0 when no versions exist.
pub fn latest_version(conn: &Connection, node_id: i64) -> Result<u32, StoreError> {
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version_number), 0) FROM note_versions WHERE note_id = ?1",
        params![node_id],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Content of the newest version row, if any.
pub fn latest_version_content(
    conn: &Connection,
    node_id: i64,
) -> Result<Option<String>, StoreError> {
    let content: Option<String> = conn
        .query_row(
            "SELECT content FROM note_versions WHERE note_id = ?1 \
             ORDER BY version_number DESC LIMIT 1",
            params![node_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(content)
}

/// Snapshot the node's current state unless the newest version already
/// captures this content. Returns the version number covering the state.
pub fn ensure_versioned(conn: &Connection, node: &Node) -> Result<u32, StoreError> {
    match latest_version_content(conn, node.id)? {
        Some(content) if content == node.content => latest_version(conn, node.id),
        _ => save_version(conn, node),
    }
}

/// Version history for a node, oldest first. The final entry mirrors the
/// node's current state.
pub fn get_history(conn: &Connection, node_id: i64) -> Result<Vec<NoteVersion>, StoreError> {
    // Distinguish "no versions" from "no such node"
    store::get_node(conn, node_id)?;

    let mut stmt = conn.prepare(
        "SELECT version_number, content, category, importance, \
         emotional_tone, emotional_intensity, emotional_reflection, created_at \
         FROM note_versions WHERE note_id = ?1 ORDER BY version_number",
    )?;
    let rows = stmt
        .query_map(params![node_id], |row| {
            let importance: String = row.get(3)?;
            Ok(NoteVersion {
                version: row.get(0)?,
                content: row.get(1)?,
                category: row.get(2)?,
                importance: Importance::from_str(&importance).unwrap_or(Importance::Normal),
                emotional_tone: row.get(4)?,
                emotional_intensity: row.get(5)?,
                emotional_reflection: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Restore a node to a previous version's content and metadata.
///
/// Restoring the newest version (which mirrors current state) is a no-op.
/// Otherwise the pre-restore state is captured if unversioned, the target
/// fields are applied, and the restored state becomes the newest version.
/// The node keeps its id; the caller re-embeds the restored content and
/// refreshes the derived indices.
pub fn restore_version(
    conn: &Connection,
    node_id: i64,
    version: u32,
) -> Result<NoteVersion, StoreError> {
    let target: Option<NoteVersion> = conn
        .query_row(
            "SELECT version_number, content, category, importance, \
             emotional_tone, emotional_intensity, emotional_reflection, created_at \
             FROM note_versions WHERE note_id = ?1 AND version_number = ?2",
            params![node_id, version],
            |row| {
                let importance: String = row.get(3)?;
                Ok(NoteVersion {
                    version: row.get(0)?,
                    content: row.get(1)?,
                    category: row.get(2)?,
                    importance: Importance::from_str(&importance).unwrap_or(Importance::Normal),
                    emotional_tone: row.get(4)?,
                    emotional_intensity: row.get(5)?,
                    emotional_reflection: row.get(6)?,
                    created_at: row.get(7)?,
                })
            },
        )
        .optional()?;

    let target = target.ok_or(StoreError::VersionNotFound { node_id, version })?;
    let current = store::get_node(conn, node_id)?;

    // Restoring to identical content is a no-op: no snapshot, no write.
    if current.content == target.content
        && current.category == target.category
        && current.importance == target.importance
    {
        return Ok(target);
    }

    ensure_versioned(conn, &current)?;

    conn.execute(
        "UPDATE nodes SET content = ?1, category = ?2, importance = ?3, \
         emotional_tone = ?4, emotional_intensity = COALESCE(?5, emotional_intensity), \
         emotional_reflection = ?6 WHERE id = ?7",
        params![
            target.content,
            target.category,
            target.importance.as_str(),
            target.emotional_tone,
            target.emotional_intensity,
            target.emotional_reflection,
            node_id,
        ],
    )?;

    // The restored state becomes the newest version
    let restored = store::get_node(conn, node_id)?;
    save_version(conn, &restored)?;

    Ok(target)
}
