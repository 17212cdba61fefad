//! Write path: embed → duplicate gate → persist → link entities → create
//! semantic and entity edges → update the derived indices.
//!
//! Inference (embedding, entity extraction, date resolution) happens in
//! [`prepare_note`] without any lock held; [`commit_note`] then runs every
//! database mutation inside one transaction, so either all derived state
//! observes the new node or none does. In-memory indices are updated only
//! after the commit succeeds.

use rusqlite::Connection;
use std::collections::BTreeSet;

use crate::config::HippoConfig;
use crate::error::{IngestError, StoreError};
use crate::graph::types::{EdgeKind, Importance, Node};
use crate::graph::{l2_normalize, store, versions, Indices};
use crate::services::{DateResolver, Embedder, EntityExtractor, ExtractedEntity};

/// Caller-supplied fields for a new note.
pub struct NoteInput {
    pub content: String,
    pub category: String,
    pub importance: Importance,
    pub emotional_tone: Option<String>,
    pub emotional_intensity: i64,
    pub emotional_reflection: Option<String>,
    /// Bypass the duplicate gate.
    pub force: bool,
}

impl NoteInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            category: "general".into(),
            importance: Importance::Normal,
            emotional_tone: None,
            emotional_intensity: 5,
            emotional_reflection: None,
            force: false,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// A note with all inference done, ready to commit under the writer lock.
pub struct PreparedNote {
    pub input: NoteInput,
    pub embedding: Vec<f32>,
    pub entities: Vec<ExtractedEntity>,
    pub event: Option<(String, String)>,
}

/// A near-duplicate that was allowed through with a warning.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DupWarning {
    pub id: i64,
    pub similarity: f64,
}

/// Result of a successful ingest.
#[derive(Debug, serde::Serialize)]
pub struct IngestOutcome {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_warning: Option<DupWarning>,
    pub entity_links: usize,
    pub semantic_links: usize,
}

/// Classification of a candidate's similarity against the dedup thresholds.
#[derive(Debug, PartialEq, Eq)]
pub enum DupClass {
    /// At or above the block threshold: reject unless forced.
    Block,
    /// At or above the warn threshold: accept, but tell the caller.
    Warn,
    Distinct,
}

pub fn classify_similarity(similarity: f64, config: &crate::config::DedupConfig) -> DupClass {
    if similarity >= config.block_threshold {
        DupClass::Block
    } else if similarity >= config.warn_threshold {
        DupClass::Warn
    } else {
        DupClass::Distinct
    }
}

/// Run all external inference for a new note. Holds no lock; call before
/// acquiring the writer.
pub fn prepare_note(
    embedder: &dyn Embedder,
    extractor: &dyn EntityExtractor,
    dates: &dyn DateResolver,
    input: NoteInput,
) -> Result<PreparedNote, IngestError> {
    if input.content.trim().is_empty() {
        return Err(IngestError::InvalidInput {
            field: "content",
            reason: "must not be empty".into(),
        });
    }
    if !(0..=10).contains(&input.emotional_intensity) {
        return Err(IngestError::InvalidInput {
            field: "emotional_intensity",
            reason: format!("{} outside [0,10]", input.emotional_intensity),
        });
    }

    // Emotional context participates in the embedding so tone-matched queries
    // retrieve tone-matched notes.
    let mut full_text = input.content.clone();
    if input.emotional_tone.is_some() || input.emotional_reflection.is_some() {
        let mut context = Vec::new();
        if let Some(tone) = &input.emotional_tone {
            context.push(format!("Emotional tone: {tone}"));
        }
        if let Some(reflection) = &input.emotional_reflection {
            context.push(reflection.clone());
        }
        full_text = format!("{}\n\n{}", input.content, context.join(". "));
    }

    let mut embedding = embedder
        .encode(&full_text)
        .map_err(|e| IngestError::EmbeddingFailed(e.to_string()))?;
    if embedding.len() != embedder.dimensions() {
        return Err(IngestError::EmbeddingFailed(format!(
            "embedder returned {} dimensions, expected {}",
            embedding.len(),
            embedder.dimensions()
        )));
    }
    l2_normalize(&mut embedding);

    let entities = extractor.extract(&input.content);
    let event = dates
        .resolve(&input.content, chrono::Utc::now())
        .map(|(start, end)| (start.to_rfc3339(), end.to_rfc3339()));

    Ok(PreparedNote {
        input,
        embedding,
        entities,
        event,
    })
}

/// Persist a prepared note and all its edges in one transaction, then bring
/// the in-memory indices up to date.
pub fn commit_note(
    conn: &mut Connection,
    indices: &mut Indices,
    config: &HippoConfig,
    prepared: &PreparedNote,
) -> Result<IngestOutcome, IngestError> {
    // Duplicate gate against the existing index
    let mut duplicate_warning = None;
    let hits = indices.ann.search(conn, &prepared.embedding, 5)?;
    if let Some(&(existing_id, similarity)) = hits.first() {
        match classify_similarity(similarity, &config.dup) {
            DupClass::Block if !prepared.input.force => {
                return Err(IngestError::Duplicate(existing_id));
            }
            DupClass::Block | DupClass::Warn => {
                duplicate_warning = Some(DupWarning {
                    id: existing_id,
                    similarity,
                });
            }
            DupClass::Distinct => {}
        }
    }

    let mut created_edges: Vec<(i64, i64, f64, EdgeKind)> = Vec::new();

    let input = &prepared.input;
    let tx = conn.transaction().map_err(StoreError::from)?;

    let id = store::insert_node(
        &tx,
        &store::NewNode {
            content: &input.content,
            category: &input.category,
            importance: input.importance,
            emotional_tone: input.emotional_tone.as_deref(),
            emotional_intensity: input.emotional_intensity,
            emotional_reflection: input.emotional_reflection.as_deref(),
            t_event_start: prepared.event.as_ref().map(|(s, _)| s.clone()),
            t_event_end: prepared.event.as_ref().map(|(_, e)| e.clone()),
            embedding: &prepared.embedding,
        },
    )?;

    indices.ann.add(&tx, id, &prepared.embedding)?;

    // Entity linking: canonicalize, upsert, link, then connect to every other
    // node sharing a linked entity.
    let mut entity_neighbors: BTreeSet<i64> = BTreeSet::new();
    for entity in &prepared.entities {
        let entity_id = store::upsert_entity(&tx, &entity.surface, &entity.entity_type)?;
        store::link_entity(&tx, id, entity_id)?;
        for other in store::nodes_for_entity(&tx, entity_id)? {
            if other != id {
                entity_neighbors.insert(other);
            }
        }
    }
    for &other in &entity_neighbors {
        let shared = store::shared_entity_count(&tx, id, other)?;
        let weight = (0.5 + 0.1 * shared as f64).min(1.0);
        store::add_paired_edge(&tx, id, other, weight, &EdgeKind::Entity)?;
        created_edges.push((id, other, weight, EdgeKind::Entity));
        created_edges.push((other, id, weight, EdgeKind::Entity));
    }

    // Semantic links to the nearest existing notes
    let candidates = indices.ann.search_min(
        &tx,
        &prepared.embedding,
        config.retrieval.max_semantic_links * 2 + 1,
        config.retrieval.semantic_link_threshold,
    )?;
    let mut semantic_links = 0;
    for (other, similarity) in candidates
        .into_iter()
        .filter(|(other, _)| *other != id)
        .take(config.retrieval.max_semantic_links)
    {
        let weight = similarity.clamp(0.0, 1.0);
        store::add_paired_edge(&tx, id, other, weight, &EdgeKind::Semantic)?;
        created_edges.push((id, other, weight, EdgeKind::Semantic));
        created_edges.push((other, id, weight, EdgeKind::Semantic));
        semantic_links += 1;
    }

    tx.commit().map_err(StoreError::from)?;

    // The commit succeeded; mirror it into the in-memory indices.
    indices.bm25.add(id, &input.content);
    indices.vectors.insert(id, prepared.embedding.clone());
    for (source, target, weight, kind) in created_edges {
        indices.graph.add_edge(source, target, weight, kind);
    }

    tracing::debug!(
        node = id,
        entity_links = entity_neighbors.len(),
        semantic_links,
        "note ingested"
    );

    Ok(IngestOutcome {
        id,
        duplicate_warning,
        entity_links: entity_neighbors.len(),
        semantic_links,
    })
}

/// Full ingest: inference plus commit. Callers that manage their own locking
/// use [`prepare_note`] / [`commit_note`] directly.
pub fn add_note(
    conn: &mut Connection,
    indices: &mut Indices,
    config: &HippoConfig,
    embedder: &dyn Embedder,
    extractor: &dyn EntityExtractor,
    dates: &dyn DateResolver,
    input: NoteInput,
) -> Result<IngestOutcome, IngestError> {
    let prepared = prepare_note(embedder, extractor, dates, input)?;
    commit_note(conn, indices, config, &prepared)
}

/// Update a note's content and/or category.
///
/// A content change snapshots the prior state as a version, re-embeds, and
/// (when configured) re-runs entity extraction and rebuilds the entity edges.
/// An update with identical content creates no version and no edges.
/// Returns the note's latest version number.
pub fn update_note(
    conn: &mut Connection,
    indices: &mut Indices,
    config: &HippoConfig,
    embedder: &dyn Embedder,
    extractor: &dyn EntityExtractor,
    id: i64,
    content: Option<&str>,
    category: Option<&str>,
) -> Result<u32, IngestError> {
    let current = store::get_node(conn, id)?;

    let content_changed = content.map(|c| c != current.content).unwrap_or(false);
    if !content_changed {
        if let Some(category) = category {
            if category != current.category {
                store::set_category(conn, id, category)?;
            }
        }
        return Ok(versions::latest_version(conn, id)?);
    }

    let new_content = content.unwrap_or(&current.content);
    let mut embedding = embedder
        .encode(new_content)
        .map_err(|e| IngestError::EmbeddingFailed(e.to_string()))?;
    l2_normalize(&mut embedding);

    let extracted = if config.retrieval.reextract_on_update {
        Some(extractor.extract(new_content))
    } else {
        None
    };

    let version;
    let mut created_edges: Vec<(i64, i64, f64, EdgeKind)> = Vec::new();
    {
        let tx = conn.transaction().map_err(StoreError::from)?;

        // Capture the prior state if it is not already the newest version,
        // then apply the update; the new state becomes the newest version.
        versions::ensure_versioned(&tx, &current)?;
        store::set_content(&tx, id, new_content, &embedding)?;
        indices.ann.replace(&tx, id, &embedding)?;
        if let Some(category) = category {
            store::set_category(&tx, id, category)?;
        }

        if let Some(entities) = &extracted {
            rebuild_entity_links(&tx, id, entities, &mut created_edges)?;
        }

        let updated = store::get_node(&tx, id)?;
        version = versions::save_version(&tx, &updated)?;

        tx.commit().map_err(StoreError::from)?;
    }

    indices.bm25.add(id, new_content);
    indices.vectors.insert(id, embedding);
    if extracted.is_some() {
        // Entity edges were dropped and recreated; resync the adjacency.
        indices.graph.rebuild(conn)?;
    } else {
        for (source, target, weight, kind) in created_edges {
            indices.graph.add_edge(source, target, weight, kind);
        }
    }

    Ok(version)
}

/// Drop a node's entity links and entity edges, then relink from a fresh
/// extraction.
fn rebuild_entity_links(
    conn: &Connection,
    id: i64,
    entities: &[ExtractedEntity],
    created_edges: &mut Vec<(i64, i64, f64, EdgeKind)>,
) -> Result<(), StoreError> {
    store::unlink_all_entities(conn, id)?;
    conn.execute(
        "DELETE FROM edges WHERE (source_id = ?1 OR target_id = ?1) AND edge_type = 'entity'",
        rusqlite::params![id],
    )?;

    let mut entity_neighbors: BTreeSet<i64> = BTreeSet::new();
    for entity in entities {
        let entity_id = store::upsert_entity(conn, &entity.surface, &entity.entity_type)?;
        store::link_entity(conn, id, entity_id)?;
        for other in store::nodes_for_entity(conn, entity_id)? {
            if other != id {
                entity_neighbors.insert(other);
            }
        }
    }
    for &other in &entity_neighbors {
        let shared = store::shared_entity_count(conn, id, other)?;
        let weight = (0.5 + 0.1 * shared as f64).min(1.0);
        store::add_paired_edge(conn, id, other, weight, &EdgeKind::Entity)?;
        created_edges.push((id, other, weight, EdgeKind::Entity));
        created_edges.push((other, id, weight, EdgeKind::Entity));
    }
    Ok(())
}

/// Delete a node. Incident edges, entity links, and versions go with it, and
/// every index is updated in the same commit.
pub fn delete_note(
    conn: &mut Connection,
    indices: &mut Indices,
    id: i64,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    // Existence check so a missing id reports NotFound, not a silent no-op
    store::get_node(&tx, id)?;
    indices.ann.remove(&tx, id)?;
    tx.execute("DELETE FROM nodes WHERE id = ?1", rusqlite::params![id])?;
    tx.commit()?;

    indices.bm25.remove(id);
    indices.vectors.remove(id);
    indices.graph.remove_node(id);
    Ok(())
}

/// Restore a node to a prior version and refresh every derived index with the
/// restored content.
pub fn restore_note_version(
    conn: &mut Connection,
    indices: &mut Indices,
    embedder: &dyn Embedder,
    id: i64,
    version: u32,
) -> Result<(), IngestError> {
    let before = store::get_node(conn, id)?;
    let restored = versions::restore_version(conn, id, version)?;
    if restored.content == before.content {
        return Ok(());
    }

    let mut embedding = embedder
        .encode(&restored.content)
        .map_err(|e| IngestError::EmbeddingFailed(e.to_string()))?;
    l2_normalize(&mut embedding);

    let tx = conn.transaction().map_err(StoreError::from)?;
    store::set_content(&tx, id, &restored.content, &embedding)?;
    indices.ann.replace(&tx, id, &embedding)?;
    tx.commit().map_err(StoreError::from)?;

    indices.bm25.add(id, &restored.content);
    indices.vectors.insert(id, embedding);
    Ok(())
}

/// Find stored notes similar to arbitrary content.
pub fn find_similar(
    conn: &Connection,
    indices: &Indices,
    embedder: &dyn Embedder,
    content: &str,
    limit: usize,
    threshold: f64,
) -> Result<Vec<(i64, f64)>, IngestError> {
    let mut embedding = embedder
        .encode(content)
        .map_err(|e| IngestError::EmbeddingFailed(e.to_string()))?;
    l2_normalize(&mut embedding);
    Ok(indices.ann.search_min(conn, &embedding, limit, threshold)?)
}

/// Hydrate a full node row; convenience re-export for the facade.
pub fn get_note(conn: &Connection, id: i64) -> Result<Node, StoreError> {
    store::get_node(conn, id)
}
