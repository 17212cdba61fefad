//! Sleep-time maintenance: light and deep cycles over the graph.
//!
//! Light sleep (every ~50 new notes): anchor importance boost, stale-edge
//! decay, near-duplicate scan, PageRank. Deep sleep (daily) adds community
//! detection, typed-relation extraction, consolidation links, cluster
//! summaries, and an orphan report. Every cycle snapshots the database first
//! and rolls back on any step failure; a cycle never runs concurrently with
//! itself. Pure graph math — no model calls except the relation extractor.

use anyhow::{Context, Result as AnyResult};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use crate::config::HippoConfig;
use crate::db::{self, migrations};
use crate::error::MaintenanceError;
use crate::graph::temporal::{parse_timestamp, TemporalModel};
use crate::graph::types::EdgeKind;
use crate::graph::{cosine_similarity, metrics, store, truncate_preview, Indices};
use crate::services::EntityExtractor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepMode {
    Light,
    Deep,
}

impl SleepMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Deep => "deep",
        }
    }
}

/// Diff log for one maintenance step.
#[derive(Debug, Serialize)]
pub struct StepReport {
    pub name: &'static str,
    pub changes: usize,
    pub duration_ms: f64,
    pub detail: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SleepReport {
    pub mode: &'static str,
    pub dry_run: bool,
    pub rolled_back: bool,
    pub steps: Vec<StepReport>,
}

fn timed<F>(name: &'static str, f: F) -> AnyResult<StepReport>
where
    F: FnOnce() -> AnyResult<(usize, serde_json::Value)>,
{
    let start = Instant::now();
    let (changes, detail) = f().with_context(|| name)?;
    Ok(StepReport {
        name,
        changes,
        duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        detail,
    })
}

/// Run one maintenance cycle.
///
/// Takes a snapshot first (live runs only); any step failure restores the
/// snapshot, rebuilds the in-memory indices, and reports `StepFailed`.
pub fn run_sleep(
    conn: &mut Connection,
    indices: &mut Indices,
    temporal: &TemporalModel,
    extractor: &dyn EntityExtractor,
    config: &HippoConfig,
    snapshot_dir: &Path,
    mode: SleepMode,
    dry_run: bool,
) -> Result<SleepReport, MaintenanceError> {
    let snapshot = if dry_run {
        None
    } else {
        Some(
            db::snapshot_database(conn, snapshot_dir)
                .map_err(|e| MaintenanceError::SnapshotFailed(e.to_string()))?,
        )
    };

    tracing::info!(mode = mode.as_str(), dry_run, "sleep cycle started");
    let result = run_steps(conn, indices, temporal, extractor, config, mode, dry_run);

    match result {
        Ok(steps) => {
            if !dry_run {
                // Edge weights and metrics changed under the caches; resync.
                indices
                    .rebuild(conn)
                    .map_err(|e| MaintenanceError::step("index_rebuild", e))?;
                if mode == SleepMode::Deep {
                    migrations::set_last_deep_sleep(conn, &store::now_rfc3339())
                        .map_err(|e| MaintenanceError::step("deep_sleep_bookkeeping", e))?;
                }
            }
            tracing::info!(mode = mode.as_str(), steps = steps.len(), "sleep cycle complete");
            Ok(SleepReport {
                mode: mode.as_str(),
                dry_run,
                rolled_back: false,
                steps,
            })
        }
        Err(err) => {
            if let Some(token) = snapshot {
                tracing::error!(error = %err, "sleep step failed, restoring snapshot");
                db::restore_database(conn, &token)
                    .map_err(|e| MaintenanceError::SnapshotFailed(e.to_string()))?;
                indices
                    .rebuild(conn)
                    .map_err(|e| MaintenanceError::step("index_rebuild", e))?;
            }
            Err(MaintenanceError::StepFailed {
                step: "sleep",
                cause: err.to_string(),
            })
        }
    }
}

fn run_steps(
    conn: &mut Connection,
    indices: &Indices,
    temporal: &TemporalModel,
    extractor: &dyn EntityExtractor,
    config: &HippoConfig,
    mode: SleepMode,
    dry_run: bool,
) -> AnyResult<Vec<StepReport>> {
    let mut steps = Vec::new();

    steps.push(timed("anchor_boost", || {
        boost_anchors(conn, temporal, dry_run)
    })?);
    steps.push(timed("stale_edge_decay", || {
        stale_edge_decay(conn, temporal, config, dry_run)
    })?);
    steps.push(timed("duplicate_scan", || {
        duplicate_scan(indices, config)
    })?);
    steps.push(timed("pagerank", || pagerank(conn, indices, dry_run))?);

    if mode == SleepMode::Deep {
        steps.push(timed("communities", || communities(conn, indices, dry_run))?);
        steps.push(timed("relation_extraction", || {
            relation_extraction(conn, extractor, dry_run)
        })?);
        steps.push(timed("consolidation", || {
            consolidation(conn, indices, config, dry_run)
        })?);
        steps.push(timed("cluster_summaries", || {
            cluster_summaries(conn, dry_run)
        })?);
        steps.push(timed("orphan_report", || orphan_report(conn))?);
    }

    Ok(steps)
}

/// Build `?n` placeholders for a dynamic IN list starting at `start`.
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Step: upgrade anchor-category notes below critical importance.
fn boost_anchors(
    conn: &Connection,
    temporal: &TemporalModel,
    dry_run: bool,
) -> AnyResult<(usize, serde_json::Value)> {
    let anchors = temporal.anchor_category_list();
    if anchors.is_empty() {
        return Ok((0, serde_json::json!({})));
    }

    let in_list = placeholders(1, anchors.len());
    let sql_params: Vec<&dyn rusqlite::types::ToSql> = anchors
        .iter()
        .map(|c| c as &dyn rusqlite::types::ToSql)
        .collect();

    let changes = if dry_run {
        conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM nodes WHERE category IN ({in_list}) \
                 AND importance != 'critical'"
            ),
            sql_params.as_slice(),
            |row| row.get::<_, i64>(0),
        )? as usize
    } else {
        conn.execute(
            &format!(
                "UPDATE nodes SET importance = 'critical' \
                 WHERE category IN ({in_list}) AND importance != 'critical'"
            ),
            sql_params.as_slice(),
        )?
    };

    Ok((changes, serde_json::json!({ "boosted": changes })))
}

/// Step: decay edges untouched for longer than the stale threshold.
///
/// Protected edges — either endpoint in an anchor category — are skipped.
/// Decayed edges get a fresh `last_touched_at`, so an immediate second run
/// finds nothing stale.
fn stale_edge_decay(
    conn: &Connection,
    temporal: &TemporalModel,
    config: &HippoConfig,
    dry_run: bool,
) -> AnyResult<(usize, serde_json::Value)> {
    let cutoff = (chrono::Utc::now()
        - chrono::Duration::days(config.sleep.stale_edge_days))
    .to_rfc3339();
    let anchors = temporal.anchor_category_list();

    let mut sql_params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    let changes = if dry_run {
        sql_params.push(Box::new(cutoff.clone()));
        for c in &anchors {
            sql_params.push(Box::new(c.clone()));
        }
        let in_list = placeholders(2, anchors.len());
        let where_protected = if anchors.is_empty() {
            String::new()
        } else {
            format!(
                " AND source_id NOT IN (SELECT id FROM nodes WHERE category IN ({in_list})) \
                  AND target_id NOT IN (SELECT id FROM nodes WHERE category IN ({in_list}))"
            )
        };
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            sql_params.iter().map(|p| p.as_ref()).collect();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM edges WHERE last_touched_at < ?1{where_protected}"),
            param_refs.as_slice(),
            |row| row.get::<_, i64>(0),
        )? as usize
    } else {
        let now = store::now_rfc3339();
        sql_params.push(Box::new(config.sleep.stale_decay_factor));
        sql_params.push(Box::new(now));
        sql_params.push(Box::new(cutoff.clone()));
        for c in &anchors {
            sql_params.push(Box::new(c.clone()));
        }
        let in_list = placeholders(4, anchors.len());
        let where_protected = if anchors.is_empty() {
            String::new()
        } else {
            format!(
                " AND source_id NOT IN (SELECT id FROM nodes WHERE category IN ({in_list})) \
                  AND target_id NOT IN (SELECT id FROM nodes WHERE category IN ({in_list}))"
            )
        };
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            sql_params.iter().map(|p| p.as_ref()).collect();
        conn.execute(
            &format!(
                "UPDATE edges SET weight = weight * ?1, last_touched_at = ?2 \
                 WHERE last_touched_at < ?3{where_protected}"
            ),
            param_refs.as_slice(),
        )?
    };

    Ok((
        changes,
        serde_json::json!({ "decayed": changes, "cutoff": cutoff }),
    ))
}

/// Step: near-duplicate scan within a sliding window over the embedding
/// cache. Flags pairs; never deletes.
fn duplicate_scan(
    indices: &Indices,
    config: &HippoConfig,
) -> AnyResult<(usize, serde_json::Value)> {
    let ids = indices.vectors.sorted_ids();
    let window = config.sleep.dup_scan_window;
    let threshold = config.dup.block_threshold;

    let mut pairs: Vec<(i64, i64, f64)> = Vec::new();
    let mut checked = 0usize;
    for i in 0..ids.len() {
        let Some(a) = indices.vectors.get(ids[i]) else {
            continue;
        };
        for j in (i + 1)..ids.len().min(i + window) {
            let Some(b) = indices.vectors.get(ids[j]) else {
                continue;
            };
            checked += 1;
            let sim = cosine_similarity(a, b);
            if sim >= threshold {
                pairs.push((ids[i], ids[j], sim));
            }
        }
    }

    for (a, b, sim) in pairs.iter().take(5) {
        tracing::info!(a, b, similarity = sim, "near-duplicate pair flagged");
    }

    let detail = serde_json::json!({
        "checked": checked,
        "pairs": pairs
            .iter()
            .take(20)
            .map(|(a, b, sim)| serde_json::json!([a, b, sim]))
            .collect::<Vec<_>>(),
    });
    Ok((pairs.len(), detail))
}

/// Step: recompute weighted PageRank and persist it.
fn pagerank(
    conn: &Connection,
    indices: &Indices,
    dry_run: bool,
) -> AnyResult<(usize, serde_json::Value)> {
    let node_ids: Vec<i64> = store::list_nodes(conn)?.iter().map(|n| n.id).collect();
    let scores = metrics::compute_pagerank(&node_ids, &indices.graph);

    if !dry_run {
        metrics::write_back(conn, &scores, None)?;
    }

    let mut top: Vec<(i64, f64)> = scores.iter().map(|(&id, &pr)| (id, pr)).collect();
    top.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    top.truncate(5);

    Ok((
        scores.len(),
        serde_json::json!({ "nodes": scores.len(), "top": top }),
    ))
}

/// Deep step: community detection and write-back.
fn communities(
    conn: &Connection,
    indices: &Indices,
    dry_run: bool,
) -> AnyResult<(usize, serde_json::Value)> {
    let node_ids: Vec<i64> = store::list_nodes(conn)?.iter().map(|n| n.id).collect();
    let assignment = metrics::detect_communities(&node_ids, &indices.graph);

    let assigned = assignment.values().filter(|c| c.is_some()).count();
    let community_count = assignment
        .values()
        .filter_map(|c| *c)
        .collect::<HashSet<_>>()
        .len();

    if !dry_run {
        let pagerank: HashMap<i64, f64> = HashMap::new();
        metrics::write_back(conn, &pagerank, Some(&assignment))?;
    }

    Ok((
        assigned,
        serde_json::json!({ "communities": community_count, "isolated": node_ids.len() - assigned }),
    ))
}

/// Deep step: typed-relation extraction over notes added since the last deep
/// sleep. Creates directed typed edges between nodes that mention the related
/// entities.
fn relation_extraction(
    conn: &Connection,
    extractor: &dyn EntityExtractor,
    dry_run: bool,
) -> AnyResult<(usize, serde_json::Value)> {
    let since = migrations::get_last_deep_sleep(conn)?;
    let rows: Vec<(i64, String)> = {
        let (sql, param): (&str, Option<String>) = match &since {
            Some(ts) => (
                "SELECT id, content FROM nodes WHERE created_at > ?1 ORDER BY id LIMIT 200",
                Some(ts.clone()),
            ),
            None => ("SELECT id, content FROM nodes ORDER BY id LIMIT 200", None),
        };
        let mut stmt = conn.prepare(sql)?;
        let mapped = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(i64, String)> {
            Ok((row.get(0)?, row.get(1)?))
        };
        match param {
            Some(ts) => stmt
                .query_map(params![ts], mapped)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], mapped)?.collect::<Result<Vec<_>, _>>()?,
        }
    };

    if rows.is_empty() {
        return Ok((0, serde_json::json!({ "processed": 0 })));
    }

    let entity_index = store::entity_name_index(conn)?;
    let mut relations_found = 0usize;
    let mut edges_created = 0usize;
    let mut skipped = 0usize;

    for (node_id, content) in &rows {
        let triples = extractor.extract_relations(content);
        relations_found += triples.len();

        for triple in triples {
            let subject_nodes = entity_index
                .get(&store::canonicalize_entity(&triple.subject))
                .cloned()
                .unwrap_or_default();
            let object_nodes = entity_index
                .get(&store::canonicalize_entity(&triple.object))
                .cloned()
                .unwrap_or_default();

            if subject_nodes.is_empty() && object_nodes.is_empty() {
                skipped += 1;
                continue;
            }
            let sources = if subject_nodes.is_empty() {
                vec![*node_id]
            } else {
                subject_nodes
            };
            let targets = if object_nodes.is_empty() {
                vec![*node_id]
            } else {
                object_nodes
            };

            // Cap fan-out so one triple cannot explode the edge set
            let kind = EdgeKind::Relation(triple.relation.clone());
            for &src in sources.iter().take(3) {
                for &tgt in targets.iter().take(3) {
                    if src == tgt {
                        continue;
                    }
                    if !dry_run {
                        store::add_edge(conn, src, tgt, 0.6, &kind)?;
                    }
                    edges_created += 1;
                }
            }
        }
    }

    Ok((
        edges_created,
        serde_json::json!({
            "processed": rows.len(),
            "relations_found": relations_found,
            "edges_created": edges_created,
            "skipped_no_entity": skipped,
        }),
    ))
}

/// Deep step: consolidation links — thematic clusters and temporal chains.
///
/// Not compression: original notes are preserved intact; this only adds
/// explicit edges between related notes.
fn consolidation(
    conn: &Connection,
    indices: &Indices,
    config: &HippoConfig,
    dry_run: bool,
) -> AnyResult<(usize, serde_json::Value)> {
    let mut created = 0usize;

    // Thematic clusters by pairwise embedding similarity
    let ids = indices.vectors.sorted_ids();
    let mut processed: HashSet<i64> = HashSet::new();
    let mut clusters: Vec<Vec<i64>> = Vec::new();
    for (i, &id) in ids.iter().enumerate() {
        if processed.contains(&id) {
            continue;
        }
        let Some(a) = indices.vectors.get(id) else {
            continue;
        };
        let mut cluster = vec![id];
        for &other in ids.iter().skip(i + 1) {
            if processed.contains(&other) {
                continue;
            }
            let Some(b) = indices.vectors.get(other) else {
                continue;
            };
            if cosine_similarity(a, b) >= config.sleep.consolidation_similarity {
                cluster.push(other);
                processed.insert(other);
            }
        }
        if cluster.len() >= 3 {
            processed.insert(id);
            clusters.push(cluster);
        }
    }

    for cluster in &clusters {
        for (i, &a) in cluster.iter().enumerate() {
            for &b in cluster.iter().skip(i + 1) {
                if !dry_run {
                    store::add_edge(conn, a, b, 0.9, &EdgeKind::Consolidation)?;
                }
                created += 1;
            }
        }
    }

    // Temporal chains: same-category runs with bounded gaps
    let nodes = store::list_nodes(conn)?;
    let mut by_category: HashMap<String, Vec<(i64, String)>> = HashMap::new();
    for node in &nodes {
        by_category
            .entry(node.category.clone())
            .or_default()
            .push((node.id, node.created_at.clone()));
    }

    let mut chains = 0usize;
    for group in by_category.values_mut() {
        group.sort_by(|a, b| a.1.cmp(&b.1));
        let mut chain: Vec<i64> = Vec::new();
        let mut last_ts: Option<chrono::DateTime<chrono::Utc>> = None;

        let mut flush = |chain: &mut Vec<i64>, created: &mut usize, chains: &mut usize| -> AnyResult<()> {
            if chain.len() >= 3 {
                for pair in chain.windows(2) {
                    if !dry_run {
                        store::add_edge(conn, pair[0], pair[1], 0.95, &EdgeKind::TemporalChain)?;
                    }
                    *created += 1;
                }
                *chains += 1;
            }
            chain.clear();
            Ok(())
        };

        for (id, ts) in group.iter() {
            let parsed = parse_timestamp(ts);
            let gap_ok = match (last_ts, parsed) {
                (Some(prev), Some(curr)) => {
                    (curr - prev).num_days() <= config.sleep.chain_max_gap_days
                }
                _ => false,
            };
            if chain.is_empty() || gap_ok {
                chain.push(*id);
            } else {
                flush(&mut chain, &mut created, &mut chains)?;
                chain.push(*id);
            }
            last_ts = parsed;
        }
        flush(&mut chain, &mut created, &mut chains)?;
    }

    Ok((
        created,
        serde_json::json!({ "clusters": clusters.len(), "chains": chains, "links": created }),
    ))
}

/// Deep step: label each community with its top-PageRank note.
fn cluster_summaries(
    conn: &Connection,
    dry_run: bool,
) -> AnyResult<(usize, serde_json::Value)> {
    let nodes = store::list_nodes(conn)?;
    let mut best: HashMap<i64, (i64, f64, String)> = HashMap::new();
    for node in &nodes {
        let Some(community) = node.community_id else {
            continue;
        };
        let entry = best.entry(community);
        match entry {
            std::collections::hash_map::Entry::Occupied(mut o) => {
                if node.pagerank > o.get().1 {
                    o.insert((node.id, node.pagerank, truncate_preview(&node.content, 80)));
                }
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert((node.id, node.pagerank, truncate_preview(&node.content, 80)));
            }
        }
    }

    let labels: HashMap<String, serde_json::Value> = best
        .iter()
        .map(|(&community, (id, _, label))| {
            (
                community.to_string(),
                serde_json::json!({ "node_id": id, "label": label }),
            )
        })
        .collect();

    if !dry_run && !labels.is_empty() {
        conn.execute(
            "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('community_labels', ?1)",
            params![serde_json::to_string(&labels)?],
        )?;
    }

    Ok((labels.len(), serde_json::json!({ "labels": labels })))
}

/// Deep step: report notes with at most one incident edge. Report only — the
/// system never auto-deletes.
fn orphan_report(conn: &Connection) -> AnyResult<(usize, serde_json::Value)> {
    let mut stmt = conn.prepare(
        "SELECT n.id FROM nodes n \
         LEFT JOIN edges e ON n.id = e.source_id OR n.id = e.target_id \
         GROUP BY n.id HAVING COUNT(e.source_id) <= 1 ORDER BY n.id",
    )?;
    let orphans: Vec<i64> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let detail = serde_json::json!({
        "orphans": orphans.iter().take(20).collect::<Vec<_>>(),
        "count": orphans.len(),
    });
    Ok((orphans.len(), detail))
}

/// Trigger state shared between the write path and the maintenance worker.
///
/// A counter of new nodes trips light sleep; the `running` guard keeps a
/// cycle from overlapping itself.
pub struct SleepTrigger {
    notes_since_light: AtomicUsize,
    light_threshold: usize,
    running: AtomicBool,
}

impl SleepTrigger {
    pub fn new(light_threshold: usize) -> Self {
        Self {
            notes_since_light: AtomicUsize::new(0),
            light_threshold,
            running: AtomicBool::new(false),
        }
    }

    /// Record one new note. Returns true when the counter crosses the light
    /// threshold (and resets it).
    pub fn note_added(&self) -> bool {
        if self.light_threshold == 0 {
            return false;
        }
        let count = self.notes_since_light.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.light_threshold {
            self.notes_since_light.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn notes_pending(&self) -> usize {
        self.notes_since_light.load(Ordering::SeqCst)
    }

    /// Claim the single maintenance slot. Returns false if a cycle is already
    /// running.
    pub fn try_begin(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
