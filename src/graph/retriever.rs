//! Hybrid read path: ANN → spreading activation → BM25 → temporal scoring →
//! blend → rerank → recency decay and importance boost → filters → top-K.
//!
//! Candidates missing from a signal contribute zero from it. The pipeline
//! degrades gracefully: no embedding service means BM25 + temporal only, no
//! reranker means no rerank, and both are surfaced as degradation flags
//! rather than errors. A cancellation token is checked between phases;
//! access-count updates happen only on successful return.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{BlendConfig, HippoConfig};
use crate::error::RetrieverError;
use crate::graph::cache::GraphCache;
use crate::graph::logger::{self, PhaseDurations, SearchLogRecord, SearchTimer};
use crate::graph::temporal::{
    decompose_query, parse_timestamp, temporal_order_score, temporal_overlap, TemporalDirection,
    TemporalModel,
};
use crate::graph::types::Node;
use crate::graph::{l2_normalize, store, truncate_preview, Indices};
use crate::services::{DateResolver, Embedder, Reranker};

/// Cooperative cancellation token, checked before each pipeline phase.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Post-scoring filters.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub category: Option<String>,
    pub time_after: Option<String>,
    pub time_before: Option<String>,
    pub entity_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailMode {
    /// First line and metadata only — context-window protection.
    Brief,
    Full,
}

impl DetailMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    /// Requested result count.
    pub limit: Option<usize>,
    /// Hard ceiling on returned results; the effective count is
    /// `min(limit, max_results)`, clamped to the configured cap.
    pub max_results: Option<usize>,
    pub detail_mode: DetailMode,
    pub filters: SearchFilters,
    /// Per-query blend weight override.
    pub blend: Option<BlendConfig>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: None,
            max_results: None,
            detail_mode: DetailMode::Full,
            filters: SearchFilters::default(),
            blend: None,
        }
    }
}

/// Per-signal diagnostic values for one result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalBreakdown {
    pub semantic: f64,
    pub activation: f64,
    pub bm25: f64,
    pub temporal: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub id: i64,
    pub category: String,
    pub importance: String,
    pub created_at: String,
    pub score: f64,
    /// Full content (full mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// First line, at most 200 chars (brief mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub signals: SignalBreakdown,
}

#[derive(Debug, Serialize)]
pub struct SearchStats {
    pub total_activated: usize,
    pub returned: usize,
    pub estimated_tokens: usize,
    pub has_more: bool,
    pub degraded: Vec<String>,
    pub durations: PhaseDurations,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    pub stats: SearchStats,
}

/// Hub penalty: notes linked to more than `threshold` entities contribute
/// proportionally less activation, as source and as target.
fn hub_penalty(entity_counts: &HashMap<i64, usize>, threshold: usize, id: i64) -> f64 {
    let count = entity_counts.get(&id).copied().unwrap_or(0);
    if count > threshold {
        threshold as f64 / count as f64
    } else {
        1.0
    }
}

/// Spreading activation over the graph cache.
///
/// Accumulating mode: each iteration distributes `A[u] · w · decay` along
/// every edge, the new mass is added into `A` with a per-node cap of 1.0,
/// and iteration stops early once the largest delta falls below 1e-6.
/// The result is normalized to [0, 1] by the maximum.
pub fn spread_activation(
    seeds: &HashMap<i64, f64>,
    graph: &GraphCache,
    entity_counts: &HashMap<i64, usize>,
    hub_threshold: usize,
    iterations: usize,
    decay: f64,
) -> HashMap<i64, f64> {
    let mut activation = seeds.clone();

    for _ in 0..iterations {
        let mut spread: HashMap<i64, f64> = HashMap::new();
        for (&u, &a) in &activation {
            if a < 0.01 {
                continue;
            }
            let pen_u = hub_penalty(entity_counts, hub_threshold, u);
            for &(v, w, _) in graph.neighbors(u) {
                if v == u {
                    continue;
                }
                let pen_v = hub_penalty(entity_counts, hub_threshold, v);
                *spread.entry(v).or_insert(0.0) += a * w * decay * pen_u * pen_v;
            }
        }

        let mut max_delta = 0.0f64;
        for (v, add) in spread {
            let entry = activation.entry(v).or_insert(0.0);
            let before = *entry;
            *entry = (*entry + add).min(1.0);
            max_delta = max_delta.max(*entry - before);
        }
        if max_delta < 1e-6 {
            break;
        }
    }

    let max = activation.values().cloned().fold(0.0f64, f64::max);
    if max > 0.0 {
        for v in activation.values_mut() {
            *v /= max;
        }
    }
    activation
}

/// Min-max normalize a score map in place. A single-valued map normalizes
/// to 1.0.
fn min_max_normalize(scores: &mut HashMap<i64, f64>) {
    if scores.is_empty() {
        return;
    }
    let max = scores.values().cloned().fold(f64::MIN, f64::max);
    let min = scores.values().cloned().fold(f64::MAX, f64::min);
    for v in scores.values_mut() {
        *v = if max > min { (*v - min) / (max - min) } else { 1.0 };
    }
}

fn first_line_preview(content: &str) -> String {
    let first = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or(content);
    truncate_preview(first, 200)
}

macro_rules! check_cancel {
    ($cancel:expr) => {
        if $cancel.is_cancelled() {
            return Err(RetrieverError::Cancelled);
        }
    };
}

/// Run the full hybrid search pipeline.
#[allow(clippy::too_many_arguments)]
pub fn search(
    conn: &Connection,
    indices: &Indices,
    temporal_model: &TemporalModel,
    config: &HippoConfig,
    embedder: &dyn Embedder,
    reranker: Option<&dyn Reranker>,
    dates: &dyn DateResolver,
    request: &SearchRequest,
    cancel: &CancelToken,
) -> Result<SearchResponse, RetrieverError> {
    let query = request.query.trim();
    if query.is_empty() {
        return Err(RetrieverError::EmptyQuery);
    }

    let mut timer = SearchTimer::start();
    let mut degraded: Vec<String> = Vec::new();
    let total_budget_ms = config.timeouts.total_ms as f64;

    // 1. Temporal decomposition
    let decomposed = decompose_query(query);

    // 2. Embed the stripped query
    check_cancel!(cancel);
    let q_vec = match embedder.encode(&decomposed.content) {
        Ok(mut v) => {
            l2_normalize(&mut v);
            Some(v)
        }
        Err(e) => {
            tracing::warn!(error = %e, "embedding unavailable, degrading to BM25 + temporal");
            degraded.push("embedding_unavailable".into());
            None
        }
    };
    timer.mark("embedding");

    // 3. ANN candidates seed the activation
    check_cancel!(cancel);
    if timer.total_ms() > total_budget_ms {
        return Err(RetrieverError::Timeout { phase: Some("ann") });
    }
    let mut semantic: HashMap<i64, f64> = HashMap::new();
    if let Some(q_vec) = &q_vec {
        for (id, sim) in indices
            .ann
            .search(conn, q_vec, config.retrieval.ann_candidates)?
        {
            semantic.insert(id, sim.max(0.0));
        }
    }
    timer.mark("ann");

    // 4. Spreading activation
    check_cancel!(cancel);
    let entity_counts = store::entity_counts(conn)?;
    let activation = spread_activation(
        &semantic,
        &indices.graph,
        &entity_counts,
        config.hub.threshold,
        config.spread.iterations,
        config.spread.decay,
    );
    timer.mark("spreading");

    // 5. BM25 keyword signal, min-max normalized per query
    check_cancel!(cancel);
    let mut bm25: HashMap<i64, f64> = indices
        .bm25
        .search(&decomposed.content, config.retrieval.ann_candidates)
        .into_iter()
        .collect();
    let bm25_matches = bm25.len();
    min_max_normalize(&mut bm25);
    timer.mark("bm25");

    // 6. Temporal signal (only when the query carries one)
    let mut temporal: HashMap<i64, f64> = HashMap::new();
    if decomposed.has_signal {
        if timer.total_ms() < total_budget_ms {
            if let Some((q_start, q_end)) = dates
                .resolve(query, chrono::Utc::now())
                .map(|(s, e)| (s.to_rfc3339(), e.to_rfc3339()))
            {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, t_event_start, t_event_end FROM nodes \
                         WHERE t_event_start IS NOT NULL",
                    )
                    .map_err(crate::error::StoreError::from)?;
                let rows: Vec<(i64, Option<String>, Option<String>)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                    .map_err(crate::error::StoreError::from)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(crate::error::StoreError::from)?;
                for (id, start, end) in rows {
                    let score =
                        temporal_overlap(&q_start, &q_end, start.as_deref(), end.as_deref());
                    if score > 0.0 {
                        temporal.insert(id, score);
                    }
                }
            }

            // Directional ordering over the candidate timeline
            if let Some(
                direction @ (TemporalDirection::Earliest | TemporalDirection::Latest),
            ) = decomposed.direction
            {
                let candidate_ids: HashSet<i64> =
                    activation.keys().chain(bm25.keys()).copied().collect();
                if !candidate_ids.is_empty() {
                    let ids: Vec<i64> = candidate_ids.into_iter().collect();
                    let nodes = store::fetch_nodes(conn, &ids)?;
                    let timestamps: Vec<(i64, String)> = nodes
                        .values()
                        .map(|n| {
                            let ts = n
                                .t_event_start
                                .clone()
                                .unwrap_or_else(|| n.created_at.clone());
                            (n.id, ts)
                        })
                        .collect();
                    let parsed: Vec<chrono::DateTime<chrono::Utc>> = timestamps
                        .iter()
                        .filter_map(|(_, ts)| parse_timestamp(ts))
                        .collect();
                    for (id, ts) in &timestamps {
                        let order = temporal_order_score(ts, direction, &parsed);
                        let entry = temporal.entry(*id).or_insert(0.0);
                        *entry = entry.max(order);
                    }
                }
            }
        } else {
            degraded.push("temporal_skipped_budget".into());
        }
    }
    let temporal_matches = temporal.len();
    timer.mark("temporal");

    // 7. Blend. δ applies only with a temporal signal; otherwise it is
    // redistributed to α.
    let weights = request.blend.unwrap_or(config.blend);
    let (mut alpha, beta, gamma, mut delta) =
        (weights.alpha, weights.beta, weights.gamma, weights.delta);
    if !decomposed.has_signal {
        alpha += delta;
        delta = 0.0;
    }

    let candidate_ids: HashSet<i64> = semantic
        .keys()
        .chain(activation.keys())
        .chain(bm25.keys())
        .chain(temporal.keys())
        .copied()
        .collect();

    let mut blended: Vec<(i64, f64)> = candidate_ids
        .into_iter()
        .map(|id| {
            let score = alpha * semantic.get(&id).copied().unwrap_or(0.0)
                + beta * activation.get(&id).copied().unwrap_or(0.0)
                + gamma * bm25.get(&id).copied().unwrap_or(0.0)
                + delta * temporal.get(&id).copied().unwrap_or(0.0);
            (id, score)
        })
        .collect();
    let total_activated = blended.len();

    // 8. Keep top-M by blended score
    blended.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    blended.truncate(config.rerank.top_n);

    let ids: Vec<i64> = blended.iter().map(|(id, _)| *id).collect();
    let nodes = store::fetch_nodes(conn, &ids)?;

    // 9. Optional cross-encoder rerank over the survivors
    check_cancel!(cancel);
    let mut rerank_scores: HashMap<i64, f64> = HashMap::new();
    let mut rerank_applied = false;
    if config.rerank.enabled && !blended.is_empty() {
        if let Some(reranker) = reranker {
            let remaining = total_budget_ms - timer.total_ms();
            if remaining >= config.timeouts.rerank_ms as f64 {
                let texts: Vec<&str> = blended
                    .iter()
                    .filter_map(|(id, _)| nodes.get(id).map(|n| n.content.as_str()))
                    .collect();
                match reranker.score(query, &texts) {
                    Ok(scores) if scores.len() == texts.len() => {
                        let mut normalized: HashMap<i64, f64> = blended
                            .iter()
                            .zip(scores.iter())
                            .map(|((id, _), s)| (*id, *s as f64))
                            .collect();
                        min_max_normalize(&mut normalized);
                        let w = config.rerank.weight;
                        for (id, score) in blended.iter_mut() {
                            if let Some(rr) = normalized.get(id) {
                                *score = (1.0 - w) * *score + w * rr;
                                rerank_scores.insert(*id, *rr);
                            }
                        }
                        rerank_applied = true;
                    }
                    Ok(_) => {
                        tracing::warn!("reranker returned mismatched score count, skipping");
                        degraded.push("rerank_unavailable".into());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reranker failed, skipping");
                        degraded.push("rerank_unavailable".into());
                    }
                }
            } else {
                degraded.push("rerank_skipped_budget".into());
            }
        }
    }
    timer.mark("rerank");

    // 10. Recency decay and importance boost
    check_cancel!(cancel);
    for (id, score) in blended.iter_mut() {
        if let Some(node) = nodes.get(id) {
            *score *= temporal_model.recency_factor(node) * node.importance.multiplier();
        }
    }

    // 11. Filters, then order by score with pagerank and id tie-breaks
    let filters = &request.filters;
    let mut survivors: Vec<(i64, f64)> = Vec::with_capacity(blended.len());
    for (id, score) in blended {
        let Some(node) = nodes.get(&id) else { continue };
        if let Some(category) = &filters.category {
            if &node.category != category {
                continue;
            }
        }
        if let Some(after) = &filters.time_after {
            if node.created_at.as_str() < after.as_str() {
                continue;
            }
        }
        if let Some(before) = &filters.time_before {
            if node.created_at.as_str() > before.as_str() {
                continue;
            }
        }
        if let Some(entity_type) = &filters.entity_type {
            if !store::node_has_entity_type(conn, id, entity_type)? {
                continue;
            }
        }
        survivors.push((id, score));
    }
    survivors.sort_by(|(a_id, a_score), (b_id, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_pr = nodes.get(a_id).map(|n| n.pagerank).unwrap_or(0.0);
                let b_pr = nodes.get(b_id).map(|n| n.pagerank).unwrap_or(0.0);
                b_pr.partial_cmp(&a_pr).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a_id.cmp(b_id))
    });
    timer.mark("filters");

    // 12. Top max_results; access tracking happens only now, on success
    let limit = request
        .limit
        .unwrap_or(config.retrieval.default_max_results)
        .min(request.max_results.unwrap_or(config.retrieval.max_results_cap))
        .min(config.retrieval.max_results_cap)
        .max(1);
    survivors.truncate(limit);

    let returned_ids: Vec<i64> = survivors.iter().map(|(id, _)| *id).collect();
    store::touch_nodes(conn, &returned_ids)?;

    let build_item = |id: i64, score: f64, node: &Node| -> SearchResultItem {
        let signals = SignalBreakdown {
            semantic: semantic.get(&id).copied().unwrap_or(0.0),
            activation: activation.get(&id).copied().unwrap_or(0.0),
            bm25: bm25.get(&id).copied().unwrap_or(0.0),
            temporal: temporal.get(&id).copied().unwrap_or(0.0),
            rerank: rerank_scores.get(&id).copied(),
        };
        let (content, preview) = match request.detail_mode {
            DetailMode::Full => (Some(node.content.clone()), None),
            DetailMode::Brief => (None, Some(first_line_preview(&node.content))),
        };
        SearchResultItem {
            id,
            category: node.category.clone(),
            importance: node.importance.to_string(),
            created_at: node.created_at.clone(),
            score,
            content,
            preview,
            signals,
        }
    };

    let results: Vec<SearchResultItem> = survivors
        .iter()
        .filter_map(|&(id, score)| nodes.get(&id).map(|n| build_item(id, score, n)))
        .collect();

    let estimated_tokens = results
        .iter()
        .map(|r| {
            r.content
                .as_deref()
                .or(r.preview.as_deref())
                .map(|t| t.len() / 4)
                .unwrap_or(0)
                + 10 // id/category/score overhead
        })
        .sum();

    let durations = PhaseDurations::from_timer(&timer);
    logger::log_search(
        conn,
        &SearchLogRecord {
            query,
            query_cleaned: (decomposed.content != query).then_some(decomposed.content.as_str()),
            is_temporal: decomposed.has_signal,
            temporal_direction: decomposed.direction.map(|d| d.as_str()),
            limit_requested: limit,
            category_filter: filters.category.as_deref(),
            time_after: filters.time_after.as_deref(),
            time_before: filters.time_before.as_deref(),
            entity_type_filter: filters.entity_type.as_deref(),
            detail_mode: request.detail_mode.as_str(),
            results_count: results.len(),
            total_activated,
            top1_score: results.first().map(|r| r.score),
            top1_node_id: results.first().map(|r| r.id),
            durations: durations.clone(),
            blend: (alpha, beta, gamma, delta),
            bm25_matches,
            temporal_matches,
            rerank_applied,
            degraded: !degraded.is_empty(),
        },
    );

    let returned = results.len();
    Ok(SearchResponse {
        results,
        stats: SearchStats {
            total_activated,
            returned,
            estimated_tokens,
            has_more: total_activated > returned,
            degraded,
            durations,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::graph::ingest::{self, NoteInput};
    use crate::graph::types::{EdgeKind, Importance};
    use crate::graph::{ann::AnnIndex, bm25::Bm25Index, cache::EmbeddingCache};
    use crate::services::{DisabledDateResolver, DisabledExtractor, EMBEDDING_DIM};
    use anyhow::Result as AnyResult;

    struct MapEmbedder {
        map: HashMap<String, Vec<f32>>,
        fail: bool,
    }

    impl MapEmbedder {
        fn new() -> Self {
            Self {
                map: HashMap::new(),
                fail: false,
            }
        }

        fn register(&mut self, text: &str, mut v: Vec<f32>) {
            l2_normalize(&mut v);
            self.map.insert(text.to_string(), v);
        }
    }

    impl Embedder for MapEmbedder {
        fn encode(&self, text: &str) -> AnyResult<Vec<f32>> {
            if self.fail {
                anyhow::bail!("embedding service down");
            }
            if let Some(v) = self.map.get(text) {
                return Ok(v.clone());
            }
            let mut v = vec![0.0f32; EMBEDDING_DIM];
            v[text.len() % EMBEDDING_DIM] = 1.0;
            Ok(v)
        }

        fn model_id(&self) -> &str {
            "test-map-embedder"
        }
    }

    fn spike(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    fn blend_vec(a: usize, b: usize, wa: f32, wb: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[a] = wa;
        v[b] = wb;
        l2_normalize(&mut v);
        v
    }

    fn setup() -> (rusqlite::Connection, Indices, HippoConfig, TemporalModel) {
        let conn = db::open_memory_database().unwrap();
        let indices = Indices {
            ann: AnnIndex::new(EMBEDDING_DIM),
            bm25: Bm25Index::new(1.5, 0.75),
            graph: GraphCache::new(),
            vectors: EmbeddingCache::new(),
        };
        let config = HippoConfig::default();
        let temporal = TemporalModel::new(&config.temporal);
        (conn, indices, config, temporal)
    }

    fn add(
        conn: &mut rusqlite::Connection,
        indices: &mut Indices,
        config: &HippoConfig,
        embedder: &MapEmbedder,
        input: NoteInput,
    ) -> i64 {
        ingest::add_note(
            conn,
            indices,
            config,
            embedder,
            &DisabledExtractor,
            &DisabledDateResolver,
            input,
        )
        .unwrap()
        .id
    }

    fn run(
        conn: &Connection,
        indices: &Indices,
        temporal: &TemporalModel,
        config: &HippoConfig,
        embedder: &MapEmbedder,
        request: &SearchRequest,
    ) -> SearchResponse {
        search(
            conn,
            indices,
            temporal,
            config,
            embedder,
            None,
            &DisabledDateResolver,
            request,
            &CancelToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn empty_query_is_an_error() {
        let (conn, indices, config, temporal) = setup();
        let embedder = MapEmbedder::new();
        let result = search(
            &conn,
            &indices,
            &temporal,
            &config,
            &embedder,
            None,
            &DisabledDateResolver,
            &SearchRequest::new("   "),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(RetrieverError::EmptyQuery)));
    }

    #[test]
    fn cancelled_token_aborts_without_touching() {
        let (mut conn, mut indices, config, temporal) = setup();
        let mut embedder = MapEmbedder::new();
        embedder.register("a note", spike(0));
        let id = add(&mut conn, &mut indices, &config, &embedder, NoteInput::new("a note"));

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = search(
            &conn,
            &indices,
            &temporal,
            &config,
            &embedder,
            None,
            &DisabledDateResolver,
            &SearchRequest::new("a note"),
            &cancel,
        );
        assert!(matches!(result, Err(RetrieverError::Cancelled)));

        let node = store::get_node(&conn, id).unwrap();
        assert_eq!(node.access_count, 0);
    }

    #[test]
    fn semantic_neighbors_outrank_unrelated_notes() {
        let (mut conn, mut indices, config, temporal) = setup();
        let mut embedder = MapEmbedder::new();
        embedder.register("Python debugging with pdb", spike(0));
        embedder.register("Python logging best practices", blend_vec(0, 1, 0.8, 0.6));
        embedder.register("Baking sourdough bread", spike(200));
        embedder.register("debugging tools in Python", blend_vec(0, 1, 0.95, 0.31));

        let n1 = add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("Python debugging with pdb"),
        );
        let n2 = add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("Python logging best practices"),
        );
        let n3 = add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("Baking sourdough bread"),
        );

        let response = run(
            &conn,
            &indices,
            &temporal,
            &config,
            &embedder,
            &SearchRequest::new("debugging tools in Python"),
        );

        let ids: Vec<i64> = response.results.iter().map(|r| r.id).collect();
        assert_eq!(ids[0], n1);
        assert_eq!(ids[1], n2);
        assert!(response.results[0].score > response.results[1].score);

        // the unrelated note scores near zero
        let sourdough = response.results.iter().find(|r| r.id == n3);
        if let Some(sourdough) = sourdough {
            assert!(sourdough.score < 0.1, "score {}", sourdough.score);
        }
    }

    #[test]
    fn critical_importance_doubles_the_score() {
        let (mut conn, mut indices, config, temporal) = setup();
        let mut embedder = MapEmbedder::new();
        // nearly identical embeddings, below the dup warn threshold
        embedder.register("release checklist draft A", blend_vec(0, 1, 0.9, 0.436));
        embedder.register("release checklist draft B", blend_vec(0, 2, 0.9, 0.436));
        embedder.register("release checklist", spike(0));

        let critical = add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("release checklist draft A").with_importance(Importance::Critical),
        );
        let normal = add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("release checklist draft B"),
        );

        let response = run(
            &conn,
            &indices,
            &temporal,
            &config,
            &embedder,
            &SearchRequest::new("release checklist"),
        );

        let crit = response.results.iter().find(|r| r.id == critical).unwrap();
        let norm = response.results.iter().find(|r| r.id == normal).unwrap();
        assert!(crit.score > norm.score);
        // same signals, so the gap is exactly the 2.0 importance multiplier
        // modulo equal recency
        assert!((crit.score / norm.score - 2.0).abs() < 0.05);
    }

    #[test]
    fn activation_spreads_through_edges() {
        let mut graph = GraphCache::new();
        graph.add_edge(1, 2, 1.0, EdgeKind::Semantic);
        graph.add_edge(2, 1, 1.0, EdgeKind::Semantic);

        let seeds: HashMap<i64, f64> = [(1, 1.0)].into_iter().collect();
        let result = spread_activation(&seeds, &graph, &HashMap::new(), 20, 3, 0.7);

        assert_eq!(result[&1], 1.0); // normalized max
        let spread = result[&2];
        assert!(spread > 0.0 && spread <= 1.0);
    }

    #[test]
    fn hub_penalty_dampens_entity_heavy_nodes() {
        let mut graph = GraphCache::new();
        graph.add_edge(1, 2, 1.0, EdgeKind::Entity);
        graph.add_edge(1, 3, 1.0, EdgeKind::Entity);

        let seeds: HashMap<i64, f64> = [(1, 1.0)].into_iter().collect();

        let no_hubs = spread_activation(&seeds, &graph, &HashMap::new(), 20, 1, 0.7);
        let counts: HashMap<i64, usize> = [(2, 40)].into_iter().collect();
        let with_hub = spread_activation(&seeds, &graph, &counts, 20, 1, 0.7);

        // node 2 is a 40-entity hub: its share halves relative to node 3
        assert!((no_hubs[&2] - no_hubs[&3]).abs() < 1e-9);
        assert!(with_hub[&2] < with_hub[&3]);
        assert!((with_hub[&2] / with_hub[&3] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn embedding_failure_degrades_to_bm25() {
        let (mut conn, mut indices, config, temporal) = setup();
        let mut embedder = MapEmbedder::new();
        embedder.register("quantum computing notes", spike(0));
        let id = add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("quantum computing notes"),
        );

        let mut failing = MapEmbedder::new();
        failing.fail = true;
        let response = search(
            &conn,
            &indices,
            &temporal,
            &config,
            &failing,
            None,
            &DisabledDateResolver,
            &SearchRequest::new("quantum computing"),
            &CancelToken::new(),
        )
        .unwrap();

        assert!(response
            .stats
            .degraded
            .contains(&"embedding_unavailable".to_string()));
        // BM25 still finds the note
        assert_eq!(response.results[0].id, id);
    }

    #[test]
    fn category_filter_applies_after_scoring() {
        let (mut conn, mut indices, config, temporal) = setup();
        let mut embedder = MapEmbedder::new();
        embedder.register("standup notes from today", spike(0));
        embedder.register("standup automation script", blend_vec(0, 1, 0.8, 0.6));

        let work = add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("standup notes from today").with_category("work"),
        );
        let _tech = add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("standup automation script").with_category("technical"),
        );

        let mut request = SearchRequest::new("standup");
        request.filters.category = Some("work".into());
        let response = run(&conn, &indices, &temporal, &config, &embedder, &request);

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].id, work);
    }

    #[test]
    fn brief_mode_returns_first_line_preview() {
        let (mut conn, mut indices, config, temporal) = setup();
        let mut embedder = MapEmbedder::new();
        let long_content = format!("First line of the note\nSecond line\n{}", "x".repeat(300));
        embedder.register(&long_content, spike(0));
        add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new(long_content.clone()),
        );

        let mut request = SearchRequest::new("first line note");
        request.detail_mode = DetailMode::Brief;
        let response = run(&conn, &indices, &temporal, &config, &embedder, &request);

        let item = &response.results[0];
        assert!(item.content.is_none());
        assert_eq!(item.preview.as_deref(), Some("First line of the note"));
    }

    #[test]
    fn returned_results_are_touched() {
        let (mut conn, mut indices, config, temporal) = setup();
        let mut embedder = MapEmbedder::new();
        embedder.register("trackable note", spike(0));
        let id = add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("trackable note"),
        );

        run(
            &conn,
            &indices,
            &temporal,
            &config,
            &embedder,
            &SearchRequest::new("trackable note"),
        );

        let node = store::get_node(&conn, id).unwrap();
        assert_eq!(node.access_count, 1);
        assert!(node.last_accessed.is_some());
    }

    #[test]
    fn searches_are_logged() {
        let (mut conn, mut indices, config, temporal) = setup();
        let mut embedder = MapEmbedder::new();
        embedder.register("logged note", spike(0));
        add(
            &mut conn,
            &mut indices,
            &config,
            &embedder,
            NoteInput::new("logged note"),
        );

        run(
            &conn,
            &indices,
            &temporal,
            &config,
            &embedder,
            &SearchRequest::new("logged note"),
        );

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM search_logs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn max_results_is_capped() {
        let (mut conn, mut indices, config, temporal) = setup();
        let mut embedder = MapEmbedder::new();
        for i in 0..30 {
            let content = format!("shared topic variation number {i}");
            embedder.register(&content, blend_vec(0, i + 1, 0.7, 0.714));
            add(&mut conn, &mut indices, &config, &embedder, NoteInput::new(content));
        }

        let mut request = SearchRequest::new("shared topic");
        request.limit = Some(100);
        let response = run(&conn, &indices, &temporal, &config, &embedder, &request);
        assert_eq!(response.results.len(), config.retrieval.max_results_cap);
        assert!(response.stats.has_more);

        // an explicit max_results tightens the ceiling below the limit
        request.max_results = Some(3);
        let response = run(&conn, &indices, &temporal, &config, &embedder, &request);
        assert_eq!(response.results.len(), 3);
    }

    #[test]
    fn min_max_normalization() {
        let mut scores: HashMap<i64, f64> = [(1, 2.0), (2, 6.0), (3, 10.0)].into_iter().collect();
        min_max_normalize(&mut scores);
        assert_eq!(scores[&1], 0.0);
        assert_eq!(scores[&2], 0.5);
        assert_eq!(scores[&3], 1.0);

        let mut single: HashMap<i64, f64> = [(1, 3.7)].into_iter().collect();
        min_max_normalize(&mut single);
        assert_eq!(single[&1], 1.0);
    }
}
