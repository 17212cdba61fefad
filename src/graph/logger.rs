//! Search quality monitoring — per-query logging and latency aggregation.
//!
//! Every search writes one row: query text and a stable hash, parameters,
//! per-phase latency breakdown, result counts, and degradation flags. Writes
//! are best-effort; a logging failure never fails the search.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

use crate::error::StoreError;

/// Stable FNV-1a 64-bit hash over the normalized (lowercased,
/// whitespace-collapsed) query text.
pub fn query_hash(query: &str) -> u64 {
    let normalized = query.to_lowercase();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in normalized.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

/// Phase timer: call [`SearchTimer::mark`] as each pipeline phase completes.
pub struct SearchTimer {
    start: Instant,
    phase_start: Instant,
    marks: HashMap<&'static str, f64>,
}

impl SearchTimer {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            phase_start: now,
            marks: HashMap::new(),
        }
    }

    /// Record the elapsed time since the previous mark under `phase`.
    pub fn mark(&mut self, phase: &'static str) {
        let now = Instant::now();
        let ms = now.duration_since(self.phase_start).as_secs_f64() * 1000.0;
        self.marks.insert(phase, ms);
        self.phase_start = now;
    }

    pub fn get(&self, phase: &str) -> f64 {
        self.marks.get(phase).copied().unwrap_or(0.0)
    }

    /// Total elapsed milliseconds since the timer started.
    pub fn total_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Per-phase durations surfaced in search responses and the log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseDurations {
    pub total_ms: f64,
    pub embedding_ms: f64,
    pub ann_ms: f64,
    pub spreading_ms: f64,
    pub bm25_ms: f64,
    pub temporal_ms: f64,
    pub rerank_ms: f64,
    pub filters_ms: f64,
}

impl PhaseDurations {
    pub fn from_timer(timer: &SearchTimer) -> Self {
        Self {
            total_ms: timer.total_ms(),
            embedding_ms: timer.get("embedding"),
            ann_ms: timer.get("ann"),
            spreading_ms: timer.get("spreading"),
            bm25_ms: timer.get("bm25"),
            temporal_ms: timer.get("temporal"),
            rerank_ms: timer.get("rerank"),
            filters_ms: timer.get("filters"),
        }
    }
}

/// One completed search, ready to log.
pub struct SearchLogRecord<'a> {
    pub query: &'a str,
    pub query_cleaned: Option<&'a str>,
    pub is_temporal: bool,
    pub temporal_direction: Option<&'static str>,
    pub limit_requested: usize,
    pub category_filter: Option<&'a str>,
    pub time_after: Option<&'a str>,
    pub time_before: Option<&'a str>,
    pub entity_type_filter: Option<&'a str>,
    pub detail_mode: &'a str,
    pub results_count: usize,
    pub total_activated: usize,
    pub top1_score: Option<f64>,
    pub top1_node_id: Option<i64>,
    pub durations: PhaseDurations,
    pub blend: (f64, f64, f64, f64),
    pub bm25_matches: usize,
    pub temporal_matches: usize,
    pub rerank_applied: bool,
    pub degraded: bool,
}

/// Write one search log row. Best-effort: failures are logged and swallowed.
pub fn log_search(conn: &Connection, record: &SearchLogRecord<'_>) {
    let result = conn.execute(
        "INSERT INTO search_logs (
            timestamp, query, query_hash, query_cleaned, is_temporal, temporal_direction,
            limit_requested, category_filter, time_after, time_before,
            entity_type_filter, detail_mode,
            results_count, total_activated, top1_score, top1_node_id,
            latency_total_ms, latency_embedding_ms, latency_ann_ms, latency_spreading_ms,
            latency_bm25_ms, latency_temporal_ms, latency_rerank_ms, latency_filters_ms,
            blend_alpha, blend_beta, blend_gamma, blend_delta,
            bm25_matches, temporal_matches, rerank_applied, degraded
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                  ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32)",
        params![
            chrono::Utc::now().to_rfc3339(),
            record.query,
            format!("{:016x}", query_hash(record.query)),
            record.query_cleaned,
            record.is_temporal as i64,
            record.temporal_direction,
            record.limit_requested as i64,
            record.category_filter,
            record.time_after,
            record.time_before,
            record.entity_type_filter,
            record.detail_mode,
            record.results_count as i64,
            record.total_activated as i64,
            record.top1_score,
            record.top1_node_id,
            record.durations.total_ms,
            record.durations.embedding_ms,
            record.durations.ann_ms,
            record.durations.spreading_ms,
            record.durations.bm25_ms,
            record.durations.temporal_ms,
            record.durations.rerank_ms,
            record.durations.filters_ms,
            record.blend.0,
            record.blend.1,
            record.blend.2,
            record.blend.3,
            record.bm25_matches as i64,
            record.temporal_matches as i64,
            record.rerank_applied as i64,
            record.degraded as i64,
        ],
    );
    if let Err(e) = result {
        tracing::warn!(error = %e, "search log write failed");
    }
}

/// Aggregate search statistics over a sliding window.
#[derive(Debug, Serialize)]
pub struct SearchStatsReport {
    pub window_hours: f64,
    pub total_searches: usize,
    pub zero_results: usize,
    pub zero_result_rate: f64,
    pub degraded_searches: usize,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub avg_phase_ms: HashMap<String, f64>,
    pub recent_zero_queries: Vec<String>,
}

/// Percentiles and zero-result rate over the last `window_hours` of searches.
pub fn search_stats(conn: &Connection, window_hours: f64) -> Result<SearchStatsReport, StoreError> {
    let cutoff =
        (chrono::Utc::now() - chrono::Duration::seconds((window_hours * 3600.0) as i64)).to_rfc3339();

    let mut stmt = conn.prepare(
        "SELECT latency_total_ms, results_count, degraded FROM search_logs \
         WHERE timestamp >= ?1 ORDER BY latency_total_ms",
    )?;
    let rows: Vec<(f64, i64, i64)> = stmt
        .query_map(params![cutoff], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let total = rows.len();
    let zero_results = rows.iter().filter(|(_, count, _)| *count == 0).count();
    let degraded_searches = rows.iter().filter(|(_, _, d)| *d != 0).count();
    let latencies: Vec<f64> = rows.iter().map(|(ms, _, _)| *ms).collect();

    let percentile = |p: f64| -> Option<f64> {
        if latencies.is_empty() {
            return None;
        }
        let idx = ((latencies.len() as f64 * p) as usize).min(latencies.len() - 1);
        Some(latencies[idx])
    };

    let mut avg_phase_ms = HashMap::new();
    if total > 0 {
        let row: (f64, f64, f64, f64, f64, f64) = conn.query_row(
            "SELECT AVG(latency_embedding_ms), AVG(latency_ann_ms), AVG(latency_spreading_ms), \
             AVG(latency_bm25_ms), AVG(latency_temporal_ms), AVG(latency_rerank_ms) \
             FROM search_logs WHERE timestamp >= ?1",
            params![cutoff],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )?;
        avg_phase_ms.insert("embedding".into(), row.0);
        avg_phase_ms.insert("ann".into(), row.1);
        avg_phase_ms.insert("spreading".into(), row.2);
        avg_phase_ms.insert("bm25".into(), row.3);
        avg_phase_ms.insert("temporal".into(), row.4);
        avg_phase_ms.insert("rerank".into(), row.5);
    }

    let mut stmt = conn.prepare(
        "SELECT query FROM search_logs WHERE results_count = 0 \
         ORDER BY timestamp DESC LIMIT 10",
    )?;
    let recent_zero_queries = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SearchStatsReport {
        window_hours,
        total_searches: total,
        zero_results,
        zero_result_rate: if total > 0 {
            zero_results as f64 / total as f64
        } else {
            0.0
        },
        degraded_searches,
        latency_p50_ms: percentile(0.50),
        latency_p95_ms: percentile(0.95),
        latency_p99_ms: percentile(0.99),
        latency_max_ms: latencies.last().copied(),
        avg_phase_ms,
        recent_zero_queries,
    })
}
