//! `hippograph stats` and `hippograph search-stats`.

use anyhow::Result;

use crate::config::HippoConfig;
use crate::graph::logger;

/// Print store statistics: node/edge/entity counts, categories, top PageRank.
pub fn stats(config: &HippoConfig) -> Result<()> {
    let conn = crate::db::open_database(config.resolved_db_path())?;
    let s = crate::graph::stats::stats(&conn)?;

    println!("Nodes:      {}", s.nodes);
    println!("Edges:      {}", s.edges);
    println!("Entities:   {}", s.entities);
    println!("Communities: {}", s.communities);

    if !s.nodes_by_category.is_empty() {
        println!("\nBy category:");
        let mut categories: Vec<_> = s.nodes_by_category.iter().collect();
        categories.sort_by(|a, b| b.1.cmp(a.1));
        for (category, count) in categories {
            println!("  {category:<24} {count}");
        }
    }

    if !s.edges_by_type.is_empty() {
        println!("\nBy edge type:");
        let mut types: Vec<_> = s.edges_by_type.iter().collect();
        types.sort_by(|a, b| b.1.cmp(a.1));
        for (edge_type, count) in types {
            println!("  {edge_type:<24} {count}");
        }
    }

    if !s.top_pagerank.is_empty() {
        println!("\nTop PageRank:");
        for entry in &s.top_pagerank {
            println!("  #{:<6} {:.4}  {}", entry.id, entry.pagerank, entry.preview);
        }
    }

    Ok(())
}

/// Print search quality aggregates over a sliding window.
pub fn search_stats(config: &HippoConfig, window_hours: f64) -> Result<()> {
    let conn = crate::db::open_database(config.resolved_db_path())?;
    let report = logger::search_stats(&conn, window_hours)?;

    println!("Searches (last {window_hours}h): {}", report.total_searches);
    println!(
        "Zero results:  {} ({:.1}%)",
        report.zero_results,
        report.zero_result_rate * 100.0
    );
    println!("Degraded:      {}", report.degraded_searches);

    if let (Some(p50), Some(p95), Some(p99)) = (
        report.latency_p50_ms,
        report.latency_p95_ms,
        report.latency_p99_ms,
    ) {
        println!("\nLatency: p50 {p50:.1}ms  p95 {p95:.1}ms  p99 {p99:.1}ms");
    }

    if !report.avg_phase_ms.is_empty() {
        println!("\nAverage phase latency:");
        let mut phases: Vec<_> = report.avg_phase_ms.iter().collect();
        phases.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (phase, ms) in phases {
            println!("  {phase:<12} {ms:.1}ms");
        }
    }

    if !report.recent_zero_queries.is_empty() {
        println!("\nRecent zero-result queries:");
        for query in &report.recent_zero_queries {
            println!("  {query}");
        }
    }

    Ok(())
}
