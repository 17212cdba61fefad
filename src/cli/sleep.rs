//! `hippograph sleep` — run a maintenance cycle from the command line.

use anyhow::Result;

use crate::config::HippoConfig;
use crate::graph::ann::AnnIndex;
use crate::graph::bm25::Bm25Index;
use crate::graph::cache::{EmbeddingCache, GraphCache};
use crate::graph::sleep::{run_sleep, SleepMode};
use crate::graph::temporal::TemporalModel;
use crate::graph::Indices;
use crate::services::{DisabledExtractor, EMBEDDING_DIM};

/// Run one light or deep sleep cycle.
///
/// The relation-extraction step of deep sleep needs the external extractor;
/// from the CLI it runs disabled and reports zero relations.
pub fn sleep(config: &HippoConfig, deep: bool, dry_run: bool) -> Result<()> {
    let mut conn = crate::db::open_database(config.resolved_db_path())?;

    let mut indices = Indices {
        ann: AnnIndex::new(EMBEDDING_DIM),
        bm25: Bm25Index::new(config.bm25.k1, config.bm25.b),
        graph: GraphCache::new(),
        vectors: EmbeddingCache::new(),
    };
    indices.bm25.rebuild(&conn)?;
    indices.graph.rebuild(&conn)?;
    indices.vectors.rebuild(&conn)?;

    let temporal = TemporalModel::new(&config.temporal);
    let mode = if deep { SleepMode::Deep } else { SleepMode::Light };

    let report = run_sleep(
        &mut conn,
        &mut indices,
        &temporal,
        &DisabledExtractor,
        config,
        &config.resolved_snapshot_dir(),
        mode,
        dry_run,
    )?;

    println!(
        "{} sleep{}: {} steps",
        report.mode,
        if report.dry_run { " (dry run)" } else { "" },
        report.steps.len()
    );
    println!("{:<22} {:>8} {:>10}", "Step", "Changes", "Duration");
    println!("{}", "-".repeat(44));
    for step in &report.steps {
        println!(
            "{:<22} {:>8} {:>8.1}ms",
            step.name, step.changes, step.duration_ms
        );
    }

    Ok(())
}
