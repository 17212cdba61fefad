//! `hippograph doctor` — database health check.

use anyhow::Result;

use crate::config::HippoConfig;

pub fn doctor(config: &HippoConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    println!("Database: {}", db_path.display());

    let conn = crate::db::open_database(&db_path)?;
    let report = crate::db::check_database_health(&conn)?;

    println!(
        "Integrity:       {}",
        if report.integrity_ok {
            "ok".to_string()
        } else {
            report.integrity_details.clone()
        }
    );
    println!("Schema version:  {}", report.schema_version);
    println!(
        "Embedding model: {}",
        report.embedding_model.as_deref().unwrap_or("(not set)")
    );
    println!("sqlite-vec:      {}", report.sqlite_vec_version);
    println!("Nodes:           {}", report.node_count);
    println!("Edges:           {}", report.edge_count);
    println!("Entities:        {}", report.entity_count);
    println!("Vectors:         {}", report.vec_count);
    println!("Search logs:     {}", report.search_log_count);

    if report.vec_count != report.node_count {
        println!(
            "\nNote: vector index has {} entries for {} nodes — it will be \
             rebuilt on next engine start.",
            report.vec_count, report.node_count
        );
    }

    Ok(())
}
