pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::backup::Backup;
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the HippoGraph database at the given path, with the vec
/// extension loaded and schema initialized.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path).with_context(|| {
        format!(
            "failed to open database at {}. If the file is corrupt, \
             restore from a snapshot under the snapshots/ directory.",
            path.display()
        )
    })?;

    // WAL for concurrent readers against a consistent snapshot
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // Wait up to 5 seconds for locks instead of failing immediately
    conn.pragma_update(None, "busy_timeout", "5000")?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        anyhow::bail!("database integrity check failed: {integrity}");
    }

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open an in-memory database with schema and migrations applied.
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    Ok(conn)
}

/// Opaque handle to a point-in-time copy of the database.
///
/// Produced by [`snapshot_database`]; pass back to [`restore_database`] to
/// return the store to the captured state. The token is the path of the
/// snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotToken(pub PathBuf);

impl std::fmt::Display for SnapshotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Copy the live database into `dir` using the SQLite online backup API.
///
/// The copy captures nodes, edges, entities, versions, the search log, and
/// the vec0 index in one consistent unit.
pub fn snapshot_database(conn: &Connection, dir: &Path) -> Result<SnapshotToken> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create snapshot dir {}", dir.display()))?;

    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let path = dir.join(format!("snapshot-{stamp}.db"));

    load_sqlite_vec();
    let mut dest = Connection::open(&path)
        .with_context(|| format!("failed to create snapshot at {}", path.display()))?;
    {
        let backup = Backup::new(conn, &mut dest).context("backup init failed")?;
        backup
            .run_to_completion(64, Duration::from_millis(50), None)
            .context("backup failed")?;
    }

    tracing::info!(snapshot = %path.display(), "database snapshot written");
    Ok(SnapshotToken(path))
}

/// Restore the live database from a snapshot token.
///
/// The caller must rebuild every derived in-memory index afterwards; the
/// database is the source of truth.
pub fn restore_database(conn: &mut Connection, token: &SnapshotToken) -> Result<()> {
    load_sqlite_vec();
    let src = Connection::open(&token.0)
        .with_context(|| format!("failed to open snapshot {}", token.0.display()))?;
    {
        let backup = Backup::new(&src, conn).context("restore init failed")?;
        backup
            .run_to_completion(64, Duration::from_millis(50), None)
            .context("restore failed")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;

    tracing::info!(snapshot = %token.0.display(), "database restored from snapshot");
    Ok(())
}

/// Result of a full database health check.
pub struct HealthReport {
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub sqlite_vec_version: String,
    pub node_count: i64,
    pub edge_count: i64,
    pub entity_count: i64,
    pub vec_count: i64,
    pub search_log_count: i64,
}

/// Run a comprehensive health check on the database.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version =
        migrations::get_schema_version(conn).context("failed to read schema version")?;
    let embedding_model =
        migrations::get_embedding_model(conn).context("failed to read embedding model")?;

    let integrity_details: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .context("failed to run integrity check")?;
    let integrity_ok = integrity_details == "ok";

    let sqlite_vec_version: String = conn
        .query_row("SELECT vec_version()", [], |row| row.get(0))
        .context("failed to get sqlite-vec version")?;

    let count = |sql: &str| -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap_or(0)
    };

    Ok(HealthReport {
        schema_version,
        embedding_model,
        integrity_ok,
        integrity_details,
        sqlite_vec_version,
        node_count: count("SELECT COUNT(*) FROM nodes"),
        edge_count: count("SELECT COUNT(*) FROM edges"),
        entity_count: count("SELECT COUNT(*) FROM entities"),
        vec_count: count("SELECT COUNT(*) FROM nodes_vec"),
        search_log_count: count("SELECT COUNT(*) FROM search_logs"),
    })
}
