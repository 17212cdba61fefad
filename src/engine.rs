//! Thread-safe facade over the graph engine.
//!
//! State splits three ways: the store behind a single writer lock
//! (`Mutex<Connection>`), read-mostly in-memory indices behind an `RwLock`,
//! and stateless inference services shared by all request threads. Inference
//! for ingest runs before the writer lock is taken; maintenance acquires the
//! lock per cycle, and searches that begin after an ingest's success observe
//! that node.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::config::HippoConfig;
use crate::db::{self, migrations, HealthReport, SnapshotToken};
use crate::error::{IngestError, MaintenanceError, RetrieverError, StoreError};
use crate::graph::ann::AnnIndex;
use crate::graph::bm25::Bm25Index;
use crate::graph::cache::{EmbeddingCache, GraphCache};
use crate::graph::ingest::{self, IngestOutcome, NoteInput};
use crate::graph::logger::{self, SearchStatsReport};
use crate::graph::retriever::{self, CancelToken, SearchRequest, SearchResponse};
use crate::graph::sleep::{self, SleepMode, SleepReport, SleepTrigger};
use crate::graph::stats::{self, NodeGraph, StatsResponse};
use crate::graph::temporal::TemporalModel;
use crate::graph::types::{Importance, Node, NoteVersion};
use crate::graph::{store, versions, Indices};
use crate::services::{DateResolver, Embedder, EntityExtractor, Reranker};

/// External collaborators injected at startup.
pub struct EngineServices {
    pub embedder: Arc<dyn Embedder>,
    pub extractor: Arc<dyn EntityExtractor>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub dates: Arc<dyn DateResolver>,
}

pub struct GraphEngine {
    conn: Mutex<Connection>,
    indices: RwLock<Indices>,
    temporal: TemporalModel,
    config: HippoConfig,
    services: EngineServices,
    trigger: SleepTrigger,
    light_pending: AtomicBool,
    snapshot_dir: PathBuf,
}

impl GraphEngine {
    /// Open the engine against the configured database file.
    pub fn open(config: HippoConfig, services: EngineServices) -> Result<Self> {
        let conn = db::open_database(config.resolved_db_path())?;
        let snapshot_dir = config.resolved_snapshot_dir();
        Self::init(conn, config, services, snapshot_dir)
    }

    /// Open against an in-memory database (tests, experiments). Snapshots go
    /// to a temp directory.
    pub fn open_in_memory(config: HippoConfig, services: EngineServices) -> Result<Self> {
        let conn = db::open_memory_database()?;
        let snapshot_dir = std::env::temp_dir().join("hippograph-snapshots");
        Self::init(conn, config, services, snapshot_dir)
    }

    fn init(
        conn: Connection,
        config: HippoConfig,
        services: EngineServices,
        snapshot_dir: PathBuf,
    ) -> Result<Self> {
        let mut indices = Indices {
            ann: AnnIndex::new(services.embedder.dimensions()),
            bm25: Bm25Index::new(config.bm25.k1, config.bm25.b),
            graph: GraphCache::new(),
            vectors: EmbeddingCache::new(),
        };

        // The database is the source of truth: rebuild the vector index when
        // the persisted one disagrees with the store or the embedding model
        // changed.
        let stored_model = migrations::get_embedding_model(&conn)?;
        let node_count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))?;
        let model_matches = stored_model.as_deref() == Some(services.embedder.model_id());
        if !model_matches || indices.ann.count(&conn)? != node_count {
            tracing::info!(
                stored_model = ?stored_model,
                active_model = services.embedder.model_id(),
                "vector index out of sync with store, rebuilding"
            );
            indices.ann.rebuild(&conn)?;
            migrations::set_embedding_model(&conn, services.embedder.model_id())?;
        }

        indices.bm25.rebuild(&conn)?;
        indices.graph.rebuild(&conn)?;
        indices.vectors.rebuild(&conn)?;

        let temporal = TemporalModel::new(&config.temporal);
        let trigger = SleepTrigger::new(config.sleep.light_every_new_nodes);

        Ok(Self {
            conn: Mutex::new(conn),
            indices: RwLock::new(indices),
            temporal,
            config,
            services,
            trigger,
            light_pending: AtomicBool::new(false),
            snapshot_dir,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn indices_read(&self) -> RwLockReadGuard<'_, Indices> {
        self.indices.read().unwrap_or_else(|p| p.into_inner())
    }

    fn indices_write(&self) -> RwLockWriteGuard<'_, Indices> {
        self.indices.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &HippoConfig {
        &self.config
    }

    // ── Ingest API ───────────────────────────────────────────────────────────

    /// Add a note. Inference runs before the writer lock is acquired.
    pub fn add(&self, input: NoteInput) -> Result<IngestOutcome, IngestError> {
        let prepared = ingest::prepare_note(
            self.services.embedder.as_ref(),
            self.services.extractor.as_ref(),
            self.services.dates.as_ref(),
            input,
        )?;

        let outcome = {
            let mut conn = self.conn();
            let mut indices = self.indices_write();
            ingest::commit_note(&mut conn, &mut indices, &self.config, &prepared)?
        };

        if self.trigger.note_added() {
            self.light_pending.store(true, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    /// Update content and/or category. Content changes snapshot the prior
    /// version. Returns the latest version number.
    pub fn update(
        &self,
        id: i64,
        content: Option<&str>,
        category: Option<&str>,
    ) -> Result<u32, IngestError> {
        let mut conn = self.conn();
        let mut indices = self.indices_write();
        ingest::update_note(
            &mut conn,
            &mut indices,
            &self.config,
            self.services.embedder.as_ref(),
            self.services.extractor.as_ref(),
            id,
            content,
            category,
        )
    }

    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let mut indices = self.indices_write();
        ingest::delete_note(&mut conn, &mut indices, id)
    }

    pub fn set_importance(&self, id: i64, importance: Importance) -> Result<(), StoreError> {
        store::set_importance(&self.conn(), id, importance)
    }

    pub fn find_similar(
        &self,
        content: &str,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<(i64, f64)>, IngestError> {
        let conn = self.conn();
        let indices = self.indices_read();
        ingest::find_similar(
            &conn,
            &indices,
            self.services.embedder.as_ref(),
            content,
            limit,
            threshold,
        )
    }

    pub fn get_note(&self, id: i64) -> Result<Node, StoreError> {
        store::get_node(&self.conn(), id)
    }

    pub fn get_history(&self, id: i64) -> Result<Vec<NoteVersion>, StoreError> {
        versions::get_history(&self.conn(), id)
    }

    pub fn restore_version(&self, id: i64, version: u32) -> Result<(), IngestError> {
        let mut conn = self.conn();
        let mut indices = self.indices_write();
        ingest::restore_note_version(
            &mut conn,
            &mut indices,
            self.services.embedder.as_ref(),
            id,
            version,
        )
    }

    // ── Query API ────────────────────────────────────────────────────────────

    pub fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancelToken,
    ) -> Result<SearchResponse, RetrieverError> {
        let conn = self.conn();
        let indices = self.indices_read();
        retriever::search(
            &conn,
            &indices,
            &self.temporal,
            &self.config,
            self.services.embedder.as_ref(),
            self.services.reranker.as_deref(),
            self.services.dates.as_ref(),
            request,
            cancel,
        )
    }

    pub fn stats(&self) -> Result<StatsResponse, StoreError> {
        stats::stats(&self.conn())
    }

    pub fn get_graph(&self, id: i64) -> Result<NodeGraph, StoreError> {
        stats::get_graph(&self.conn(), id)
    }

    // ── Maintenance API ──────────────────────────────────────────────────────

    /// Run a sleep cycle. Refuses to overlap a cycle already in flight.
    pub fn run_sleep(&self, mode: SleepMode, dry_run: bool) -> Result<SleepReport, MaintenanceError> {
        if !self.trigger.try_begin() {
            return Err(MaintenanceError::StepFailed {
                step: "begin",
                cause: "a sleep cycle is already running".into(),
            });
        }
        let result = {
            let mut conn = self.conn();
            let mut indices = self.indices_write();
            sleep::run_sleep(
                &mut conn,
                &mut indices,
                &self.temporal,
                self.services.extractor.as_ref(),
                &self.config,
                &self.snapshot_dir,
                mode,
                dry_run,
            )
        };
        self.trigger.end();
        result
    }

    pub fn search_stats(&self, window_hours: f64) -> Result<SearchStatsReport, StoreError> {
        logger::search_stats(&self.conn(), window_hours)
    }

    pub fn health(&self) -> Result<HealthReport> {
        db::check_database_health(&self.conn())
    }

    /// Point-in-time snapshot of the store.
    pub fn snapshot(&self) -> Result<SnapshotToken> {
        db::snapshot_database(&self.conn(), &self.snapshot_dir)
    }

    /// Restore a snapshot and rebuild every derived index from the database.
    pub fn restore(&self, token: &SnapshotToken) -> Result<()> {
        let mut conn = self.conn();
        let mut indices = self.indices_write();
        db::restore_database(&mut conn, token)?;
        indices.rebuild(&conn).context("index rebuild after restore")?;
        Ok(())
    }

    /// Whether the note counter has tripped a light-sleep request.
    pub fn light_sleep_pending(&self) -> bool {
        self.light_pending.load(Ordering::SeqCst)
    }

    /// Start the background maintenance worker: light sleep when the note
    /// counter trips, deep sleep on the configured interval. Returns a handle
    /// that stops the worker when dropped or on [`SchedulerHandle::stop`].
    pub fn start_scheduler(self: &Arc<Self>) -> Result<SchedulerHandle> {
        let engine = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("hippo-sleep".into())
            .spawn(move || {
                let deep_interval = Duration::from_secs_f64(
                    engine.config.sleep.deep_interval_hours * 3600.0,
                );
                let mut last_deep = Instant::now();

                while !stop_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_secs(1));

                    if engine.light_pending.swap(false, Ordering::SeqCst) {
                        if let Err(e) = engine.run_sleep(SleepMode::Light, false) {
                            tracing::error!(error = %e, "light sleep failed");
                        }
                    }

                    if last_deep.elapsed() >= deep_interval {
                        last_deep = Instant::now();
                        if let Err(e) = engine.run_sleep(SleepMode::Deep, false) {
                            tracing::error!(error = %e, "deep sleep failed");
                        }
                    }
                }
                tracing::info!("sleep scheduler stopped");
            })
            .context("failed to spawn sleep scheduler thread")?;

        Ok(SchedulerHandle {
            stop,
            handle: Some(handle),
        })
    }
}

/// Handle to the background maintenance worker.
pub struct SchedulerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
