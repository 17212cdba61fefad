use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HippoConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
    pub blend: BlendConfig,
    pub spread: SpreadConfig,
    pub bm25: Bm25Config,
    pub temporal: TemporalConfig,
    pub dup: DedupConfig,
    pub rerank: RerankConfig,
    pub hub: HubConfig,
    pub sleep: SleepConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Directory for sleep-cycle snapshots. Defaults to `<db dir>/snapshots`.
    pub snapshot_dir: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Default number of results per search.
    pub default_max_results: usize,
    /// Hard cap on `max_results`.
    pub max_results_cap: usize,
    /// ANN candidates seeding spreading activation (N).
    pub ann_candidates: usize,
    /// Minimum cosine similarity for an automatic semantic link at ingest.
    pub semantic_link_threshold: f64,
    /// Maximum semantic edges created per new note.
    pub max_semantic_links: usize,
    /// Whether `update` re-runs entity extraction when content changes.
    pub reextract_on_update: bool,
}

/// Weights for the blended score `α·semantic + β·activation + γ·bm25 + δ·temporal`.
///
/// δ applies only when the query carries a temporal signal; otherwise it is
/// redistributed to α.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct BlendConfig {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub delta: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SpreadConfig {
    pub iterations: usize,
    pub decay: f64,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct Bm25Config {
    pub k1: f64,
    pub b: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TemporalConfig {
    pub half_life_days: f64,
    /// Identity-defining categories: exempt from recency decay and from
    /// stale-edge decay of incident edges.
    pub anchor_categories: Vec<String>,
    /// Per-category multipliers (≤ 1.0) applied to the decay exponent.
    pub category_multipliers: HashMap<String, f64>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct DedupConfig {
    /// Cosine similarity at or above which ingest is blocked.
    pub block_threshold: f64,
    /// Cosine similarity at or above which ingest succeeds with a warning.
    pub warn_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RerankConfig {
    pub enabled: bool,
    /// Weight of the reranker score in the final blend.
    pub weight: f64,
    /// Number of top candidates passed to the cross-encoder.
    pub top_n: usize,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct HubConfig {
    /// Notes with more linked entities than this are penalized during spreading.
    pub threshold: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SleepConfig {
    /// Light sleep triggers after this many new nodes.
    pub light_every_new_nodes: usize,
    /// Deep sleep interval in hours.
    pub deep_interval_hours: f64,
    /// Edges untouched for longer than this decay during light sleep.
    pub stale_edge_days: i64,
    pub stale_decay_factor: f64,
    /// Sliding-window width for the near-duplicate scan.
    pub dup_scan_window: usize,
    /// Minimum pairwise similarity for a thematic consolidation cluster.
    pub consolidation_similarity: f64,
    /// Maximum day gap between notes in a temporal chain.
    pub chain_max_gap_days: i64,
}

/// Per-phase soft budgets in milliseconds. Optional signals are skipped when
/// the remaining total budget cannot cover them.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct TimeoutConfig {
    pub embed_ms: u64,
    pub ann_ms: u64,
    pub bm25_ms: u64,
    pub rerank_ms: u64,
    pub total_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_hippo_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            snapshot_dir: None,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_max_results: 5,
            max_results_cap: 20,
            ann_candidates: 50,
            semantic_link_threshold: 0.5,
            max_semantic_links: 5,
            reextract_on_update: true,
        }
    }
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta: 0.10,
            gamma: 0.15,
            delta: 0.15,
        }
    }
}

impl Default for SpreadConfig {
    fn default() -> Self {
        Self {
            iterations: 3,
            decay: 0.7,
        }
    }
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            anchor_categories: vec![
                "self-reflection".into(),
                "milestone".into(),
                "security".into(),
                "relational-context".into(),
            ],
            category_multipliers: HashMap::new(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            block_threshold: 0.95,
            warn_threshold: 0.90,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 0.3,
            top_n: 20,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { threshold: 20 }
    }
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            light_every_new_nodes: 50,
            deep_interval_hours: 24.0,
            stale_edge_days: 90,
            stale_decay_factor: 0.95,
            dup_scan_window: 50,
            consolidation_similarity: 0.75,
            chain_max_gap_days: 7,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            embed_ms: 500,
            ann_ms: 100,
            bm25_ms: 100,
            rerank_ms: 300,
            total_ms: 2000,
        }
    }
}

/// Returns `~/.hippograph/`
pub fn default_hippo_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".hippograph")
}

/// Returns the default config file path: `~/.hippograph/config.toml`
pub fn default_config_path() -> PathBuf {
    default_hippo_dir().join("config.toml")
}

impl HippoConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            HippoConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (HIPPO_DB, HIPPO_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("HIPPO_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("HIPPO_LOG_LEVEL") {
            self.server.log_level = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Resolve the snapshot directory, defaulting to a sibling of the database.
    pub fn resolved_snapshot_dir(&self) -> PathBuf {
        match &self.storage.snapshot_dir {
            Some(dir) => expand_tilde(dir),
            None => {
                let db = self.resolved_db_path();
                db.parent()
                    .map(|p| p.join("snapshots"))
                    .unwrap_or_else(|| PathBuf::from("snapshots"))
            }
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
