//! Core type definitions for the memory graph.
//!
//! Defines [`Importance`] (activation multipliers), [`EdgeKind`] (typed
//! connections), [`Node`] (a full note record), and the entity/version types.

use serde::{Deserialize, Serialize};

/// Retrieval importance of a note, set by the user or by anchor boosting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    /// Anchor notes, identity, key decisions.
    Critical,
    Normal,
    /// Temporary notes, noise.
    Low,
}

impl Importance {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Multiplicative boost applied to the final retrieval score and in
    /// anchor-boost logic.
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Critical => 2.0,
            Self::Normal => 1.0,
            Self::Low => 0.5,
        }
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Importance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(format!("unknown importance: {s}")),
        }
    }
}

/// Type of a graph edge.
///
/// Semantic and entity edges are paired: every (u,v) row has a mirrored (v,u)
/// row of equal weight. Typed relations, consolidation links, and temporal
/// chains are single directed rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Semantic,
    Entity,
    Consolidation,
    TemporalChain,
    /// A named relation produced by the deep-sleep extraction pass
    /// (e.g. `works_at`, `part_of`).
    Relation(String),
}

impl EdgeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Semantic => "semantic",
            Self::Entity => "entity",
            Self::Consolidation => "consolidation",
            Self::TemporalChain => "temporal_chain",
            Self::Relation(name) => name,
        }
    }

    /// Whether edges of this kind are created as mirrored pairs.
    pub fn is_paired(&self) -> bool {
        matches!(self, Self::Semantic | Self::Entity)
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "semantic" => Self::Semantic,
            "entity" => Self::Entity,
            "consolidation" => Self::Consolidation,
            "temporal_chain" => Self::TemporalChain,
            other => Self::Relation(other.to_string()),
        }
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A note record, matching the `nodes` table schema. The embedding is stored
/// alongside but fetched separately.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    /// Stable 64-bit id, assigned monotonically by the store.
    pub id: i64,
    pub content: String,
    pub category: String,
    pub importance: Importance,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 timestamp of the last recall, or `None` if never accessed.
    pub last_accessed: Option<String>,
    pub access_count: u32,
    pub emotional_tone: Option<String>,
    /// Emotional intensity in [0, 10].
    pub emotional_intensity: i64,
    pub emotional_reflection: Option<String>,
    /// Start of the event-time range, independent of creation time.
    pub t_event_start: Option<String>,
    pub t_event_end: Option<String>,
    /// Recomputed by sleep-time maintenance; normalized to [0, 1].
    pub pagerank: f64,
    /// Community assigned by deep sleep; `None` for isolated nodes.
    pub community_id: Option<i64>,
}

/// A directed weighted edge row.
#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub source_id: i64,
    pub target_id: i64,
    pub kind: EdgeKind,
    /// Weight in [0, 1].
    pub weight: f64,
    pub created_at: String,
    pub last_touched_at: String,
}

/// A canonical extracted concept.
#[derive(Debug, Clone, Serialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub entity_type: String,
}

/// One immutable content snapshot of a note.
#[derive(Debug, Clone, Serialize)]
pub struct NoteVersion {
    pub version: u32,
    pub content: String,
    pub category: String,
    pub importance: Importance,
    pub emotional_tone: Option<String>,
    pub emotional_intensity: Option<i64>,
    pub emotional_reflection: Option<String>,
    pub created_at: String,
}

/// An outgoing neighbor as seen through the graph cache or `neighbors()`.
#[derive(Debug, Clone, Serialize)]
pub struct Neighbor {
    pub id: i64,
    pub weight: f64,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
}
