//! Contracts for the external collaborators the core consumes.
//!
//! The embedding model, named-entity recognizer, cross-encoder reranker, and
//! date parser all live outside this crate. Each is a narrow trait with a
//! disabled variant, so call sites branch on presence rather than subtype.
//! All methods are synchronous; implementations are shared immutable
//! resources safe for concurrent inference.

use anyhow::Result;
use chrono::{DateTime, Utc};

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2 family).
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`EMBEDDING_DIM`]
/// dimensions, deterministic for equal inputs. Transient failures are allowed;
/// the retriever degrades to BM25 + temporal when encoding fails.
pub trait Embedder: Send + Sync {
    /// Embed a single text string into a unit vector.
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Identifier of the underlying model, persisted in `schema_meta` so a
    /// model swap forces a vector-index rebuild.
    fn model_id(&self) -> &str;

    /// Return the number of dimensions this embedder produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// A surface form extracted from note text, before canonicalization.
#[derive(Debug, Clone)]
pub struct ExtractedEntity {
    pub surface: String,
    pub entity_type: String,
    pub confidence: f32,
}

/// A typed relation between two surface forms, produced during deep sleep.
#[derive(Debug, Clone)]
pub struct RelationTriple {
    pub subject: String,
    pub relation: String,
    pub object: String,
}

/// Named-entity recognizer contract.
///
/// Total function: returns an empty list when extraction fails.
pub trait EntityExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<ExtractedEntity>;

    /// Typed-relation extraction for the deep-sleep pass. Extractors without
    /// relation support return nothing.
    fn extract_relations(&self, _text: &str) -> Vec<RelationTriple> {
        Vec::new()
    }
}

/// Cross-encoder reranker contract.
///
/// Optional collaborator; absence is handled by the retriever. Scores are
/// relative within one call and get min-max normalized before blending.
pub trait Reranker: Send + Sync {
    fn score(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>>;
}

/// Date parser contract: resolves temporal expressions in text to an
/// absolute event-time range relative to `base`.
pub trait DateResolver: Send + Sync {
    fn resolve(&self, text: &str, base: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)>;
}

/// Extractor that never finds anything. Ingest still succeeds; notes simply
/// get no entity links.
pub struct DisabledExtractor;

impl EntityExtractor for DisabledExtractor {
    fn extract(&self, _text: &str) -> Vec<ExtractedEntity> {
        Vec::new()
    }
}

/// Date resolver that never resolves. Event times stay unset and temporal
/// overlap scores zero.
pub struct DisabledDateResolver;

impl DateResolver for DisabledDateResolver {
    fn resolve(
        &self,
        _text: &str,
        _base: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        None
    }
}
