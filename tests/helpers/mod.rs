#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hippograph::config::HippoConfig;
use hippograph::engine::{EngineServices, GraphEngine};
use hippograph::graph::l2_normalize;
use hippograph::services::{
    DateResolver, DisabledExtractor, Embedder, EntityExtractor, ExtractedEntity, EMBEDDING_DIM,
};

/// Deterministic test embedder: returns registered vectors for known texts,
/// and a length-keyed spike for everything else.
pub struct MapEmbedder {
    map: Mutex<HashMap<String, Vec<f32>>>,
}

impl MapEmbedder {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, text: &str, mut v: Vec<f32>) {
        l2_normalize(&mut v);
        self.map.lock().unwrap().insert(text.to_string(), v);
    }
}

impl Embedder for MapEmbedder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(v) = self.map.lock().unwrap().get(text) {
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

/// Extractor that reports a fixed set of keyword entities.
pub struct KeywordExtractor {
    pub keywords: Vec<(&'static str, &'static str)>,
}

impl EntityExtractor for KeywordExtractor {
    fn extract(&self, text: &str) -> Vec<ExtractedEntity> {
        self.keywords
            .iter()
            .filter(|(surface, _)| text.to_lowercase().contains(&surface.to_lowercase()))
            .map(|(surface, entity_type)| ExtractedEntity {
                surface: surface.to_string(),
                entity_type: entity_type.to_string(),
                confidence: 0.9,
            })
            .collect()
    }
}

/// Date resolver with a fixed table of phrase → range mappings.
pub struct StubDateResolver {
    pub ranges: Vec<(&'static str, &'static str, &'static str)>,
}

impl DateResolver for StubDateResolver {
    fn resolve(&self, text: &str, _base: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        for (phrase, start, end) in &self.ranges {
            if text.contains(phrase) {
                let start = DateTime::parse_from_rfc3339(start).ok()?.with_timezone(&Utc);
                let end = DateTime::parse_from_rfc3339(end).ok()?.with_timezone(&Utc);
                return Some((start, end));
            }
        }
        None
    }
}

/// A unit spike along one embedding dimension.
pub fn spike(dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[dim % EMBEDDING_DIM] = 1.0;
    v
}

/// Two-dimensional blend; `register` normalizes it.
pub fn blend(a: usize, b: usize, wa: f32, wb: f32) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    v[a] = wa;
    v[b] = wb;
    v
}

/// In-memory engine with a shared [`MapEmbedder`] and otherwise disabled
/// services.
pub fn test_engine(embedder: Arc<MapEmbedder>) -> GraphEngine {
    test_engine_with(embedder, HippoConfig::default())
}

pub fn test_engine_with(embedder: Arc<MapEmbedder>, config: HippoConfig) -> GraphEngine {
    let services = EngineServices {
        embedder,
        extractor: Arc::new(DisabledExtractor),
        reranker: None,
        dates: Arc::new(hippograph::services::DisabledDateResolver),
    };
    GraphEngine::open_in_memory(config, services).unwrap()
}
