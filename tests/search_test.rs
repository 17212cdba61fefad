//! Read-path integration: hybrid ranking, temporal decomposition, importance
//! ordering, and reranking.

mod helpers;

use std::sync::Arc;

use helpers::{blend, spike, test_engine, MapEmbedder, StubDateResolver};
use hippograph::config::HippoConfig;
use hippograph::engine::{EngineServices, GraphEngine};
use hippograph::error::RetrieverError;
use hippograph::graph::ingest::NoteInput;
use hippograph::graph::retriever::{CancelToken, SearchRequest};
use hippograph::graph::types::Importance;
use hippograph::services::{DisabledExtractor, Reranker};

#[test]
fn empty_query_is_rejected() {
    let engine = test_engine(Arc::new(MapEmbedder::new()));
    let result = engine.search(&SearchRequest::new(""), &CancelToken::new());
    assert!(matches!(result, Err(RetrieverError::EmptyQuery)));
}

#[test]
fn spreading_activation_surfaces_a_neighbor() {
    let embedder = Arc::new(MapEmbedder::new());
    embedder.register("Python debugging with pdb", spike(0));
    embedder.register("Python logging best practices", blend(0, 1, 0.8, 0.6));
    embedder.register("Baking sourdough bread", spike(200));
    embedder.register("debugging tools in Python", blend(0, 1, 0.95, 0.31));
    let engine = test_engine(Arc::clone(&embedder));

    let n1 = engine.add(NoteInput::new("Python debugging with pdb")).unwrap();
    let n2 = engine
        .add(NoteInput::new("Python logging best practices"))
        .unwrap();
    let n3 = engine.add(NoteInput::new("Baking sourdough bread")).unwrap();

    let response = engine
        .search(
            &SearchRequest::new("debugging tools in Python"),
            &CancelToken::new(),
        )
        .unwrap();

    let ids: Vec<i64> = response.results.iter().map(|r| r.id).collect();
    assert_eq!(ids[0], n1.id);
    assert_eq!(ids[1], n2.id);
    assert!(response.results[0].score > response.results[1].score);

    // The unrelated note, if present at all, scores below 0.1
    if let Some(bread) = response.results.iter().find(|r| r.id == n3.id) {
        assert!(bread.score < 0.1, "sourdough scored {}", bread.score);
        assert!(response.results[1].score > bread.score);
    }

    // The logging note is connected through a semantic edge, so it carries
    // activation even though the query embedding favors the pdb note
    assert!(response.results[1].signals.activation > 0.0);
}

#[test]
fn temporal_queries_are_decomposed_and_ordered() {
    let embedder = Arc::new(MapEmbedder::new());
    embedder.register("Started project", spike(0));
    embedder.register("Finished project", spike(1));
    // the stripped form of both temporal queries, equidistant from each note
    embedder.register("happened in this project", blend(0, 1, 1.0, 1.0));

    let services = EngineServices {
        embedder: Arc::clone(&embedder) as Arc<dyn hippograph::services::Embedder>,
        extractor: Arc::new(DisabledExtractor),
        reranker: None,
        dates: Arc::new(StubDateResolver {
            ranges: vec![
                (
                    "Started project",
                    "2026-01-05T00:00:00+00:00",
                    "2026-01-05T23:59:59+00:00",
                ),
                (
                    "Finished project",
                    "2026-02-10T00:00:00+00:00",
                    "2026-02-10T23:59:59+00:00",
                ),
            ],
        }),
    };
    let engine = GraphEngine::open_in_memory(HippoConfig::default(), services).unwrap();

    let started = engine.add(NoteInput::new("Started project")).unwrap();
    let finished = engine.add(NoteInput::new("Finished project")).unwrap();

    // event times were resolved at ingest
    assert!(engine.get_note(started.id).unwrap().t_event_start.is_some());

    // "first" → earliest: the January note wins
    let response = engine
        .search(
            &SearchRequest::new("what happened first in this project?"),
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(response.results[0].id, started.id);
    assert!(response.results[0].signals.temporal > 0.0);

    // "last" → latest: the February note wins
    let response = engine
        .search(
            &SearchRequest::new("what happened last in this project?"),
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(response.results[0].id, finished.id);
}

#[test]
fn critical_importance_ranks_above_normal() {
    let embedder = Arc::new(MapEmbedder::new());
    embedder.register("deploy checklist for the api", blend(0, 1, 0.9, 0.436));
    embedder.register("deploy checklist for the web", blend(0, 2, 0.9, 0.436));
    embedder.register("deploy checklist", spike(0));
    let engine = test_engine(Arc::clone(&embedder));

    let n1 = engine
        .add(NoteInput::new("deploy checklist for the api"))
        .unwrap();
    let n2 = engine
        .add(NoteInput::new("deploy checklist for the web"))
        .unwrap();
    engine.set_importance(n1.id, Importance::Critical).unwrap();

    let response = engine
        .search(&SearchRequest::new("deploy checklist"), &CancelToken::new())
        .unwrap();

    let critical = response.results.iter().find(|r| r.id == n1.id).unwrap();
    let normal = response.results.iter().find(|r| r.id == n2.id).unwrap();
    assert!(critical.score > normal.score);
    // identical signals and age: the gap is the 2.0 multiplier
    assert!((critical.score / normal.score - 2.0).abs() < 0.05);
}

#[test]
fn reranker_reorders_the_blend() {
    /// Scores texts by whether they contain the literal query.
    struct ContainsReranker;
    impl Reranker for ContainsReranker {
        fn score(&self, query: &str, texts: &[&str]) -> anyhow::Result<Vec<f32>> {
            Ok(texts
                .iter()
                .map(|t| if t.contains(query) { 1.0 } else { 0.0 })
                .collect())
        }
    }

    let embedder = Arc::new(MapEmbedder::new());
    embedder.register("migration plan overview", blend(0, 1, 0.9, 0.436));
    embedder.register("notes that mention the exact phrase", blend(0, 2, 0.88, 0.475));
    let services = EngineServices {
        embedder: Arc::clone(&embedder) as Arc<dyn hippograph::services::Embedder>,
        extractor: Arc::new(DisabledExtractor),
        reranker: Some(Arc::new(ContainsReranker)),
        dates: Arc::new(hippograph::services::DisabledDateResolver),
    };
    let engine = GraphEngine::open_in_memory(HippoConfig::default(), services).unwrap();

    let plain = engine.add(NoteInput::new("migration plan overview")).unwrap();
    let exact = engine
        .add(NoteInput::new("notes that mention the exact phrase"))
        .unwrap();

    embedder.register("exact phrase", spike(0));
    let response = engine
        .search(&SearchRequest::new("exact phrase"), &CancelToken::new())
        .unwrap();

    let exact_item = response.results.iter().find(|r| r.id == exact.id).unwrap();
    let plain_item = response.results.iter().find(|r| r.id == plain.id).unwrap();
    assert!(exact_item.score > plain_item.score);
    assert_eq!(exact_item.signals.rerank, Some(1.0));
    assert_eq!(plain_item.signals.rerank, Some(0.0));
}

#[test]
fn brief_mode_estimates_fewer_tokens() {
    let embedder = Arc::new(MapEmbedder::new());
    let long = format!("Summary line\n{}", "body ".repeat(200));
    embedder.register(&long, spike(0));
    let engine = test_engine(Arc::clone(&embedder));
    engine.add(NoteInput::new(long)).unwrap();

    embedder.register("summary", spike(0));
    let full = engine
        .search(&SearchRequest::new("summary"), &CancelToken::new())
        .unwrap();

    let mut brief_request = SearchRequest::new("summary");
    brief_request.detail_mode = hippograph::graph::retriever::DetailMode::Brief;
    let brief = engine.search(&brief_request, &CancelToken::new()).unwrap();

    assert!(brief.stats.estimated_tokens < full.stats.estimated_tokens);
    assert_eq!(brief.results[0].preview.as_deref(), Some("Summary line"));
}
