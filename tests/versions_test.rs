//! Version history laws: update snapshots, the 5-version cap, and
//! restore round-trips.

mod helpers;

use std::sync::Arc;

use helpers::{spike, test_engine, MapEmbedder};
use hippograph::graph::ingest::NoteInput;

#[test]
fn update_history_tracks_old_and_new_state() {
    let embedder = Arc::new(MapEmbedder::new());
    embedder.register("draft of the plan", spike(0));
    embedder.register("final plan", spike(10));
    let engine = test_engine(Arc::clone(&embedder));

    let id = engine.add(NoteInput::new("draft of the plan")).unwrap().id;
    let version = engine.update(id, Some("final plan"), None).unwrap();
    assert_eq!(version, 2);

    let history = engine.get_history(id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "draft of the plan");
    assert_eq!(history[1].content, "final plan");
}

#[test]
fn restoring_the_newest_version_is_a_noop() {
    let embedder = Arc::new(MapEmbedder::new());
    embedder.register("first wording", spike(0));
    embedder.register("second wording", spike(10));
    let engine = test_engine(Arc::clone(&embedder));

    let id = engine.add(NoteInput::new("first wording")).unwrap().id;
    engine.update(id, Some("second wording"), None).unwrap();

    let history = engine.get_history(id).unwrap();
    let newest = history.last().unwrap().version;
    let rows_before = history.len();

    engine.restore_version(id, newest).unwrap();

    assert_eq!(engine.get_note(id).unwrap().content, "second wording");
    assert_eq!(engine.get_history(id).unwrap().len(), rows_before);
}

#[test]
fn restoring_an_old_version_replaces_content_and_keeps_the_id() {
    let embedder = Arc::new(MapEmbedder::new());
    embedder.register("original recipe", spike(0));
    embedder.register("tweaked recipe", spike(10));
    let engine = test_engine(Arc::clone(&embedder));

    let id = engine.add(NoteInput::new("original recipe")).unwrap().id;
    engine.update(id, Some("tweaked recipe"), None).unwrap();

    engine.restore_version(id, 1).unwrap();

    let node = engine.get_note(id).unwrap();
    assert_eq!(node.id, id);
    assert_eq!(node.content, "original recipe");

    // the restore is itself undoable: the pre-restore state is in history
    let history = engine.get_history(id).unwrap();
    assert!(history.iter().any(|v| v.content == "tweaked recipe"));
}

#[test]
fn at_most_five_versions_survive() {
    let embedder = Arc::new(MapEmbedder::new());
    embedder.register("revision 0", spike(0));
    let engine = test_engine(Arc::clone(&embedder));
    let id = engine.add(NoteInput::new("revision 0")).unwrap().id;

    for i in 1..=7 {
        let content = format!("revision {i}");
        embedder.register(&content, spike(i * 9 + 1));
        engine.update(id, Some(&content), None).unwrap();
    }

    let history = engine.get_history(id).unwrap();
    assert_eq!(history.len(), 5);
    // newest entry mirrors current content
    assert_eq!(history.last().unwrap().content, "revision 7");
    assert_eq!(engine.get_note(id).unwrap().content, "revision 7");
}
