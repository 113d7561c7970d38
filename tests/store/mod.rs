//! Vector store integration tests: persistence, ranking, locking.

use chrono::Utc;
use websearch::chunker::{ChunkRequest, ChunkerRegistry};
use websearch::embedder::{Embedder, HashEmbedder};
use websearch::error::ErrorKind;
use websearch::store::{StoredRecord, VectorStore};

fn record_for(embedder: &HashEmbedder, id: &str, text: &str) -> StoredRecord {
    StoredRecord {
        chunk_id: id.to_string(),
        vector: embedder.embed(text).unwrap(),
        text: text.to_string(),
        source_url: Some("https://example.com/doc".to_string()),
        created_at: Utc::now(),
    }
}

#[test]
fn self_similarity_returns_top_one() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = HashEmbedder::default();
    let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();

    let texts = [
        ("c1", "The quick brown fox jumps over the lazy dog."),
        ("c2", "Rust gives memory safety without garbage collection."),
        ("c3", "Sitemap files enumerate the pages of a website."),
    ];
    for (id, text) in &texts {
        store.put("ns", record_for(&embedder, id, text)).unwrap();
    }

    for (id, text) in &texts {
        let vector = embedder.embed(text).unwrap();
        let hits = store.query("ns", &vector, 3, None, false).unwrap();
        assert_eq!(&hits[0].chunk_id, id, "self-query must rank itself first");
        assert!(
            hits[0].score >= 0.999,
            "self-similarity should be ~1.0, got {}",
            hits[0].score
        );
    }
}

#[test]
fn records_survive_reopen_with_identical_scores() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = HashEmbedder::default();
    let probe = embedder.embed("persistent retrieval probe").unwrap();

    let before = {
        let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();
        store
            .put("ns", record_for(&embedder, "a", "persistent retrieval probe"))
            .unwrap();
        store
            .put("ns", record_for(&embedder, "b", "unrelated filler text"))
            .unwrap();
        store.flush().unwrap();
        store.query("ns", &probe, 2, None, false).unwrap()
    };

    let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();
    assert_eq!(store.len("ns"), 2);
    let after = store.query("ns", &probe, 2, None, false).unwrap();
    assert_eq!(before.len(), after.len());
    for (x, y) in before.iter().zip(after.iter()) {
        assert_eq!(x.chunk_id, y.chunk_id);
        assert!(
            (x.score - y.score).abs() < 1e-6,
            "scores must match across restart: {} vs {}",
            x.score,
            y.score
        );
    }
}

#[test]
fn overwrite_keeps_store_size_constant() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = HashEmbedder::default();
    let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();

    store
        .put("ns", record_for(&embedder, "c1", "first version of the text"))
        .unwrap();
    store
        .put("ns", record_for(&embedder, "c1", "second version entirely rewritten"))
        .unwrap();

    assert_eq!(store.len("ns"), 1);
    let probe = embedder.embed("second version entirely rewritten").unwrap();
    let hits = store.query("ns", &probe, 1, None, false).unwrap();
    assert_eq!(hits[0].chunk_id, "c1");
    assert!(hits[0].score >= 0.999);
    assert!(hits[0].text.contains("second version"));
}

#[test]
fn overwrite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = HashEmbedder::default();
    {
        let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();
        store
            .put("ns", record_for(&embedder, "c1", "old text"))
            .unwrap();
        store
            .put("ns", record_for(&embedder, "c1", "new text wins"))
            .unwrap();
        store.flush().unwrap();
    }
    let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();
    assert_eq!(store.len("ns"), 1);
    let probe = embedder.embed("new text wins").unwrap();
    let hits = store.query("ns", &probe, 1, None, false).unwrap();
    assert!(hits[0].text.contains("new text wins"));
}

#[test]
fn namespaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = HashEmbedder::default();
    let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();

    store
        .put("alpha", record_for(&embedder, "a", "alpha namespace text"))
        .unwrap();
    store
        .put("beta", record_for(&embedder, "b", "beta namespace text"))
        .unwrap();

    let probe = embedder.embed("alpha namespace text").unwrap();
    let hits = store.query("beta", &probe, 10, None, false).unwrap();
    assert!(hits.iter().all(|h| h.chunk_id != "a"));
    assert_eq!(store.len("alpha"), 1);
    assert_eq!(store.len("beta"), 1);
}

#[test]
fn reset_drops_only_the_named_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = HashEmbedder::default();
    let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();

    store
        .put("keep", record_for(&embedder, "k", "kept text"))
        .unwrap();
    store
        .put("drop", record_for(&embedder, "d", "dropped text"))
        .unwrap();
    store.reset(Some("drop")).unwrap();

    assert_eq!(store.len("keep"), 1);
    assert_eq!(store.len("drop"), 0);
    assert_eq!(store.namespaces(), vec!["keep".to_string()]);

    store.reset(None).unwrap();
    assert!(store.namespaces().is_empty());
}

#[test]
fn second_open_conflicts_until_first_closes() {
    let dir = tempfile::tempdir().unwrap();
    let first = VectorStore::open(dir.path(), 8).unwrap();

    let err = VectorStore::open(dir.path(), 8).unwrap_err();
    assert_eq!(err.kind, ErrorKind::LockConflict);

    drop(first);
    assert!(VectorStore::open(dir.path(), 8).is_ok());
}

#[test]
fn reopen_with_different_dims_requires_reset() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = VectorStore::open(dir.path(), 4).unwrap();
        store
            .put(
                "ns",
                StoredRecord {
                    chunk_id: "a".to_string(),
                    vector: vec![1.0, 0.0, 0.0, 0.0],
                    text: "four dims".to_string(),
                    source_url: None,
                    created_at: Utc::now(),
                },
            )
            .unwrap();
        store.flush().unwrap();
    }
    let err = VectorStore::open(dir.path(), 8).unwrap_err();
    assert_eq!(err.kind, ErrorKind::DimMismatch);
}

#[test]
fn chunk_embed_put_query_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = HashEmbedder::default();
    let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();
    let chunkers = ChunkerRegistry::new();

    let content = "Rust compiles to native code. Sitemaps list website pages. \
                   Cosine similarity ranks embedded vectors.";
    let chunks = chunkers
        .chunk(&ChunkRequest {
            content: content.to_string(),
            strategy: "sentence".to_string(),
            max_chunk_size: 40,
            overlap: 0,
            source_url: Some("https://example.com/doc".to_string()),
            namespace: "rt".to_string(),
        })
        .unwrap();
    assert!(chunks.len() >= 2);

    for chunk in &chunks {
        store
            .put(
                "rt",
                StoredRecord {
                    chunk_id: chunk.chunk_id.clone(),
                    vector: embedder.embed(&chunk.text).unwrap(),
                    text: chunk.text.clone(),
                    source_url: chunk.source_url.clone(),
                    created_at: chunk.created_at,
                },
            )
            .unwrap();
    }

    for chunk in &chunks {
        let vector = embedder.embed(&chunk.text).unwrap();
        let hits = store.query("rt", &vector, 1, None, false).unwrap();
        assert_eq!(
            hits[0].chunk_id, chunk.chunk_id,
            "round trip must return the original chunk"
        );
    }
}

#[test]
fn empty_namespace_queries_are_empty_not_errors() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = HashEmbedder::default();
    let store = VectorStore::open(dir.path(), embedder.dims()).unwrap();
    let probe = embedder.embed("anything at all").unwrap();
    let hits = store.query("never-written", &probe, 10, None, false).unwrap();
    assert!(hits.is_empty());
}
