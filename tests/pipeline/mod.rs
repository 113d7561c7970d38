//! Batch pipeline integration tests against an in-process fixture server.

use axum::extract::{Path as AxumPath, State};
use axum::{routing::get, Router};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use websearch::chunker::{ChunkRequest, ChunkerRegistry};
use websearch::context::RequestContext;
use websearch::embedder::{Embedder, HashEmbedder};
use websearch::error::ErrorKind;
use websearch::fetch::{FetchMode, FetchOptions, Fetcher};
use websearch::jobs::JobProgress;
use websearch::pipeline::{run_batch, BatchRequest, PipelineDeps};
use websearch::store::VectorStore;

#[derive(Clone, Default)]
struct Hits {
    times: Arc<Mutex<Vec<Instant>>>,
    count: Arc<AtomicUsize>,
}

fn page_html(n: &str) -> String {
    format!(
        "<html><head><title>Page {n}</title></head><body>\
         <h1>Page {n}</h1>\
         <p>Fixture content for page {n}. It carries several sentences of \
         text. Enough words to produce at least one chunk.</p>\
         </body></html>"
    )
}

fn fixture_router(hits: Hits) -> Router {
    Router::new()
        .route(
            "/page/:n",
            get(|State(hits): State<Hits>, AxumPath(n): AxumPath<String>| async move {
                hits.times.lock().unwrap().push(Instant::now());
                hits.count.fetch_add(1, Ordering::SeqCst);
                axum::response::Html(page_html(&n))
            }),
        )
        .route(
            "/empty",
            get(|State(hits): State<Hits>| async move {
                hits.count.fetch_add(1, Ordering::SeqCst);
                axum::response::Html("<html><body>   </body></html>".to_string())
            }),
        )
        .route(
            "/missing",
            get(|| async { axum::http::StatusCode::NOT_FOUND }),
        )
        .with_state(hits)
}

async fn spawn_fixture(hits: Hits) -> (String, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = fixture_router(hits);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), addr.port())
}

fn make_deps(dir: &Path) -> Arc<PipelineDeps> {
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
    let store = Arc::new(VectorStore::open(dir, embedder.dims()).unwrap());
    Arc::new(PipelineDeps {
        fetcher: Arc::new(Fetcher::new(Duration::from_secs(5), 0, 10).unwrap()),
        chunkers: Arc::new(ChunkerRegistry::new()),
        embedder,
        store,
        fetch_timeout: Duration::from_secs(5),
        embed_timeout: Duration::from_secs(5),
    })
}

fn batch_of(urls: Vec<String>) -> BatchRequest {
    BatchRequest {
        urls,
        fetch_mode: FetchMode::Static,
        rate_limit_ms: 0,
        max_concurrency: 3,
        ..Default::default()
    }
}

#[tokio::test]
async fn duplicate_urls_fetch_exactly_once() {
    let hits = Hits::default();
    let (base, _) = spawn_fixture(hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());

    let request = batch_of(vec![
        format!("{base}/page/dup"),
        format!("{base}/page/dup#fragment"),
        format!("{base}/page/dup"),
    ]);
    let outcome = run_batch(
        deps,
        request,
        RequestContext::new("pipe"),
        Arc::new(JobProgress::new()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.processed, 1);
    assert_eq!(hits.count.load(Ordering::SeqCst), 1, "one fetch for duplicates");
}

#[tokio::test]
async fn partial_failures_are_recorded_not_fatal() {
    let hits = Hits::default();
    let (base, _) = spawn_fixture(hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());

    let request = batch_of(vec![
        format!("{base}/page/a"),
        format!("{base}/missing"),
        format!("{base}/empty"),
        format!("{base}/page/b"),
    ]);
    let progress = Arc::new(JobProgress::new());
    let outcome = run_batch(
        Arc::clone(&deps),
        request,
        RequestContext::new("pipe"),
        Arc::clone(&progress),
    )
    .await
    .unwrap();

    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.failed.len(), 2);
    let kinds: Vec<ErrorKind> = outcome.failed.iter().map(|f| f.kind).collect();
    assert!(kinds.contains(&ErrorKind::HttpStatus));
    assert!(kinds.contains(&ErrorKind::Parse), "empty content is a parse failure");

    assert!(!outcome.chunk_ids.is_empty());
    assert_eq!(deps.store.len("pipe"), outcome.chunk_ids.len());

    let counters = progress.snapshot();
    assert_eq!(counters.total, 4);
    assert_eq!(counters.completed, 2);
    assert_eq!(counters.failed, 2);
    assert_eq!(counters.cancelled, 0);
}

#[tokio::test]
async fn same_host_fetches_respect_the_rate_limit() {
    let hits = Hits::default();
    let (base, _) = spawn_fixture(hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());

    let mut request = batch_of(vec![
        format!("{base}/page/r1"),
        format!("{base}/page/r2"),
        format!("{base}/page/r3"),
    ]);
    request.rate_limit_ms = 500;
    run_batch(
        deps,
        request,
        RequestContext::new("pipe"),
        Arc::new(JobProgress::new()),
    )
    .await
    .unwrap();

    let mut times = hits.times.lock().unwrap().clone();
    times.sort();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(490),
            "same-host inter-fetch gap {:?} under the 500ms minimum",
            gap
        );
    }
}

#[tokio::test]
async fn distinct_hosts_are_rate_limited_independently() {
    let hits = Hits::default();
    let (_, port) = spawn_fixture(hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());

    // Same server, two hostnames: two independent token buckets
    let mut request = batch_of(vec![
        format!("http://127.0.0.1:{port}/page/h1"),
        format!("http://localhost:{port}/page/h2"),
    ]);
    request.rate_limit_ms = 5000;
    request.max_concurrency = 2;

    let start = Instant::now();
    let outcome = run_batch(
        deps,
        request,
        RequestContext::new("pipe"),
        Arc::new(JobProgress::new()),
    )
    .await
    .unwrap();

    assert_eq!(outcome.processed, 2);
    assert!(
        start.elapsed() < Duration::from_secs(4),
        "distinct hosts must not serialize on one bucket (took {:?})",
        start.elapsed()
    );
}

#[tokio::test]
async fn cancelled_context_drains_the_queue_as_cancelled() {
    let hits = Hits::default();
    let (base, _) = spawn_fixture(hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());

    let ctx = RequestContext::new("pipe");
    ctx.cancel.cancel();

    let request = batch_of(vec![format!("{base}/page/a"), format!("{base}/page/b")]);
    let progress = Arc::new(JobProgress::new());
    let outcome = run_batch(deps, request, ctx, Arc::clone(&progress))
        .await
        .unwrap();

    assert_eq!(outcome.processed, 0);
    assert_eq!(outcome.cancelled, 2);
    assert_eq!(hits.count.load(Ordering::SeqCst), 0, "no fetch after cancel");
    let counters = progress.snapshot();
    assert_eq!(counters.cancelled, counters.total);
}

#[tokio::test]
async fn chunk_ids_follow_chunker_emission_order_per_url() {
    let hits = Hits::default();
    let (base, _) = spawn_fixture(hits.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());

    let url = format!("{base}/page/order");
    let mut request = batch_of(vec![url.clone()]);
    request.max_chunk_size = 60;
    let outcome = run_batch(
        Arc::clone(&deps),
        request,
        RequestContext::new("pipe"),
        Arc::new(JobProgress::new()),
    )
    .await
    .unwrap();
    assert!(outcome.chunk_ids.len() > 1, "page should split into chunks");

    // Re-run the chunker over the fetched content; ids must line up 1:1
    let fetched = deps
        .fetcher
        .fetch(
            &url,
            &FetchOptions {
                mode: FetchMode::Static,
                wait_for_selector: None,
                include_links: false,
                include_images: false,
            },
        )
        .await
        .unwrap();
    let expected: Vec<String> = deps
        .chunkers
        .chunk(&ChunkRequest {
            content: fetched.content,
            strategy: "sentence".to_string(),
            max_chunk_size: 60,
            overlap: 0,
            source_url: Some(fetched.final_url),
            namespace: "pipe".to_string(),
        })
        .unwrap()
        .into_iter()
        .map(|c| c.chunk_id)
        .collect();
    assert_eq!(outcome.chunk_ids, expected);
}

#[tokio::test]
async fn bad_path_filter_is_invalid_input() {
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());
    let mut request = batch_of(vec!["http://127.0.0.1:1/x".to_string()]);
    request.path_filter = Some("[unclosed".to_string());
    let err = run_batch(
        deps,
        request,
        RequestContext::new("pipe"),
        Arc::new(JobProgress::new()),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInput);
}
