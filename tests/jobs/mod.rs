//! Job manager integration tests: lifecycle, counters, cancellation,
//! retention.

use axum::{extract::Path as AxumPath, routing::get, Router};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use websearch::chunker::ChunkerRegistry;
use websearch::embedder::{Embedder, HashEmbedder};
use websearch::fetch::{FetchMode, Fetcher};
use websearch::jobs::{JobManager, JobState, JobStatus};
use websearch::pipeline::{BatchRequest, PipelineDeps};
use websearch::store::VectorStore;

fn page_html(n: &str) -> String {
    format!(
        "<html><head><title>Page {n}</title></head><body>\
         <h1>Page {n}</h1>\
         <p>This fixture page carries enough text to chunk. It has several \
         sentences. Each sentence adds a little more content for page {n}.</p>\
         </body></html>"
    )
}

async fn spawn_fixture(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
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
        max_concurrency: 2,
        ..Default::default()
    }
}

/// Poll until `done` is satisfied, asserting the counter invariant on every
/// observation along the way.
async fn wait_for(
    jobs: &Arc<JobManager>,
    id: &str,
    timeout: Duration,
    done: impl Fn(&JobStatus) -> bool,
) -> JobStatus {
    let deadline = Instant::now() + timeout;
    loop {
        let status = jobs.status(id).expect("job should be known");
        assert!(
            status.completed + status.failed + status.cancelled <= status.total,
            "counter invariant violated: {}+{}+{} > {}",
            status.completed,
            status.failed,
            status.cancelled,
            status.total
        );
        if done(&status) {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for job {} (last state {:?})",
            id,
            status.state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn settled(status: &JobStatus) -> bool {
    status.state.is_terminal()
        && status.completed + status.failed + status.cancelled == status.total
}

#[tokio::test]
async fn job_runs_to_completion_with_consistent_counters() {
    let base = spawn_fixture(
        Router::new().route("/page/:n", get(|AxumPath(n): AxumPath<String>| async move {
            axum::response::Html(page_html(&n))
        })),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());
    let jobs = JobManager::new(Arc::clone(&deps), Duration::from_secs(3600), 100);

    let urls = (0..3).map(|n| format!("{base}/page/{n}")).collect();
    let id = jobs.submit(batch_of(urls), "jobs-test".to_string());
    assert!(jobs.list().contains(&id));

    let status = wait_for(&jobs, &id, Duration::from_secs(10), settled).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.total, 3);
    assert_eq!(status.completed, 3);
    assert_eq!(status.failed, 0);

    let result = status.result.expect("terminal job carries its result");
    assert_eq!(result.processed, 3);
    assert!(!result.chunk_ids.is_empty());
    assert_eq!(deps.store.len("jobs-test"), result.chunk_ids.len());
}

#[tokio::test]
async fn per_url_failures_do_not_fail_the_job() {
    let base = spawn_fixture(
        Router::new()
            .route("/page/:n", get(|AxumPath(n): AxumPath<String>| async move {
                axum::response::Html(page_html(&n))
            }))
            .route("/missing", get(|| async {
                axum::http::StatusCode::NOT_FOUND
            })),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());
    let jobs = JobManager::new(deps, Duration::from_secs(3600), 100);

    let urls = vec![format!("{base}/page/0"), format!("{base}/missing")];
    let id = jobs.submit(batch_of(urls), "jobs-test".to_string());

    let status = wait_for(&jobs, &id, Duration::from_secs(10), settled).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.completed, 1);
    assert_eq!(status.failed, 1);
    let result = status.result.unwrap();
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].kind, websearch::error::ErrorKind::HttpStatus);
}

#[tokio::test]
async fn cancel_reaches_terminal_state_with_full_accounting() {
    let base = spawn_fixture(
        Router::new().route("/slow/:n", get(|AxumPath(n): AxumPath<String>| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            axum::response::Html(page_html(&n))
        })),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());
    let jobs = JobManager::new(deps, Duration::from_secs(3600), 100);

    let urls = (0..8).map(|n| format!("{base}/slow/{n}")).collect();
    let id = jobs.submit(batch_of(urls), "jobs-test".to_string());

    // Let the job start and materialize its URL list before cancelling
    wait_for(&jobs, &id, Duration::from_secs(10), |s| s.total == 8).await;
    assert!(jobs.cancel(&id), "cancel should transition a live job");

    let status = wait_for(&jobs, &id, Duration::from_secs(10), settled).await;
    assert_eq!(status.state, JobState::Cancelled);
    assert!(status.cancelled >= 1, "some urls must report cancelled");
    assert_eq!(
        status.completed + status.failed + status.cancelled,
        status.total
    );

    // Cancel is not re-entrant once terminal
    assert!(!jobs.cancel(&id));
}

#[tokio::test]
async fn unknown_jobs_are_absent() {
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());
    let jobs = JobManager::new(deps, Duration::from_secs(3600), 100);
    assert!(jobs.status("no-such-job").is_none());
    assert!(!jobs.cancel("no-such-job"));
    assert!(jobs.list().is_empty());
}

#[tokio::test]
async fn terminal_jobs_are_swept_after_retention() {
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());
    // Zero retention: terminal jobs are eligible for eviction immediately
    let jobs = JobManager::new(deps, Duration::ZERO, 100);

    // No urls and no domain fails fast
    let id = jobs.submit(BatchRequest::default(), "jobs-test".to_string());
    let status = wait_for(&jobs, &id, Duration::from_secs(10), |s| {
        s.state.is_terminal()
    })
    .await;
    assert_eq!(status.state, JobState::Failed);
    assert!(status.error.is_some());

    jobs.sweep(Instant::now());
    assert!(jobs.status(&id).is_none(), "expired job should be evicted");
}

#[tokio::test]
async fn hard_cap_evicts_oldest_terminal_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let deps = make_deps(dir.path());
    let jobs = JobManager::new(deps, Duration::from_secs(3600), 2);

    let ids: Vec<String> = (0..3)
        .map(|_| jobs.submit(BatchRequest::default(), "jobs-test".to_string()))
        .collect();
    for id in &ids {
        wait_for(&jobs, id, Duration::from_secs(10), |s| s.state.is_terminal()).await;
    }

    jobs.sweep(Instant::now());
    assert!(jobs.len() <= 2, "cap must bound retained jobs");
}
