//! Batch ingest pipeline: materialize URLs, fan out to a bounded worker
//! pool, rate-limit per host, and run fetch → chunk → embed → store for each
//! URL with cooperative cancellation at every stage boundary.

use crate::chunker::{ChunkRequest, ChunkerRegistry};
use crate::config;
use crate::context::RequestContext;
use crate::embedder::Embedder;
use crate::error::{Error, ErrorKind, Result};
use crate::fetch::{FetchMode, FetchOptions, Fetcher};
use crate::jobs::JobProgress;
use crate::sitemap;
use crate::store::{StoredRecord, VectorStore};
use crate::urls;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchRequest {
    pub urls: Vec<String>,
    pub domain: Option<String>,
    pub fetch_mode: FetchMode,
    pub chunk_strategy: String,
    pub max_chunk_size: usize,
    pub overlap: usize,
    pub max_concurrency: usize,
    pub rate_limit_ms: u64,
    pub path_filter: Option<String>,
    pub max_urls: usize,
    pub namespace: Option<String>,
}

impl Default for BatchRequest {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            domain: None,
            fetch_mode: FetchMode::Auto,
            chunk_strategy: "sentence".to_string(),
            max_chunk_size: config::DEFAULT_MAX_CHUNK_SIZE,
            overlap: config::DEFAULT_CHUNK_OVERLAP,
            max_concurrency: config::DEFAULT_MAX_CONCURRENCY,
            rate_limit_ms: config::DEFAULT_RATE_LIMIT_MS,
            path_filter: None,
            max_urls: config::DEFAULT_DISCOVERY_MAX_URLS,
            namespace: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlFailure {
    pub url: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub processed: usize,
    pub failed: Vec<UrlFailure>,
    pub chunk_ids: Vec<String>,
    pub cancelled: usize,
}

/// Everything a batch worker touches, bundled once at startup.
pub struct PipelineDeps {
    pub fetcher: Arc<Fetcher>,
    pub chunkers: Arc<ChunkerRegistry>,
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<VectorStore>,
    pub fetch_timeout: Duration,
    pub embed_timeout: Duration,
}

/// Run a batch crawl to completion. Per-URL failures are recorded and never
/// abort the batch; the error return is reserved for fatal conditions
/// (invalid request, store loss).
pub async fn run_batch(
    deps: Arc<PipelineDeps>,
    request: BatchRequest,
    ctx: RequestContext,
    progress: Arc<JobProgress>,
) -> Result<BatchOutcome> {
    let path_filter = request
        .path_filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| Error::invalid_input(format!("invalid pathFilter regex: {}", e)))?;

    let targets = materialize_urls(&deps, &request, path_filter.as_ref()).await?;
    progress.set_total(targets.len());
    info!(
        "Batch start: {} urls, concurrency {}, rate limit {}ms, namespace '{}'",
        targets.len(),
        request.max_concurrency,
        request.rate_limit_ms,
        ctx.namespace
    );
    if targets.is_empty() {
        return Ok(BatchOutcome::default());
    }

    let limiter: Option<Arc<DefaultKeyedRateLimiter<String>>> =
        Quota::with_period(Duration::from_millis(request.rate_limit_ms))
            .map(|quota| Arc::new(RateLimiter::keyed(quota)));

    let (tx, rx) = flume::unbounded::<String>();
    for url in targets {
        let _ = tx.send(url);
    }
    drop(tx);

    let outcome = Arc::new(Mutex::new(BatchOutcome::default()));
    let workers = request.max_concurrency.max(1);
    let mut handles = Vec::with_capacity(workers);

    for _ in 0..workers {
        let rx = rx.clone();
        let deps = Arc::clone(&deps);
        let request = request.clone();
        let ctx = ctx.clone();
        let progress = Arc::clone(&progress);
        let outcome = Arc::clone(&outcome);
        let limiter = limiter.clone();

        handles.push(tokio::spawn(async move {
            while let Ok(url) = rx.recv_async().await {
                if ctx.cancel.is_cancelled() {
                    progress.url_cancelled();
                    if let Ok(mut out) = outcome.lock() {
                        out.cancelled += 1;
                    }
                    continue;
                }
                match process_url(&deps, &request, &ctx, limiter.as_deref(), &url).await {
                    Ok(chunk_ids) => {
                        progress.url_completed();
                        if let Ok(mut out) = outcome.lock() {
                            out.processed += 1;
                            out.chunk_ids.extend(chunk_ids);
                        }
                    }
                    Err(e) if e.kind == ErrorKind::Cancelled => {
                        progress.url_cancelled();
                        if let Ok(mut out) = outcome.lock() {
                            out.cancelled += 1;
                        }
                    }
                    Err(e) => {
                        debug!("Batch url {} failed: {}", url, e);
                        progress.url_failed();
                        if let Ok(mut out) = outcome.lock() {
                            out.failed.push(UrlFailure {
                                url: url.clone(),
                                kind: e.kind,
                                message: e.message,
                            });
                        }
                    }
                }
            }
        }));
    }

    for joined in futures::future::join_all(handles).await {
        if let Err(e) = joined {
            warn!("Batch worker panicked: {}", e);
        }
    }

    deps.store.flush()?;

    let result = outcome
        .lock()
        .map(|out| out.clone())
        .map_err(|_| Error::internal("batch outcome lock poisoned"))?;
    info!(
        "Batch done: {} processed, {} failed, {} cancelled",
        result.processed,
        result.failed.len(),
        result.cancelled
    );
    Ok(result)
}

/// Effective URL list: explicit urls ∪ sitemap discovery, deduplicated by
/// normalized form, truncated to `max_urls`.
async fn materialize_urls(
    deps: &PipelineDeps,
    request: &BatchRequest,
    path_filter: Option<&Regex>,
) -> Result<Vec<String>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut targets: Vec<String> = Vec::new();

    for raw in &request.urls {
        let normalized = urls::normalize(raw)
            .ok_or_else(|| Error::invalid_input(format!("invalid url '{}'", raw)))?;
        if seen.insert(normalized.clone()) {
            targets.push(normalized);
        }
    }

    if let Some(domain) = &request.domain {
        match sitemap::discover(
            deps.fetcher.client(),
            domain,
            request.max_urls,
            path_filter,
        )
        .await
        {
            Ok(discovery) => {
                for url in discovery.discovered_urls {
                    if seen.insert(url.clone()) {
                        targets.push(url);
                    }
                }
            }
            Err(e) if request.urls.is_empty() => return Err(e),
            Err(e) => warn!("Sitemap discovery for {} failed: {}", domain, e),
        }
    }

    if targets.is_empty() && request.domain.is_none() {
        return Err(Error::invalid_input("batch needs urls or a domain"));
    }
    targets.truncate(request.max_urls);
    Ok(targets)
}

/// One URL through the whole pipeline. Cancellation is polled before the
/// fetch, after the fetch, before each embed, and between store puts.
async fn process_url(
    deps: &PipelineDeps,
    request: &BatchRequest,
    ctx: &RequestContext,
    limiter: Option<&DefaultKeyedRateLimiter<String>>,
    url: &str,
) -> Result<Vec<String>> {
    ctx.cancel.check()?;

    if let (Some(limiter), Some(host)) = (limiter, urls::host_of(url)) {
        limiter.until_key_ready(&host).await;
    }

    let opts = FetchOptions {
        mode: request.fetch_mode,
        wait_for_selector: None,
        include_links: false,
        include_images: false,
    };
    let fetched = tokio::time::timeout(deps.fetch_timeout, deps.fetcher.fetch(url, &opts))
        .await
        .map_err(|_| Error::timeout(format!("fetch of {} timed out", url)))??;

    ctx.cancel.check()?;

    if fetched.content.trim().is_empty() {
        return Err(Error::parse(format!("no content extracted from {}", url)));
    }

    let chunks = deps.chunkers.chunk(&ChunkRequest {
        content: fetched.content,
        strategy: request.chunk_strategy.clone(),
        max_chunk_size: request.max_chunk_size,
        overlap: request.overlap,
        source_url: Some(fetched.final_url.clone()),
        namespace: ctx.namespace.clone(),
    })?;

    let mut chunk_ids = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        ctx.cancel.check()?;

        let embedder = Arc::clone(&deps.embedder);
        let text = chunk.text.clone();
        let vector = tokio::time::timeout(
            deps.embed_timeout,
            tokio::task::spawn_blocking(move || embedder.embed(&text)),
        )
        .await
        .map_err(|_| Error::timeout(format!("embedding timed out for {}", url)))?
        .map_err(|e| Error::internal(format!("embed task failed: {}", e)))??;

        ctx.cancel.check()?;

        deps.store.put(
            &ctx.namespace,
            StoredRecord {
                chunk_id: chunk.chunk_id.clone(),
                vector,
                text: chunk.text,
                source_url: chunk.source_url,
                created_at: chunk.created_at,
            },
        )?;
        chunk_ids.push(chunk.chunk_id);
    }

    Ok(chunk_ids)
}
