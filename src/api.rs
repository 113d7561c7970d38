//! HTTP surface under `/api/v1`, JSON in and out.

use crate::chunker::ChunkRequest;
use crate::config;
use crate::context::{resolve_namespace, NAMESPACE_HEADER};
use crate::error::Error;
use crate::fetch::{normalize, FetchMode, FetchOptions};
use crate::jobs::JobManager;
use crate::mapper;
use crate::pipeline::{run_batch, BatchRequest, PipelineDeps};
use crate::search::{SearchFacade, SearchQuery};
use crate::sitemap;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<PipelineDeps>,
    pub jobs: Arc<JobManager>,
    pub search: Arc<SearchFacade>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/crawl", post(crawl))
        .route("/api/v1/sitemap", post(sitemap_discover))
        .route("/api/v1/map", post(map_links))
        .route("/api/v1/batch-crawl", post(batch_crawl))
        .route("/api/v1/chunk", post(chunk))
        .route("/api/v1/search", post(search))
        .route("/api/v1/cache", post(cache_query))
        .route("/api/v1/jobs", post(submit_job).get(list_jobs))
        .route("/api/v1/jobs/:id", get(job_status).delete(cancel_job))
        .with_state(state)
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn ok(value: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(value))
}

fn fail(error: Error) -> ApiResponse {
    (error.status(), Json(error.envelope()))
}

fn header_namespace(headers: &HeaderMap) -> Option<&str> {
    headers.get(NAMESPACE_HEADER).and_then(|v| v.to_str().ok())
}

fn compile_path_filter(raw: Option<&str>) -> Result<Option<Regex>, Error> {
    raw.map(Regex::new)
        .transpose()
        .map_err(|e| Error::invalid_input(format!("invalid pathFilter regex: {}", e)))
}

async fn health(State(state): State<AppState>) -> ApiResponse {
    let stats: Vec<_> = state
        .deps
        .store
        .namespaces()
        .iter()
        .map(|ns| state.deps.store.stats(ns))
        .collect();
    ok(serde_json::json!({
        "name": "websearch",
        "version": env!("CARGO_PKG_VERSION"),
        "dims": state.deps.store.dims(),
        "namespaces": stats,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrawlBody {
    url: String,
    #[serde(default)]
    fetch_mode: FetchMode,
    #[serde(default = "default_output_format")]
    output_format: String,
    #[serde(default = "default_true")]
    include_links: bool,
    #[serde(default)]
    include_images: bool,
    #[serde(default)]
    wait_for_selector: Option<String>,
}

fn default_output_format() -> String {
    "markdown".to_string()
}

fn default_true() -> bool {
    true
}

async fn crawl(State(state): State<AppState>, Json(body): Json<CrawlBody>) -> ApiResponse {
    let opts = FetchOptions {
        mode: body.fetch_mode,
        wait_for_selector: body.wait_for_selector.clone(),
        include_links: body.include_links,
        include_images: body.include_images,
    };
    let mut result = match state.deps.fetcher.fetch(&body.url, &opts).await {
        Ok(result) => result,
        Err(e) => return fail(e),
    };
    match body.output_format.as_str() {
        "markdown" => {}
        "text" => result.content = normalize::markdown_to_text(&result.content),
        other => {
            return fail(Error::invalid_input(format!(
                "unknown outputFormat '{}'",
                other
            )))
        }
    }
    match serde_json::to_value(&result) {
        Ok(value) => ok(value),
        Err(e) => fail(Error::internal(e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SitemapBody {
    domain: String,
    #[serde(default = "default_max_urls")]
    max_urls: usize,
    #[serde(default)]
    path_filter: Option<String>,
}

fn default_max_urls() -> usize {
    config::DEFAULT_DISCOVERY_MAX_URLS
}

async fn sitemap_discover(
    State(state): State<AppState>,
    Json(body): Json<SitemapBody>,
) -> ApiResponse {
    let filter = match compile_path_filter(body.path_filter.as_deref()) {
        Ok(filter) => filter,
        Err(e) => return fail(e),
    };
    match sitemap::discover(
        state.deps.fetcher.client(),
        &body.domain,
        body.max_urls,
        filter.as_ref(),
    )
    .await
    {
        Ok(discovery) => match serde_json::to_value(&discovery) {
            Ok(value) => ok(value),
            Err(e) => fail(Error::internal(e.to_string())),
        },
        Err(e) => fail(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MapBody {
    url: String,
    #[serde(default = "default_map_depth")]
    max_depth: usize,
    #[serde(default = "default_max_urls")]
    max_urls: usize,
    #[serde(default)]
    path_filter: Option<String>,
}

fn default_map_depth() -> usize {
    config::DEFAULT_MAP_MAX_DEPTH
}

async fn map_links(State(state): State<AppState>, Json(body): Json<MapBody>) -> ApiResponse {
    let filter = match compile_path_filter(body.path_filter.as_deref()) {
        Ok(filter) => filter,
        Err(e) => return fail(e),
    };
    match mapper::map(
        &state.deps.fetcher,
        &body.url,
        body.max_depth,
        body.max_urls,
        filter.as_ref(),
    )
    .await
    {
        Ok(urls) => ok(serde_json::json!({ "discoveredUrls": urls })),
        Err(e) => fail(e),
    }
}

async fn batch_crawl(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> ApiResponse {
    let namespace = match resolve_namespace(request.namespace.as_deref(), header_namespace(&headers))
    {
        Ok(namespace) => namespace,
        Err(e) => return fail(e),
    };
    let ctx = crate::context::RequestContext::new(namespace);
    let progress = Arc::new(crate::jobs::JobProgress::new());
    match run_batch(Arc::clone(&state.deps), request, ctx, progress).await {
        Ok(outcome) => match serde_json::to_value(&outcome) {
            Ok(value) => ok(value),
            Err(e) => fail(Error::internal(e.to_string())),
        },
        Err(e) => fail(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkBody {
    #[serde(default)]
    content: String,
    #[serde(default = "default_strategy")]
    strategy: String,
    #[serde(default = "default_chunk_size")]
    max_chunk_size: usize,
    #[serde(default)]
    overlap: usize,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

fn default_strategy() -> String {
    "sentence".to_string()
}

fn default_chunk_size() -> usize {
    config::DEFAULT_MAX_CHUNK_SIZE
}

async fn chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChunkBody>,
) -> ApiResponse {
    let namespace = match resolve_namespace(body.namespace.as_deref(), header_namespace(&headers)) {
        Ok(namespace) => namespace,
        Err(e) => return fail(e),
    };
    let request = ChunkRequest {
        content: body.content,
        strategy: body.strategy,
        max_chunk_size: body.max_chunk_size,
        overlap: body.overlap,
        source_url: body.source_url,
        namespace,
    };
    match state.deps.chunkers.chunk(&request) {
        Ok(chunks) => match serde_json::to_value(&chunks) {
            Ok(value) => ok(value),
            Err(e) => fail(Error::internal(e.to_string())),
        },
        Err(e) => fail(e),
    }
}

async fn search(State(state): State<AppState>, Json(query): Json<SearchQuery>) -> ApiResponse {
    match state.search.search(&query).await {
        Ok(response) => match serde_json::to_value(&response) {
            Ok(value) => ok(value),
            Err(e) => fail(Error::internal(e.to_string())),
        },
        Err(e) => fail(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheBody {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default)]
    threshold: Option<f32>,
    #[serde(default)]
    namespace: Option<String>,
}

fn default_top_k() -> usize {
    config::DEFAULT_QUERY_TOP_K
}

async fn cache_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CacheBody>,
) -> ApiResponse {
    let namespace = match resolve_namespace(body.namespace.as_deref(), header_namespace(&headers)) {
        Ok(namespace) => namespace,
        Err(e) => return fail(e),
    };
    if body.query.trim().is_empty() {
        return fail(Error::invalid_input("query is empty"));
    }
    let vector = match state.deps.embedder.embed(&body.query) {
        Ok(vector) => vector,
        Err(e) => return fail(e),
    };
    match state
        .deps
        .store
        .query(&namespace, &vector, body.top_k, body.threshold, false)
    {
        Ok(hits) => match serde_json::to_value(&hits) {
            Ok(value) => ok(value),
            Err(e) => fail(Error::internal(e.to_string())),
        },
        Err(e) => fail(e),
    }
}

async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> ApiResponse {
    let namespace = match resolve_namespace(request.namespace.as_deref(), header_namespace(&headers))
    {
        Ok(namespace) => namespace,
        Err(e) => return fail(e),
    };
    let job_id = state.jobs.submit(request, namespace);
    ok(serde_json::json!({ "jobId": job_id }))
}

async fn list_jobs(State(state): State<AppState>) -> ApiResponse {
    ok(serde_json::json!(state.jobs.list()))
}

async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    match state.jobs.status(&id) {
        Some(status) => match serde_json::to_value(&status) {
            Ok(value) => ok(value),
            Err(e) => fail(Error::internal(e.to_string())),
        },
        None => fail(Error::not_found(format!("unknown job '{}'", id))),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    if state.jobs.status(&id).is_none() {
        return fail(Error::not_found(format!("unknown job '{}'", id)));
    }
    let cancelled = state.jobs.cancel(&id);
    ok(serde_json::json!({ "jobId": id, "cancelled": cancelled }))
}
