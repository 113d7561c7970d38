//! CLI verbs, mapped one-for-one onto the HTTP operations.
//!
//! Stdout carries exactly the JSON payload; all diagnostics go to stderr via
//! tracing. Exit codes: 0 success, 1 invalid input, 2 operational failure.

use crate::api::{self, AppState};
use crate::chunker::{ChunkRequest, ChunkerRegistry};
use crate::config::{self, AppConfig};
use crate::context::{resolve_namespace, RequestContext};
use crate::embedder::EmbedderRegistry;
use crate::error::{Error, Result};
use crate::fetch::{normalize, FetchMode, FetchOptions, Fetcher};
use crate::jobs::{JobManager, JobProgress};
use crate::pipeline::{run_batch, BatchRequest, PipelineDeps};
use crate::search::{SearchFacade, SearchQuery, UnconfiguredProvider};
use crate::sitemap;
use crate::store::VectorStore;
use clap::Subcommand;
use regex::Regex;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API server
    Serve {
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Query the external search provider
    Search {
        query: String,
        #[arg(long, default_value_t = config::DEFAULT_SEARCH_MAX_RESULTS)]
        max_results: usize,
        #[arg(long)]
        freshness: Option<String>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long = "include-domain")]
        include_domains: Vec<String>,
    },
    /// Fetch a single URL and print the normalized content
    Crawl {
        url: String,
        #[arg(long, value_enum, default_value = "auto")]
        fetch_mode: FetchMode,
        #[arg(long, default_value = "markdown")]
        output_format: String,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        include_links: bool,
        #[arg(long)]
        include_images: bool,
        #[arg(long)]
        wait_for_selector: Option<String>,
    },
    /// Split content into chunks (reads stdin when --content is omitted)
    Chunk {
        #[arg(long)]
        content: Option<String>,
        #[arg(long, default_value = "sentence")]
        strategy: String,
        #[arg(long, default_value_t = config::DEFAULT_MAX_CHUNK_SIZE)]
        max_chunk_size: usize,
        #[arg(long, default_value_t = config::DEFAULT_CHUNK_OVERLAP)]
        overlap: usize,
        #[arg(long)]
        source_url: Option<String>,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Semantic lookup against the local vector index
    Cache {
        query: String,
        #[arg(long, default_value_t = config::DEFAULT_QUERY_TOP_K)]
        top_k: usize,
        #[arg(long)]
        threshold: Option<f32>,
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Discover URLs for a domain from its sitemaps
    Sitemap {
        domain: String,
        #[arg(long, default_value_t = config::DEFAULT_DISCOVERY_MAX_URLS)]
        max_urls: usize,
        #[arg(long)]
        path_filter: Option<String>,
    },
    /// Crawl a URL set (and/or a domain's sitemap) into the vector index
    BatchCrawl {
        #[arg(long = "url")]
        urls: Vec<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long, value_enum, default_value = "auto")]
        fetch_mode: FetchMode,
        #[arg(long, default_value = "sentence")]
        chunk_strategy: String,
        #[arg(long, default_value_t = config::DEFAULT_MAX_CHUNK_SIZE)]
        max_chunk_size: usize,
        #[arg(long, default_value_t = config::DEFAULT_CHUNK_OVERLAP)]
        overlap: usize,
        #[arg(long, default_value_t = config::DEFAULT_MAX_CONCURRENCY)]
        max_concurrency: usize,
        #[arg(long, default_value_t = config::DEFAULT_RATE_LIMIT_MS)]
        rate_limit_ms: u64,
        #[arg(long)]
        path_filter: Option<String>,
        #[arg(long, default_value_t = config::DEFAULT_DISCOVERY_MAX_URLS)]
        max_urls: usize,
        #[arg(long)]
        namespace: Option<String>,
    },
}

/// Run one CLI command, returning the process exit code.
pub async fn run(command: Command, config: AppConfig) -> i32 {
    match execute(command, config).await {
        Ok(Some(payload)) => {
            match serde_json::to_string_pretty(&payload) {
                Ok(rendered) => println!("{}", rendered),
                Err(e) => {
                    println!("{}", Error::internal(e.to_string()).envelope());
                    return 2;
                }
            }
            0
        }
        Ok(None) => 0,
        Err(e) => {
            println!("{}", e.envelope());
            e.exit_code()
        }
    }
}

fn build_fetcher(config: &AppConfig) -> Result<Arc<Fetcher>> {
    Ok(Arc::new(Fetcher::new(
        Duration::from_secs(config.fetch_timeout_secs),
        config.fetch_retries,
        config.min_static_text_len,
    )?))
}

/// Open everything a batch needs: fetcher, chunkers, embedder, store.
fn build_deps(config: &AppConfig) -> Result<Arc<PipelineDeps>> {
    let embedders = EmbedderRegistry::bootstrap(&config.models_dir());
    let embedder = embedders.get(&config.embedder)?;
    let store = Arc::new(VectorStore::open(config.index_dir(), embedder.dims())?);
    Ok(Arc::new(PipelineDeps {
        fetcher: build_fetcher(config)?,
        chunkers: Arc::new(ChunkerRegistry::new()),
        embedder,
        store,
        fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
        embed_timeout: Duration::from_secs(config.embed_timeout_secs),
    }))
}

async fn execute(command: Command, config: AppConfig) -> Result<Option<serde_json::Value>> {
    match command {
        Command::Serve { port } => {
            serve(port, config).await?;
            Ok(None)
        }
        Command::Search {
            query,
            max_results,
            freshness,
            language,
            include_domains,
        } => {
            let facade = SearchFacade::new(
                Arc::new(UnconfiguredProvider),
                Duration::from_secs(config.search_cache_ttl_secs),
            );
            let response = facade
                .search(&SearchQuery {
                    query,
                    max_results,
                    freshness,
                    language,
                    include_domains,
                })
                .await?;
            Ok(Some(serde_json::to_value(response).map_err(to_internal)?))
        }
        Command::Crawl {
            url,
            fetch_mode,
            output_format,
            include_links,
            include_images,
            wait_for_selector,
        } => {
            let fetcher = build_fetcher(&config)?;
            let mut result = fetcher
                .fetch(
                    &url,
                    &FetchOptions {
                        mode: fetch_mode,
                        wait_for_selector,
                        include_links,
                        include_images,
                    },
                )
                .await?;
            match output_format.as_str() {
                "markdown" => {}
                "text" => result.content = normalize::markdown_to_text(&result.content),
                other => {
                    return Err(Error::invalid_input(format!(
                        "unknown output format '{}'",
                        other
                    )))
                }
            }
            Ok(Some(serde_json::to_value(result).map_err(to_internal)?))
        }
        Command::Chunk {
            content,
            strategy,
            max_chunk_size,
            overlap,
            source_url,
            namespace,
        } => {
            let content = match content {
                Some(content) => content,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .map_err(|e| Error::io(format!("reading stdin: {}", e)))?;
                    buffer
                }
            };
            let namespace = resolve_namespace(namespace.as_deref(), None)?;
            let chunks = ChunkerRegistry::new().chunk(&ChunkRequest {
                content,
                strategy,
                max_chunk_size,
                overlap,
                source_url,
                namespace,
            })?;
            Ok(Some(serde_json::to_value(chunks).map_err(to_internal)?))
        }
        Command::Cache {
            query,
            top_k,
            threshold,
            namespace,
        } => {
            if query.trim().is_empty() {
                return Err(Error::invalid_input("query is empty"));
            }
            let namespace = resolve_namespace(namespace.as_deref(), None)?;
            let embedders = EmbedderRegistry::bootstrap(&config.models_dir());
            let embedder = embedders.get(&config.embedder)?;
            let store = VectorStore::open(config.index_dir(), embedder.dims())?;
            let vector = embedder.embed(&query)?;
            let hits = store.query(&namespace, &vector, top_k, threshold, false)?;
            Ok(Some(serde_json::to_value(hits).map_err(to_internal)?))
        }
        Command::Sitemap {
            domain,
            max_urls,
            path_filter,
        } => {
            let filter = path_filter
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| Error::invalid_input(format!("invalid path filter regex: {}", e)))?;
            let fetcher = build_fetcher(&config)?;
            let discovery =
                sitemap::discover(fetcher.client(), &domain, max_urls, filter.as_ref()).await?;
            Ok(Some(serde_json::to_value(discovery).map_err(to_internal)?))
        }
        Command::BatchCrawl {
            urls,
            domain,
            fetch_mode,
            chunk_strategy,
            max_chunk_size,
            overlap,
            max_concurrency,
            rate_limit_ms,
            path_filter,
            max_urls,
            namespace,
        } => {
            let namespace = resolve_namespace(namespace.as_deref(), None)?;
            let deps = build_deps(&config)?;
            let request = BatchRequest {
                urls,
                domain,
                fetch_mode,
                chunk_strategy,
                max_chunk_size,
                overlap,
                max_concurrency,
                rate_limit_ms,
                path_filter,
                max_urls,
                namespace: Some(namespace.clone()),
            };
            let ctx = RequestContext::new(namespace);
            let progress = Arc::new(JobProgress::new());
            let outcome = run_batch(deps, request, ctx, progress).await?;
            Ok(Some(serde_json::to_value(outcome).map_err(to_internal)?))
        }
    }
}

fn to_internal(e: serde_json::Error) -> Error {
    Error::internal(e.to_string())
}

async fn serve(port: u16, config: AppConfig) -> Result<()> {
    let deps = build_deps(&config)?;
    let jobs = JobManager::new(
        Arc::clone(&deps),
        Duration::from_secs(config.job_retention_secs),
        config.job_cap,
    );
    jobs.start_sweeper(Duration::from_secs(config::JOB_SWEEP_INTERVAL_SECS));

    let search = Arc::new(SearchFacade::new(
        Arc::new(UnconfiguredProvider),
        Duration::from_secs(config.search_cache_ttl_secs),
    ));

    let state = AppState {
        deps: Arc::clone(&deps),
        jobs,
        search,
    };
    let app = api::routes(state).layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server listening on {}", addr);
    info!("Index: {:?} ({} dims)", config.index_dir(), deps.store.dims());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::io(format!("bind {}: {}", addr, e)))?;

    let store = Arc::clone(&deps.store);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, flushing index");
                if let Err(e) = store.flush() {
                    tracing::error!("Flush on shutdown failed: {}", e);
                }
            }
        })
        .await
        .map_err(|e| Error::io(format!("server error: {}", e)))?;

    deps.store.flush()?;
    Ok(())
}
