//! Web-search facade: a pluggable provider behind a TTL response cache.

use crate::config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
    pub freshness: Option<String>,
    pub language: Option<String>,
    pub include_domains: Vec<String>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            max_results: config::DEFAULT_SEARCH_MAX_RESULTS,
            freshness: None,
            language: None,
            include_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub provider: String,
    pub results: Vec<SearchHit>,
    pub response_time_ms: u64,
    pub from_cache: bool,
}

/// External search engine adapter. Rate limiting is the provider's problem;
/// the facade surfaces provider errors verbatim.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>>;
}

/// Placeholder wired in when no real provider is configured.
pub struct UnconfiguredProvider;

#[async_trait]
impl SearchProvider for UnconfiguredProvider {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn search(&self, _query: &SearchQuery) -> Result<Vec<SearchHit>> {
        Err(Error::internal("no search provider configured"))
    }
}

struct CachedEntry {
    hits: Vec<SearchHit>,
    stored_at: Instant,
}

pub struct SearchFacade {
    provider: Arc<dyn SearchProvider>,
    cache: Mutex<LruCache<SearchQuery, CachedEntry>>,
    ttl: Duration,
}

impl SearchFacade {
    pub fn new(provider: Arc<dyn SearchProvider>, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(config::SEARCH_CACHE_CAPACITY)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            provider,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        if query.query.trim().is_empty() {
            return Err(Error::invalid_input("query is empty"));
        }

        if let Ok(mut cache) = self.cache.lock() {
            if let Some(entry) = cache.get(query) {
                if entry.stored_at.elapsed() < self.ttl {
                    debug!("Search cache hit for '{}'", query.query);
                    return Ok(SearchResponse {
                        provider: self.provider.name().to_string(),
                        results: entry.hits.clone(),
                        response_time_ms: 0,
                        from_cache: true,
                    });
                }
                cache.pop(query);
            }
        }

        let start = Instant::now();
        let hits = self.provider.search(query).await?;
        let response_time_ms = start.elapsed().as_millis() as u64;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                query.clone(),
                CachedEntry {
                    hits: hits.clone(),
                    stored_at: Instant::now(),
                },
            );
        }

        Ok(SearchResponse {
            provider: self.provider.name().to_string(),
            results: hits,
            response_time_ms,
            from_cache: false,
        })
    }
}
