//! Page fetching: static HTTP, dynamic headless rendering, and the auto mode
//! that prefers static and falls back on SPA-shaped or empty responses.

pub mod dynamic;
pub mod normalize;
mod static_http;

pub use dynamic::{BrowserDriver, CaptchaChallenge, CaptchaSolver};

use crate::config;
use crate::error::{Error, ErrorKind, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Static,
    Dynamic,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    pub url: String,
    pub final_url: String,
    pub title: Option<String>,
    pub content: String,
    pub links: Vec<String>,
    pub images: Vec<String>,
    pub word_count: usize,
    pub status_code: u16,
    pub fetcher_used: String,
    pub fetch_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub mode: FetchMode,
    pub wait_for_selector: Option<String>,
    pub include_links: bool,
    pub include_images: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            mode: FetchMode::Auto,
            wait_for_selector: None,
            include_links: true,
            include_images: false,
        }
    }
}

pub struct Fetcher {
    client: reqwest::Client,
    driver: Option<Arc<dyn BrowserDriver>>,
    solver: Option<Arc<dyn CaptchaSolver>>,
    retries: u32,
    min_static_text_len: usize,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(timeout: Duration, retries: u32, min_static_text_len: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config::USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(
                config::FETCH_MAX_REDIRECTS,
            ))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            driver: None,
            solver: None,
            retries,
            min_static_text_len,
            timeout,
        })
    }

    pub fn with_driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn CaptchaSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Pooled client, shared with the sitemap resolver.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch(&self, raw_url: &str, opts: &FetchOptions) -> Result<FetchResult> {
        let url = Url::parse(raw_url)
            .map_err(|e| Error::invalid_input(format!("invalid url '{}': {}", raw_url, e)))?;
        if !crate::urls::is_fetchable_scheme(&url) {
            return Err(Error::new(
                ErrorKind::UnsupportedScheme,
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        match opts.mode {
            FetchMode::Static => Ok(self.static_with_retries(&url, opts).await?.result),
            FetchMode::Dynamic => self.dynamic(&url, opts).await,
            FetchMode::Auto => {
                let fetched = self.static_with_retries(&url, opts).await?;
                if !self.needs_dynamic(&fetched) {
                    return Ok(fetched.result);
                }
                match &self.driver {
                    None => {
                        debug!("Auto mode: thin response from {} but no driver configured", url);
                        Ok(fetched.result)
                    }
                    Some(_) => {
                        debug!("Auto mode: refetching {} with the dynamic fetcher", url);
                        match self.dynamic(&url, opts).await {
                            Ok(result) => Ok(result),
                            Err(e) => {
                                warn!("Dynamic fallback for {} failed: {}", url, e);
                                Ok(fetched.result)
                            }
                        }
                    }
                }
            }
        }
    }

    fn needs_dynamic(&self, fetched: &static_http::StaticFetch) -> bool {
        if fetched.result.fetcher_used == "pdf" {
            return false;
        }
        if fetched.result.content.len() < self.min_static_text_len {
            return true;
        }
        fetched
            .raw_html
            .as_deref()
            .map(normalize::looks_like_spa)
            .unwrap_or(false)
    }

    async fn dynamic(&self, url: &Url, opts: &FetchOptions) -> Result<FetchResult> {
        let driver = self.driver.as_ref().ok_or_else(|| {
            Error::internal("dynamic fetch requires a browser driver; none is configured")
        })?;
        dynamic::fetch_dynamic(driver, self.solver.as_ref(), url, opts, self.timeout).await
    }

    async fn static_with_retries(
        &self,
        url: &Url,
        opts: &FetchOptions,
    ) -> Result<static_http::StaticFetch> {
        let mut attempt = 0;
        loop {
            match static_http::fetch_static(&self.client, url, opts).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) => {
                    if attempt >= self.retries || !e.is_transient() {
                        return Err(e);
                    }
                    let delay = retry_delay(&e, attempt);
                    debug!(
                        "Retrying {} after {:?} (attempt {}/{}): {}",
                        url,
                        delay,
                        attempt + 1,
                        self.retries,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Exponential backoff with jitter; 429 honors Retry-After when present.
fn retry_delay(err: &Error, attempt: u32) -> Duration {
    if err.kind == ErrorKind::RateLimited {
        if let Some(ms) = err.detail_u64("retry_after_ms") {
            return Duration::from_millis(ms);
        }
    }
    let base = config::RETRY_BASE_BACKOFF_MS * (1 << attempt);
    let jitter = rand::thread_rng().gen_range(0..config::RETRY_BASE_BACKOFF_MS / 2);
    Duration::from_millis(base + jitter)
}
