//! Tuning constants and runtime configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};

// Fetcher
pub const FETCH_TIMEOUT_SECS: u64 = 30;
pub const FETCH_MAX_RETRIES: u32 = 2;
pub const FETCH_MAX_REDIRECTS: usize = 5;
pub const RETRY_BASE_BACKOFF_MS: u64 = 250;
pub const USER_AGENT: &str = "websearch/0.4 (research appliance; bot)";

// Auto mode falls back to the dynamic fetcher below this much normalized text
pub const DEFAULT_MIN_STATIC_TEXT_LEN: usize = 200;

// Embedder
pub const EMBED_TIMEOUT_SECS: u64 = 20;
pub const HASH_EMBEDDER_DIMS: usize = 128;

// Chunker
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 0;

// Discovery
pub const SITEMAP_INDEX_MAX_DEPTH: usize = 2;
pub const DEFAULT_DISCOVERY_MAX_URLS: usize = 100;
pub const DEFAULT_MAP_MAX_DEPTH: usize = 2;

// Batch pipeline
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 250;

// Jobs
pub const JOB_RETENTION_SECS: u64 = 3600;
pub const JOB_HARD_CAP: usize = 1000;
pub const JOB_SWEEP_INTERVAL_SECS: u64 = 60;

// Search facade
pub const SEARCH_CACHE_CAPACITY: usize = 256;
pub const SEARCH_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_SEARCH_MAX_RESULTS: usize = 10;

// Vector store
pub const WAL_COALESCE_THRESHOLD: usize = 1024;
pub const DEFAULT_QUERY_TOP_K: usize = 10;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// State root. Defaults to `~/.websearch`.
    pub data_dir: PathBuf,
    pub embedder: String,
    pub min_static_text_len: usize,
    pub fetch_timeout_secs: u64,
    pub fetch_retries: u32,
    pub embed_timeout_secs: u64,
    pub job_retention_secs: u64,
    pub job_cap: usize,
    pub search_cache_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: home.join(".websearch"),
            embedder: "hash".to_string(),
            min_static_text_len: DEFAULT_MIN_STATIC_TEXT_LEN,
            fetch_timeout_secs: FETCH_TIMEOUT_SECS,
            fetch_retries: FETCH_MAX_RETRIES,
            embed_timeout_secs: EMBED_TIMEOUT_SECS,
            job_retention_secs: JOB_RETENTION_SECS,
            job_cap: JOB_HARD_CAP,
            search_cache_ttl_secs: SEARCH_CACHE_TTL_SECS,
        }
    }
}

/// Optional `config.toml` at the state root. All fields optional; CLI flags win.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub embedder: Option<String>,
    pub min_static_text_len: Option<usize>,
    pub fetch_timeout_secs: Option<u64>,
    pub fetch_retries: Option<u32>,
    pub embed_timeout_secs: Option<u64>,
    pub job_retention_secs: Option<u64>,
    pub job_cap: Option<usize>,
    pub search_cache_ttl_secs: Option<u64>,
}

impl AppConfig {
    /// Resolve the effective config: defaults, then `config.toml` if present.
    pub fn load(data_dir_override: Option<&Path>) -> Self {
        let mut config = AppConfig::default();
        if let Some(dir) = data_dir_override {
            config.data_dir = dir.to_path_buf();
        }

        let config_path = config.data_dir.join("config.toml");
        if let Ok(raw) = std::fs::read_to_string(&config_path) {
            match toml::from_str::<FileConfig>(&raw) {
                Ok(file) => config.apply(file, data_dir_override.is_some()),
                Err(e) => {
                    tracing::warn!("Ignoring malformed {}: {}", config_path.display(), e);
                }
            }
        }
        config
    }

    fn apply(&mut self, file: FileConfig, data_dir_pinned: bool) {
        if !data_dir_pinned {
            if let Some(dir) = file.data_dir {
                self.data_dir = dir;
            }
        }
        if let Some(v) = file.embedder {
            self.embedder = v;
        }
        if let Some(v) = file.min_static_text_len {
            self.min_static_text_len = v;
        }
        if let Some(v) = file.fetch_timeout_secs {
            self.fetch_timeout_secs = v;
        }
        if let Some(v) = file.fetch_retries {
            self.fetch_retries = v;
        }
        if let Some(v) = file.embed_timeout_secs {
            self.embed_timeout_secs = v;
        }
        if let Some(v) = file.job_retention_secs {
            self.job_retention_secs = v;
        }
        if let Some(v) = file.job_cap {
            self.job_cap = v;
        }
        if let Some(v) = file.search_cache_ttl_secs {
            self.search_cache_ttl_secs = v;
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    /// Deleting this directory is the supported reset action.
    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }
}
