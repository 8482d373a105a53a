use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config — file-based loader (lorebase.json) with env-var fallback per field
// ---------------------------------------------------------------------------

/// Raw `lorebase.json` shape. Every field optional; [`Config::load`] applies
/// file → `LOREBASE_*` env var → built-in default, in that order.
#[derive(Deserialize, Default, Clone, Debug)]
pub struct ConfigFile {
    // Queue processing
    pub batch_size: Option<usize>,
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub rate_per_host: Option<f64>,

    // Chunking
    pub chunk_min_tokens: Option<usize>,
    pub chunk_max_tokens: Option<usize>,
    pub chunk_overlap_tokens: Option<usize>,

    // Embedding / enrichment
    pub embedding_model: Option<String>,
    pub embedding_dim: Option<usize>,
    pub embed_batch_size: Option<usize>,
    pub enrich_concurrency: Option<usize>,

    // Refresh
    pub auto_refresh: Option<bool>,
    pub refresh_interval_secs: Option<u64>,
    pub refresh_batch_limit: Option<usize>,

    // Discovery
    pub competitor_queries: Option<bool>,
    pub search_endpoint: Option<String>,
    pub search_api_key: Option<String>,

    // Crawling
    pub crawl_max_pages: Option<usize>,
    pub crawl_time_budget_secs: Option<u64>,

    // LLM (query analysis + enrichment may use distinct models)
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_query_model: Option<String>,
    pub llm_enrich_model: Option<String>,

    // Video / transcripts
    pub transcript_endpoint: Option<String>,
    pub channel_max_videos: Option<usize>,
    pub channel_full_videos: Option<usize>,

    // Paths
    pub workspace_root: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub vector_store_path: Option<PathBuf>,

    // HTTP
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub head_timeout_secs: Option<u64>,
    pub llm_timeout_secs: Option<u64>,
    pub port: Option<u16>,

    // Retrieval
    pub similarity_threshold: Option<f32>,

    // Normalization / scoring extras
    #[serde(default)]
    pub tracking_params: Vec<String>,
    #[serde(default)]
    pub host_quality: Vec<HostQuality>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct HostQuality {
    pub host_suffix: String,
    pub weight: f32,
}

/// Fully-resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub batch_size: usize,
    pub workers: usize,
    pub max_retries: u32,
    pub rate_per_host: f64,

    pub chunk_min_tokens: usize,
    pub chunk_max_tokens: usize,
    pub chunk_overlap_tokens: usize,

    pub embedding_model: String,
    /// `None` = probe the model at startup and pin whatever it emits.
    pub embedding_dim: Option<usize>,
    pub embed_batch_size: usize,
    pub enrich_concurrency: usize,

    pub auto_refresh: bool,
    pub refresh_interval_secs: u64,
    pub refresh_batch_limit: usize,

    pub competitor_queries: bool,
    pub search_endpoint: String,
    pub search_api_key: Option<String>,

    pub crawl_max_pages: usize,
    pub crawl_time_budget_secs: u64,

    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_query_model: String,
    pub llm_enrich_model: String,

    pub transcript_endpoint: String,
    pub channel_max_videos: usize,
    pub channel_full_videos: usize,

    pub workspace_root: PathBuf,
    pub catalog_path: PathBuf,
    pub vector_store_path: PathBuf,

    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub head_timeout_secs: u64,
    pub llm_timeout_secs: u64,
    pub port: u16,

    pub similarity_threshold: f32,

    pub tracking_params: Vec<String>,
    pub host_quality: Vec<HostQuality>,
}

fn env<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn data_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lorebase")
}

impl Config {
    pub fn load() -> Config {
        Config::from_file(load_config_file())
    }

    pub fn from_file(f: ConfigFile) -> Config {
        let root = data_root();
        Config {
            batch_size: f.batch_size.or_else(|| env("LOREBASE_BATCH_SIZE")).unwrap_or(10),
            workers: f.workers.or_else(|| env("LOREBASE_WORKERS")).unwrap_or(3),
            max_retries: f.max_retries.or_else(|| env("LOREBASE_MAX_RETRIES")).unwrap_or(3),
            rate_per_host: f
                .rate_per_host
                .or_else(|| env("LOREBASE_RATE_PER_HOST"))
                .unwrap_or(1.0),

            chunk_min_tokens: f.chunk_min_tokens.unwrap_or(100),
            chunk_max_tokens: f.chunk_max_tokens.unwrap_or(512),
            chunk_overlap_tokens: f.chunk_overlap_tokens.unwrap_or(50),

            embedding_model: f
                .embedding_model
                .or_else(|| env_str("LOREBASE_EMBEDDING_MODEL"))
                .unwrap_or_else(|| "minishlab/potion-base-8M".to_string()),
            embedding_dim: f.embedding_dim.or_else(|| env("LOREBASE_EMBEDDING_DIM")),
            embed_batch_size: f.embed_batch_size.unwrap_or(32),
            enrich_concurrency: f.enrich_concurrency.unwrap_or(2),

            auto_refresh: f
                .auto_refresh
                .or_else(|| env("LOREBASE_AUTO_REFRESH"))
                .unwrap_or(false),
            refresh_interval_secs: f
                .refresh_interval_secs
                .or_else(|| env("LOREBASE_REFRESH_INTERVAL_SECS"))
                .unwrap_or(7 * 24 * 3600),
            refresh_batch_limit: f.refresh_batch_limit.unwrap_or(100),

            competitor_queries: f
                .competitor_queries
                .or_else(|| env("LOREBASE_COMPETITOR_QUERIES"))
                .unwrap_or(false),
            search_endpoint: f
                .search_endpoint
                .or_else(|| env_str("LOREBASE_SEARCH_ENDPOINT"))
                .unwrap_or_else(|| "https://api.search.brave.com/res/v1/web/search".to_string()),
            search_api_key: f.search_api_key.or_else(|| env_str("LOREBASE_SEARCH_API_KEY")),

            crawl_max_pages: f
                .crawl_max_pages
                .or_else(|| env("LOREBASE_CRAWL_MAX_PAGES"))
                .unwrap_or(1000),
            crawl_time_budget_secs: f
                .crawl_time_budget_secs
                .or_else(|| env("LOREBASE_CRAWL_TIME_BUDGET_SECS"))
                .unwrap_or(600),

            llm_base_url: f
                .llm_base_url
                .or_else(|| env_str("LOREBASE_LLM_BASE_URL"))
                .or_else(|| env_str("OPENAI_BASE_URL"))
                .unwrap_or_else(|| "http://localhost:11434/v1".to_string()),
            llm_api_key: f
                .llm_api_key
                .or_else(|| env_str("LOREBASE_LLM_API_KEY"))
                .or_else(|| env_str("OPENAI_API_KEY")),
            llm_query_model: f
                .llm_query_model
                .or_else(|| env_str("LOREBASE_LLM_QUERY_MODEL"))
                .unwrap_or_else(|| "qwen2.5:7b".to_string()),
            llm_enrich_model: f
                .llm_enrich_model
                .or_else(|| env_str("LOREBASE_LLM_ENRICH_MODEL"))
                .unwrap_or_else(|| "qwen2.5:7b".to_string()),

            transcript_endpoint: f
                .transcript_endpoint
                .or_else(|| env_str("LOREBASE_TRANSCRIPT_ENDPOINT"))
                .unwrap_or_else(|| "https://yewtu.be/api/v1".to_string()),
            channel_max_videos: f.channel_max_videos.unwrap_or(50),
            channel_full_videos: f.channel_full_videos.unwrap_or(500),

            workspace_root: f
                .workspace_root
                .or_else(|| env_str("LOREBASE_WORKSPACE_ROOT").map(PathBuf::from))
                .unwrap_or_else(std::env::temp_dir),
            catalog_path: f
                .catalog_path
                .or_else(|| env_str("LOREBASE_CATALOG_PATH").map(PathBuf::from))
                .unwrap_or_else(|| root.join("catalog.db")),
            vector_store_path: f
                .vector_store_path
                .or_else(|| env_str("LOREBASE_VECTOR_STORE_PATH").map(PathBuf::from))
                .unwrap_or_else(|| root.join("lancedb")),

            user_agent: f
                .user_agent
                .or_else(|| env_str("LOREBASE_USER_AGENT"))
                .unwrap_or_else(|| {
                    format!("lorebase/{} (+https://github.com/lorebase-works/lorebase)",
                        env!("CARGO_PKG_VERSION"))
                }),
            http_timeout_secs: f.http_timeout_secs.or_else(|| env("HTTP_TIMEOUT_SECS")).unwrap_or(30),
            head_timeout_secs: f.head_timeout_secs.unwrap_or(10),
            llm_timeout_secs: f.llm_timeout_secs.unwrap_or(60),
            port: f
                .port
                .or_else(|| env("LOREBASE_PORT"))
                .or_else(|| env("PORT"))
                .unwrap_or(8760),

            similarity_threshold: f
                .similarity_threshold
                .or_else(|| env("LOREBASE_SIMILARITY_THRESHOLD"))
                .unwrap_or(0.4),

            tracking_params: f.tracking_params,
            host_quality: f.host_quality,
        }
    }

    /// Startup validation: anything wrong here is a `ConfigError` and the
    /// process exits non-zero before touching the stores.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_min_tokens >= self.chunk_max_tokens {
            bail!(
                "chunk_min_tokens ({}) must be below chunk_max_tokens ({})",
                self.chunk_min_tokens,
                self.chunk_max_tokens
            );
        }
        if self.chunk_overlap_tokens >= self.chunk_min_tokens {
            bail!(
                "chunk_overlap_tokens ({}) must be below chunk_min_tokens ({})",
                self.chunk_overlap_tokens,
                self.chunk_min_tokens
            );
        }
        if self.workers == 0 || self.batch_size == 0 {
            bail!("workers and batch_size must be at least 1");
        }
        if !(self.rate_per_host > 0.0) {
            bail!("rate_per_host must be positive, got {}", self.rate_per_host);
        }
        if which::which("git").is_err() {
            tracing::warn!("git client not found on PATH; repo sources will fail to ingest");
        }
        Ok(())
    }
}

/// Load `lorebase.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `LOREBASE_CONFIG` env var path
/// 2. `./lorebase.json`
/// 3. `../lorebase.json`
///
/// Missing file → defaults (env-var fallbacks still apply).
/// Parse error → log a warning, return defaults.
pub fn load_config_file() -> ConfigFile {
    let mut candidates = vec![
        PathBuf::from("lorebase.json"),
        PathBuf::from("../lorebase.json"),
    ];
    if let Ok(env_path) = std::env::var("LOREBASE_CONFIG") {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<ConfigFile>(&contents) {
                Ok(cfg) => {
                    tracing::info!("lorebase.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "lorebase.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return ConfigFile::default();
                }
            },
            Err(_) => continue,
        }
    }

    ConfigFile::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::from_file(ConfigFile::default());
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.chunk_min_tokens, 100);
        assert_eq!(cfg.chunk_max_tokens, 512);
        assert_eq!(cfg.chunk_overlap_tokens, 50);
        assert_eq!(cfg.crawl_max_pages, 1000);
        assert_eq!(cfg.channel_max_videos, 50);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_chunk_bounds() {
        let mut file = ConfigFile::default();
        file.chunk_min_tokens = Some(600);
        assert!(Config::from_file(file).validate().is_err());

        let mut file = ConfigFile::default();
        file.chunk_overlap_tokens = Some(100);
        assert!(Config::from_file(file).validate().is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let file: ConfigFile =
            serde_json::from_str(r#"{"batch_size": 4, "rate_per_host": 0.5}"#).unwrap();
        let cfg = Config::from_file(file);
        assert_eq!(cfg.batch_size, 4);
        assert!((cfg.rate_per_host - 0.5).abs() < f64::EPSILON);
    }
}
