use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::catalog::UrlCatalog;
use crate::chunk::{Chunker, ChunkerConfig};
use crate::core::config::Config;
use crate::crawl::{CrawlConfig, Crawler};
use crate::discover::{ApiSearchProvider, Orchestrator};
use crate::fetch::{render::Renderer, FetcherSet, HtmlFetcher, RepoFetcher, VideoFetcher};
use crate::index::{LexicalIndex, VectorIndex};
use crate::nlp::{
    Embedder, Enricher, HashEmbedder, LexicalReranker, LlmClient, Model2VecEmbedder,
};
use crate::pipeline::{
    HostBackoff, HostRateLimiter, Ingestor, ProcessorConfig, QueueProcessor, Refresher,
    RefresherConfig,
};
use crate::retrieve::RetrievalEngine;

/// Everything the exposed operations run against, built once at startup.
pub struct AppState {
    pub config: Config,
    pub http_client: reqwest::Client,
    pub catalog: Arc<UrlCatalog>,
    pub vectors: Arc<VectorIndex>,
    pub orchestrator: Arc<Orchestrator>,
    pub processor: Arc<QueueProcessor>,
    pub refresher: Arc<Refresher>,
    pub retrieval: Arc<RetrievalEngine>,
    /// Observed by the processor and refresher between batches and stages.
    pub stop: Arc<AtomicBool>,
}

impl AppState {
    pub async fn init(config: Config) -> Result<AppState> {
        config.validate().context("configuration invalid")?;

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http_timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;

        let embedder = build_embedder(&config).await?;
        let catalog = Arc::new(UrlCatalog::open(&config.catalog_path)?);

        let store_uri = config
            .vector_store_path
            .to_str()
            .context("vector store path is not valid UTF-8")?
            .to_string();
        std::fs::create_dir_all(&config.vector_store_path)
            .with_context(|| format!("creating {}", config.vector_store_path.display()))?;
        let vectors = Arc::new(VectorIndex::open(&store_uri, embedder.dimension()).await?);

        std::fs::create_dir_all(&config.workspace_root)
            .with_context(|| format!("creating {}", config.workspace_root.display()))?;

        let renderer = Renderer::new_auto().map(Arc::new);
        let html = Arc::new(HtmlFetcher::new(
            http_client.clone(),
            config.user_agent.clone(),
            config.head_timeout_secs,
            renderer,
        ));
        let repo = Arc::new(RepoFetcher::new(config.workspace_root.clone()));
        let video = Arc::new(VideoFetcher::new(
            http_client.clone(),
            config.transcript_endpoint.clone(),
            config.user_agent.clone(),
        ));
        let fetchers = Arc::new(FetcherSet {
            html: html.clone(),
            repo: repo.clone(),
            video,
            channel_max_videos: config.channel_max_videos,
        });

        let llm = LlmClient::new(
            http_client.clone(),
            config.llm_base_url.clone(),
            config.llm_api_key.clone(),
            config.llm_timeout_secs,
        );
        let enricher = Arc::new(Enricher::new(llm.clone(), config.llm_enrich_model.clone()));

        let ingestor = Arc::new(Ingestor::new(
            Chunker::new(ChunkerConfig {
                min_tokens: config.chunk_min_tokens,
                max_tokens: config.chunk_max_tokens,
                overlap_tokens: config.chunk_overlap_tokens,
            }),
            embedder.clone(),
            Some(enricher),
            vectors.clone(),
            config.embed_batch_size,
            config.enrich_concurrency,
        ));

        let provider = Arc::new(ApiSearchProvider::new(
            http_client.clone(),
            config.search_endpoint.clone(),
            config.search_api_key.clone().unwrap_or_default(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            provider,
            llm.clone(),
            config.llm_query_model.clone(),
            catalog.clone(),
            config
                .host_quality
                .iter()
                .map(|h| (h.host_suffix.clone(), h.weight))
                .collect(),
            config.tracking_params.clone(),
            config.competitor_queries,
        ));

        let rate = Arc::new(HostRateLimiter::new(config.rate_per_host));
        let backoff = Arc::new(HostBackoff::new());
        let stop = Arc::new(AtomicBool::new(false));
        let crawler = Arc::new(Crawler::new(http_client.clone(), config.user_agent.clone()));

        let processor = Arc::new(QueueProcessor::new(
            catalog.clone(),
            fetchers,
            Some(crawler),
            ingestor.clone(),
            rate.clone(),
            backoff.clone(),
            stop.clone(),
            ProcessorConfig {
                batch_size: config.batch_size,
                workers: config.workers,
                max_retries: config.max_retries,
                channel_video_priority: 50,
                crawl: CrawlConfig {
                    max_pages: config.crawl_max_pages,
                    time_budget: std::time::Duration::from_secs(config.crawl_time_budget_secs),
                },
            },
        ));

        let refresher = Arc::new(Refresher::new(
            catalog.clone(),
            vectors.clone(),
            html,
            repo,
            ingestor,
            rate,
            backoff,
            stop.clone(),
            RefresherConfig {
                batch_limit: config.refresh_batch_limit,
                max_retries: config.max_retries,
                interval: std::time::Duration::from_secs(config.refresh_interval_secs),
            },
        ));

        let retrieval = Arc::new(RetrievalEngine::new(
            vectors.clone(),
            Arc::new(LexicalIndex::new()),
            embedder,
            Some(Arc::new(LexicalReranker)),
            Some((llm, config.llm_query_model.clone())),
        ));

        Ok(AppState {
            config,
            http_client,
            catalog,
            vectors,
            orchestrator,
            processor,
            refresher,
            retrieval,
            stop,
        })
    }

    /// Paired wipe: the catalog and the vector store only ever reset
    /// together, so the two on-disk roots stay a consistent snapshot.
    pub async fn reset_all(&self) -> Result<()> {
        let urls: Vec<String> = {
            let chunks = self.vectors.scan_all().await?;
            let mut urls: Vec<String> = chunks.into_iter().map(|c| c.source_url).collect();
            urls.sort();
            urls.dedup();
            urls
        };
        for url in urls {
            self.vectors.delete_by_source_url(&url).await?;
        }
        self.catalog.delete_all().await?;
        tracing::info!("catalog and vector store wiped");
        Ok(())
    }
}

/// `hash:<dim>` selects the offline feature-hashing embedder; anything else
/// is a Model2Vec model id.
async fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    if let Some(dim) = config.embedding_model.strip_prefix("hash:") {
        let dim: usize = dim
            .parse()
            .with_context(|| format!("bad hash embedder dimension '{dim}'"))?;
        if dim == 0 {
            bail!("hash embedder dimension must be positive");
        }
        return Ok(Arc::new(HashEmbedder { dim }));
    }
    let embedder =
        Model2VecEmbedder::load(&config.embedding_model, config.embedding_dim).await?;
    Ok(Arc::new(embedder))
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("catalog_path", &self.config.catalog_path)
            .field("vector_store_path", &self.config.vector_store_path)
            .finish()
    }
}
