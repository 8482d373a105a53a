//! Queue-driven batch processor.
//!
//! Drains the catalog's pending set: claim a batch, dispatch each entry to
//! its fetcher under the per-host gates, expand crawls and channels into new
//! pending entries, and push fetched documents through the ingest stage.
//! Fetch errors never propagate — they become catalog state via the retry
//! accounting. Only store corruption aborts the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::catalog::{normalize, UrlCatalog};
use crate::core::error::{is_corruption, FetchError};
use crate::core::types::{CatalogEntry, ProcessReport, SourceKind};
use crate::crawl::{CrawlConfig, Crawler};
use crate::fetch::{FetchOutcome, Fetchers};
use crate::pipeline::ingest::Ingestor;
use crate::pipeline::rate_limit::{HostBackoff, HostRateLimiter};

#[derive(Clone)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub max_retries: u32,
    pub channel_video_priority: i64,
    pub crawl: CrawlConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            batch_size: 10,
            workers: 3,
            max_retries: 3,
            channel_video_priority: 50,
            crawl: CrawlConfig::default(),
        }
    }
}

enum Attempt {
    Succeeded,
    /// Transient failure, entry re-entered pending.
    Requeued,
    /// Entry stuck at failed.
    Failed,
}

pub struct QueueProcessor {
    catalog: Arc<UrlCatalog>,
    fetchers: Arc<dyn Fetchers>,
    /// Absent in stripped-down deployments and tests; doc-site entries are
    /// then fetched without expansion.
    crawler: Option<Arc<Crawler>>,
    ingestor: Arc<Ingestor>,
    rate: Arc<HostRateLimiter>,
    backoff: Arc<HostBackoff>,
    stop: Arc<AtomicBool>,
    cfg: ProcessorConfig,
}

impl QueueProcessor {
    pub fn new(
        catalog: Arc<UrlCatalog>,
        fetchers: Arc<dyn Fetchers>,
        crawler: Option<Arc<Crawler>>,
        ingestor: Arc<Ingestor>,
        rate: Arc<HostRateLimiter>,
        backoff: Arc<HostBackoff>,
        stop: Arc<AtomicBool>,
        cfg: ProcessorConfig,
    ) -> QueueProcessor {
        QueueProcessor {
            catalog,
            fetchers,
            crawler,
            ingestor,
            rate,
            backoff,
            stop,
            cfg,
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Drain pending entries until the queue is empty, the batch cap is hit,
    /// or a stop is requested. An empty queue is a no-op returning zeros.
    pub async fn process_queue(&self, max_batches: Option<usize>) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();
        let mut batches = 0usize;

        loop {
            if self.stopping() {
                tracing::info!("stop requested, leaving queue loop");
                break;
            }
            if let Some(cap) = max_batches {
                if batches >= cap {
                    break;
                }
            }

            let batch = self.catalog.claim_batch(self.cfg.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            batches += 1;
            tracing::info!("processing batch of {} entries", batch.len());

            let attempts: Vec<Result<Attempt>> = stream::iter(batch)
                .map(|entry| async move { self.process_entry(entry).await })
                .buffer_unordered(self.cfg.workers)
                .collect()
                .await;

            for attempt in attempts {
                match attempt {
                    Ok(Attempt::Succeeded) => report.succeeded += 1,
                    Ok(Attempt::Requeued) => report.skipped += 1,
                    Ok(Attempt::Failed) => report.failed += 1,
                    Err(e) => {
                        // Corruption is fatal by policy; anything else has
                        // already been absorbed into catalog state.
                        if is_corruption(&e) {
                            return Err(e);
                        }
                        tracing::error!("entry processing error: {:#}", e);
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn process_entry(&self, entry: CatalogEntry) -> Result<Attempt> {
        if self.stopping() {
            // Leave the claim to lapse; the entry stays pending.
            return Ok(Attempt::Requeued);
        }

        // Crawl-eligible: a documentation page that was not itself discovered
        // by a crawl. Expansion failures are logged, never fatal — the start
        // page still gets fetched as a normal entry below.
        if self.crawl_eligible(&entry) {
            if let Some(crawler) = &self.crawler {
                match crawler.crawl(&entry.url, &self.cfg.crawl).await {
                    Ok(outcome) => {
                        if let Err(e) = self.insert_crawled(&entry, outcome.discovered).await {
                            if is_corruption(&e) {
                                return Err(e);
                            }
                            tracing::warn!("inserting crawl results for {}: {:#}", entry.url, e);
                        }
                    }
                    Err(e) => tracing::warn!("crawl of {} failed: {:#}", entry.url, e),
                }
            }
        }

        let host = normalize::domain_of(&entry.url);
        self.backoff.wait_if_backed_off(&host).await;
        self.rate.acquire(&host).await;

        match self.fetchers.dispatch(&entry).await {
            Ok(FetchOutcome::Document(doc)) => {
                self.backoff.note_success(&host).await;
                if self.stopping() {
                    return Ok(Attempt::Requeued);
                }
                match self.ingestor.ingest(&entry.url, entry.kind, &doc).await {
                    Ok(chunks) => {
                        tracing::info!("indexed {} ({} chunks)", entry.url, chunks);
                        let now = Utc::now();
                        self.catalog
                            .mark_fetched(
                                entry.url_hash.clone(),
                                now,
                                entry.refresh_policy.next_from(now),
                            )
                            .await?;
                        Ok(Attempt::Succeeded)
                    }
                    Err(e) => {
                        if is_corruption(&e) {
                            return Err(e);
                        }
                        let fetch_err = match e.downcast::<FetchError>() {
                            Ok(fe) => fe,
                            Err(other) => FetchError::Transient(format!("{other:#}")),
                        };
                        self.record_failure(&entry, &host, fetch_err).await
                    }
                }
            }
            Ok(FetchOutcome::ChannelVideos(videos)) => {
                self.backoff.note_success(&host).await;
                let inserted = self.insert_channel_videos(&entry, videos).await?;
                tracing::info!("channel {} expanded into {} videos", entry.url, inserted);
                self.catalog
                    .mark_fetched(entry.url_hash.clone(), Utc::now(), None)
                    .await?;
                Ok(Attempt::Succeeded)
            }
            Err(fetch_err) => self.record_failure(&entry, &host, fetch_err).await,
        }
    }

    fn crawl_eligible(&self, entry: &CatalogEntry) -> bool {
        entry.kind == SourceKind::DocSitePage
            && !entry
                .discovered_from
                .as_deref()
                .map(|d| d.starts_with("crawl:"))
                .unwrap_or(false)
    }

    /// Crawl products become ordinary pending pages at crawler priority with
    /// the cycle-prevention marker.
    async fn insert_crawled(&self, start: &CatalogEntry, discovered: Vec<String>) -> Result<usize> {
        let marker = format!("crawl:{}", start.url);
        let entries: Vec<CatalogEntry> = discovered
            .into_iter()
            .filter(|url| *url != start.url)
            .map(|url| CatalogEntry::new(url, SourceKind::WebPage, 50, Some(marker.clone())))
            .collect();
        if entries.is_empty() {
            return Ok(0);
        }
        let outcome = self.catalog.insert_if_absent(entries).await?;
        tracing::info!(
            "crawl of {} enqueued {} new pages ({} already known)",
            start.url,
            outcome.added,
            outcome.skipped
        );
        Ok(outcome.added)
    }

    async fn insert_channel_videos(
        &self,
        channel: &CatalogEntry,
        videos: Vec<String>,
    ) -> Result<usize> {
        let mut entries = Vec::new();
        for raw in videos {
            match normalize::normalize_url(&raw) {
                Ok(url) => entries.push(CatalogEntry::new(
                    url,
                    SourceKind::Video,
                    self.cfg.channel_video_priority,
                    Some(channel.url.clone()),
                )),
                Err(e) => tracing::debug!("skipping channel video '{}': {}", raw, e),
            }
        }
        if entries.is_empty() {
            return Ok(0);
        }
        Ok(self.catalog.insert_if_absent(entries).await?.added)
    }

    async fn record_failure(
        &self,
        entry: &CatalogEntry,
        host: &str,
        err: FetchError,
    ) -> Result<Attempt> {
        let permanent = !err.is_transient();
        if !permanent {
            self.backoff.note_failure(host).await;
        }
        tracing::warn!("fetch of {} failed: {}", entry.url, err);

        self.catalog
            .mark_failed(
                entry.url_hash.clone(),
                err.to_string(),
                Utc::now(),
                permanent,
                self.cfg.max_retries,
            )
            .await?;

        // Mirror the catalog's transition to report the attempt correctly.
        let final_failure = permanent || entry.retry_count + 1 >= self.cfg.max_retries;
        Ok(if final_failure {
            Attempt::Failed
        } else {
            Attempt::Requeued
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunker, ChunkerConfig};
    use crate::core::types::{DocumentValidators, EntryStatus, FetchedDocument};
    use crate::index::VectorIndex;
    use crate::nlp::HashEmbedder;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    enum StubBehavior {
        Page(String),
        Channel(Vec<String>),
        TransientError,
        PermanentError,
    }

    struct StubFetchers {
        behavior: StubBehavior,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetchers for StubFetchers {
        async fn dispatch(&self, entry: &CatalogEntry) -> Result<FetchOutcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                StubBehavior::Page(text) => Ok(FetchOutcome::Document(FetchedDocument {
                    url: entry.url.clone(),
                    kind: entry.kind,
                    title: "stub".into(),
                    language: Some("eng".into()),
                    text: text.clone(),
                    validators: DocumentValidators {
                        http_etag: Some("\"abc\"".into()),
                        ..Default::default()
                    },
                    attributes: serde_json::Value::Null,
                })),
                StubBehavior::Channel(videos) => Ok(FetchOutcome::ChannelVideos(videos.clone())),
                StubBehavior::TransientError => {
                    Err(FetchError::Transient("http_500 stub".into()))
                }
                StubBehavior::PermanentError => {
                    Err(FetchError::Permanent("http_404 stub".into()))
                }
            }
        }
    }

    struct Fixture {
        catalog: Arc<UrlCatalog>,
        vectors: Arc<VectorIndex>,
        processor: QueueProcessor,
        _dir: tempfile::TempDir,
    }

    async fn fixture(behavior: StubBehavior, max_retries: u32) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let catalog = Arc::new(UrlCatalog::open_in_memory().unwrap());
        let vectors = Arc::new(
            VectorIndex::open(dir.path().to_str().unwrap(), 16).await.unwrap(),
        );
        let ingestor = Arc::new(Ingestor::new(
            Chunker::new(ChunkerConfig::default()),
            Arc::new(HashEmbedder { dim: 16 }),
            None,
            vectors.clone(),
            8,
            2,
        ));
        let processor = QueueProcessor::new(
            catalog.clone(),
            Arc::new(StubFetchers {
                behavior,
                calls: AtomicUsize::new(0),
            }),
            None,
            ingestor,
            Arc::new(HostRateLimiter::new(100.0)),
            Arc::new(HostBackoff::new()),
            Arc::new(AtomicBool::new(false)),
            ProcessorConfig {
                max_retries,
                ..Default::default()
            },
        );
        Fixture {
            catalog,
            vectors,
            processor,
            _dir: dir,
        }
    }

    fn pending(url: &str, kind: SourceKind) -> CatalogEntry {
        CatalogEntry::new(normalize::normalize_url(url).unwrap(), kind, 100, None)
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let f = fixture(StubBehavior::TransientError, 3).await;
        let report = f.processor.process_queue(None).await.unwrap();
        assert_eq!(report, ProcessReport::default());
    }

    #[tokio::test]
    async fn successful_fetch_lands_chunks_and_marks_fetched() {
        let f = fixture(StubBehavior::Page("Hello world. See the details below.".into()), 3).await;
        let entry = pending("https://example.org/docs/intro?utm_source=x#top", SourceKind::WebPage);
        let hash = entry.url_hash.clone();
        let url = entry.url.clone();
        assert_eq!(url, "https://example.org/docs/intro");
        f.catalog.insert_if_absent(vec![entry]).await.unwrap();

        let report = f.processor.process_queue(None).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 0);

        let after = f.catalog.get(hash).await.unwrap().unwrap();
        assert_eq!(after.status, EntryStatus::Fetched);
        assert!(after.last_fetched_at.is_some());
        assert!(after.next_refresh_at.unwrap() >= after.last_fetched_at.unwrap());

        let chunks = f.vectors.get_by_source_url(&url).await.unwrap();
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].http_etag.as_deref(), Some("\"abc\""));

        // Re-processing after success is a no-op: nothing pending.
        let second = f.processor.process_queue(None).await.unwrap();
        assert_eq!(second, ProcessReport::default());
        assert_eq!(f.vectors.get_by_source_url(&url).await.unwrap().len(), chunks.len());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_retries_then_stick_failed() {
        let f = fixture(StubBehavior::TransientError, 3).await;
        let entry = pending("https://example.org/flaky", SourceKind::WebPage);
        let hash = entry.url_hash.clone();
        f.catalog.insert_if_absent(vec![entry]).await.unwrap();

        let report = f.processor.process_queue(None).await.unwrap();
        // Two requeued attempts, then the terminal one.
        assert_eq!(report.skipped, 2);
        assert_eq!(report.failed, 1);

        let after = f.catalog.get(hash).await.unwrap().unwrap();
        assert_eq!(after.status, EntryStatus::Failed);
        assert_eq!(after.retry_count, 3);
        assert!(after.last_error.as_deref().unwrap().contains("http_500"));

        // A later run must not re-attempt the failed entry.
        let second = f.processor.process_queue(None).await.unwrap();
        assert_eq!(second, ProcessReport::default());
    }

    #[tokio::test]
    async fn permanent_failure_fails_immediately() {
        let f = fixture(StubBehavior::PermanentError, 3).await;
        let entry = pending("https://example.org/gone", SourceKind::WebPage);
        let hash = entry.url_hash.clone();
        f.catalog.insert_if_absent(vec![entry]).await.unwrap();

        let report = f.processor.process_queue(None).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);
        let after = f.catalog.get(hash).await.unwrap().unwrap();
        assert_eq!(after.status, EntryStatus::Failed);
        assert_eq!(after.retry_count, 1);
    }

    #[tokio::test]
    async fn channel_expansion_enqueues_videos_and_marks_channel_fetched() {
        let f = fixture(
            StubBehavior::Channel(vec![
                "https://www.youtube.com/watch?v=aaa".into(),
                "https://www.youtube.com/watch?v=bbb".into(),
            ]),
            3,
        )
        .await;
        let entry = pending("https://www.youtube.com/@somecreator", SourceKind::VideoChannel);
        let channel_url = entry.url.clone();
        let hash = entry.url_hash.clone();
        f.catalog.insert_if_absent(vec![entry]).await.unwrap();

        // One batch: expanding the channel must not fetch the new videos in
        // the same claim.
        let report = f.processor.process_queue(Some(1)).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let channel = f.catalog.get(hash).await.unwrap().unwrap();
        assert_eq!(channel.status, EntryStatus::Fetched);
        // Videos are immutable: the channel row never refreshes either.
        assert!(channel.next_refresh_at.is_none());

        let (by_status, by_kind) = f.catalog.counts().await.unwrap();
        assert_eq!(by_kind.get("video"), Some(&2));
        assert_eq!(by_status.get("pending"), Some(&2));

        let claimed = f.catalog.claim_batch(10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        for video in claimed {
            assert_eq!(video.discovered_from.as_deref(), Some(channel_url.as_str()));
            assert_eq!(video.priority, 50);
        }
    }

    #[tokio::test]
    async fn crawl_discovered_pages_are_never_crawled_again() {
        let f = fixture(StubBehavior::Page("content".into()), 3).await;
        let fresh = pending("https://docs.example.com", SourceKind::DocSitePage);
        assert!(f.processor.crawl_eligible(&fresh));

        let from_crawl = CatalogEntry::new(
            normalize::normalize_url("https://docs.example.com/guide").unwrap(),
            SourceKind::DocSitePage,
            50,
            Some("crawl:https://docs.example.com".to_string()),
        );
        assert!(!f.processor.crawl_eligible(&from_crawl));

        // Plain pages are not crawl entry points either.
        let page = pending("https://example.org/pricing", SourceKind::WebPage);
        assert!(!f.processor.crawl_eligible(&page));
    }

    #[tokio::test]
    async fn stop_flag_requeues_instead_of_fetching() {
        let f = fixture(StubBehavior::Page("content".into()), 3).await;
        let entry = pending("https://example.org/later", SourceKind::WebPage);
        f.catalog.insert_if_absent(vec![entry]).await.unwrap();

        f.processor.stop.store(true, Ordering::SeqCst);
        let report = f.processor.process_queue(None).await.unwrap();
        assert_eq!(report.succeeded, 0);
    }
}
