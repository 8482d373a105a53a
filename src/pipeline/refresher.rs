//! Scheduled freshness pipeline: cheap validator checks first, full re-fetch
//! and atomic replacement only on confirmed change.
//!
//! Pages check HTTP validators via HEAD, repositories compare the remote tip
//! commit. Only when the cheap check signals change (or no validators exist)
//! does a full fetch run, and even then an identical content hash
//! short-circuits the rewrite — that catches servers whose HEAD validators
//! lie.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use crate::catalog::{normalize, UrlCatalog};
use crate::chunk::content_hash;
use crate::core::error::{is_corruption, FetchError};
use crate::core::types::{CatalogEntry, ChunkRecord, RefreshReport, SourceKind};
use crate::fetch::{HtmlFetcher, RepoFetcher};
use crate::index::VectorIndex;
use crate::pipeline::ingest::Ingestor;
use crate::pipeline::rate_limit::{HostBackoff, HostRateLimiter};

pub struct RefresherConfig {
    pub batch_limit: usize,
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        RefresherConfig {
            batch_limit: 100,
            max_retries: 3,
            interval: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

enum CheckResult {
    Unchanged,
    NeedsFetch,
}

pub struct Refresher {
    catalog: Arc<UrlCatalog>,
    vectors: Arc<VectorIndex>,
    html: Arc<HtmlFetcher>,
    repo: Arc<RepoFetcher>,
    ingestor: Arc<Ingestor>,
    rate: Arc<HostRateLimiter>,
    backoff: Arc<HostBackoff>,
    stop: Arc<AtomicBool>,
    cfg: RefresherConfig,
}

impl Refresher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<UrlCatalog>,
        vectors: Arc<VectorIndex>,
        html: Arc<HtmlFetcher>,
        repo: Arc<RepoFetcher>,
        ingestor: Arc<Ingestor>,
        rate: Arc<HostRateLimiter>,
        backoff: Arc<HostBackoff>,
        stop: Arc<AtomicBool>,
        cfg: RefresherConfig,
    ) -> Refresher {
        Refresher {
            catalog,
            vectors,
            html,
            repo,
            ingestor,
            rate,
            backoff,
            stop,
            cfg,
        }
    }

    /// Periodic driver; gated by the auto-refresh config at the call site.
    pub async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick consumed
        loop {
            ticker.tick().await;
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match self.refresh_once().await {
                Ok(report) => tracing::info!(
                    "refresh pass: {} checked, {} unchanged, {} updated, {} failed",
                    report.checked,
                    report.unchanged,
                    report.updated,
                    report.failed
                ),
                Err(e) => {
                    tracing::error!("refresh pass aborted: {:#}", e);
                    if is_corruption(&e) {
                        // Fatal by policy; surface by stopping the process.
                        std::process::exit(70);
                    }
                }
            }
        }
    }

    /// One bounded refresh slice. Videos never appear: their refresh policy
    /// is `never` so the catalog query excludes them.
    pub async fn refresh_once(&self) -> Result<RefreshReport> {
        let due = self
            .catalog
            .due_for_refresh(Utc::now(), self.cfg.batch_limit)
            .await?;
        let mut report = RefreshReport::default();

        for entry in due {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            report.checked += 1;
            match self.refresh_entry(&entry).await {
                Ok(true) => report.updated += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    if is_corruption(&e) {
                        return Err(e);
                    }
                    report.failed += 1;
                    let fetch_err = match e.downcast::<FetchError>() {
                        Ok(fe) => fe,
                        Err(other) => FetchError::Transient(format!("{other:#}")),
                    };
                    let permanent = !fetch_err.is_transient();
                    tracing::warn!("refresh of {} failed: {}", entry.url, fetch_err);
                    self.catalog
                        .mark_failed(
                            entry.url_hash.clone(),
                            fetch_err.to_string(),
                            Utc::now(),
                            permanent,
                            self.cfg.max_retries,
                        )
                        .await?;
                }
            }
        }
        Ok(report)
    }

    /// Returns `Ok(true)` when the document changed and was replaced.
    async fn refresh_entry(&self, entry: &CatalogEntry) -> Result<bool> {
        let stored = self.vectors.get_by_source_url(&entry.url).await?;

        let host = normalize::domain_of(&entry.url);
        self.backoff.wait_if_backed_off(&host).await;
        self.rate.acquire(&host).await;

        if let CheckResult::Unchanged = self.cheap_check(entry, stored.first()).await? {
            self.reschedule(entry).await?;
            return Ok(false);
        }

        // Cheap check says changed (or could not run): full fetch.
        let doc = match entry.kind {
            SourceKind::Repo => self.repo.fetch(&entry.url).await,
            _ => self.html.fetch(&entry.url).await,
        }
        .map_err(anyhow::Error::from)?;

        let new_hash = content_hash(&doc.text);
        if let Some(first) = stored.first() {
            if first.content_hash == new_hash {
                tracing::debug!("{} validators moved but content identical", entry.url);
                self.reschedule(entry).await?;
                return Ok(false);
            }
        }

        self.ingestor.ingest(&entry.url, entry.kind, &doc).await?;
        self.reschedule(entry).await?;
        tracing::info!("refreshed {} (content changed)", entry.url);
        Ok(true)
    }

    async fn cheap_check(
        &self,
        entry: &CatalogEntry,
        stored: Option<&ChunkRecord>,
    ) -> Result<CheckResult> {
        let Some(stored) = stored else {
            // Nothing indexed for this URL: treat as changed and re-ingest.
            return Ok(CheckResult::NeedsFetch);
        };

        match entry.kind {
            SourceKind::Repo => {
                let Some(stored_tip) = stored.commit_id.as_deref() else {
                    return Ok(CheckResult::NeedsFetch);
                };
                let remote = self
                    .repo
                    .remote_tip(&entry.url)
                    .await
                    .map_err(anyhow::Error::from)?;
                if remote == stored_tip {
                    Ok(CheckResult::Unchanged)
                } else {
                    Ok(CheckResult::NeedsFetch)
                }
            }
            SourceKind::WebPage | SourceKind::DocSitePage => {
                if stored.http_etag.is_none() && stored.http_last_modified.is_none() {
                    return Ok(CheckResult::NeedsFetch);
                }
                let live = self
                    .html
                    .head_validators(&entry.url)
                    .await
                    .map_err(anyhow::Error::from)?;
                if validators_match(stored, &live) {
                    Ok(CheckResult::Unchanged)
                } else {
                    Ok(CheckResult::NeedsFetch)
                }
            }
            // Policy never schedules these; belt-and-braces skip.
            SourceKind::Video | SourceKind::VideoChannel => Ok(CheckResult::Unchanged),
        }
    }

    async fn reschedule(&self, entry: &CatalogEntry) -> Result<()> {
        let now = Utc::now();
        self.catalog
            .mark_fetched(entry.url_hash.clone(), now, entry.refresh_policy.next_from(now))
            .await
    }
}

/// HTTP validator comparison: either validator matching its stored value
/// means unchanged. A validator absent on either side never matches.
pub(crate) fn validators_match(
    stored: &ChunkRecord,
    live: &crate::core::types::DocumentValidators,
) -> bool {
    let etag_match = match (&stored.http_etag, &live.http_etag) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    let modified_match = match (&stored.http_last_modified, &live.http_last_modified) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    };
    etag_match || modified_match
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::normalize;
    use crate::core::types::{DocumentValidators, EnrichedMetadata};

    fn stored(etag: Option<&str>, last_modified: Option<&str>) -> ChunkRecord {
        ChunkRecord {
            id: "c0".into(),
            document_id: normalize::url_hash("https://docs.example.com/a"),
            chunk_index: 0,
            total_chunks: 1,
            text: "body".into(),
            source_url: "https://docs.example.com/a".into(),
            kind: SourceKind::DocSitePage,
            domain: "docs.example.com".into(),
            content_hash: "h".into(),
            http_last_modified: last_modified.map(|s| s.to_string()),
            http_etag: etag.map(|s| s.to_string()),
            commit_id: None,
            start_time_secs: None,
            metadata: EnrichedMetadata::default(),
            fetched_at: Utc::now(),
            embedding: Vec::new(),
        }
    }

    fn live(etag: Option<&str>, last_modified: Option<&str>) -> DocumentValidators {
        DocumentValidators {
            http_etag: etag.map(|s| s.to_string()),
            http_last_modified: last_modified.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn matching_etag_means_unchanged() {
        assert!(validators_match(
            &stored(Some("\"abc\""), None),
            &live(Some("\"abc\""), None)
        ));
    }

    #[test]
    fn either_validator_suffices() {
        // ETag rotated but Last-Modified stable: still unchanged.
        assert!(validators_match(
            &stored(Some("\"a\""), Some("Mon, 01 Jan 2024 00:00:00 GMT")),
            &live(Some("\"b\""), Some("Mon, 01 Jan 2024 00:00:00 GMT"))
        ));
    }

    #[test]
    fn changed_or_absent_validators_mean_fetch() {
        assert!(!validators_match(
            &stored(Some("\"a\""), None),
            &live(Some("\"b\""), None)
        ));
        assert!(!validators_match(&stored(Some("\"a\""), None), &live(None, None)));
        assert!(!validators_match(&stored(None, None), &live(Some("\"a\""), None)));
    }
}
