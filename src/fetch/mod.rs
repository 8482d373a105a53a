//! Per-source-kind content extractors.
//!
//! A closed variant set: HTML pages, code repositories, videos, and video
//! channels. The queue processor partitions each claimed batch by kind and
//! dispatches here; errors carry the transient/permanent classification the
//! scheduler's retry accounting runs on.

pub mod html;
pub mod render;
pub mod repo;
pub mod video;

use std::sync::Arc;

use async_trait::async_trait;

pub use html::HtmlFetcher;
pub use repo::RepoFetcher;
pub use video::VideoFetcher;

use crate::core::error::FetchError;
use crate::core::types::{CatalogEntry, FetchedDocument, SourceKind};

#[derive(Debug)]
pub enum FetchOutcome {
    /// A chunkable document.
    Document(FetchedDocument),
    /// Channel expansion only: video URLs to enqueue. The channel entry is
    /// marked fetched after successful enumeration; it has no content itself.
    ChannelVideos(Vec<String>),
}

/// Dispatch seam the processor runs against; the production set is
/// [`FetcherSet`], tests substitute stubs.
#[async_trait]
pub trait Fetchers: Send + Sync {
    async fn dispatch(&self, entry: &CatalogEntry) -> Result<FetchOutcome, FetchError>;
}

pub struct FetcherSet {
    pub html: Arc<HtmlFetcher>,
    pub repo: Arc<RepoFetcher>,
    pub video: Arc<VideoFetcher>,
    pub channel_max_videos: usize,
}

#[async_trait]
impl Fetchers for FetcherSet {
    async fn dispatch(&self, entry: &CatalogEntry) -> Result<FetchOutcome, FetchError> {
        match entry.kind {
            SourceKind::WebPage | SourceKind::DocSitePage => {
                let mut doc = self.html.fetch(&entry.url).await?;
                doc.kind = entry.kind;
                Ok(FetchOutcome::Document(doc))
            }
            SourceKind::Repo => self.repo.fetch(&entry.url).await.map(FetchOutcome::Document),
            SourceKind::Video => self.video.fetch(&entry.url).await.map(FetchOutcome::Document),
            SourceKind::VideoChannel => self
                .video
                .expand_channel(&entry.url, self.channel_max_videos)
                .await
                .map(FetchOutcome::ChannelVideos),
        }
    }
}
