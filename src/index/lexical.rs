//! In-memory BM25 keyword index over the chunk corpus.
//!
//! Complements dense retrieval in hybrid search. The corpus is a snapshot of
//! the vector store, rebuilt lazily on first query and invalidated whenever
//! the store's write epoch has moved past the snapshot's epoch by the dirty
//! threshold. Bounded lag against the vector store is acceptable.

use std::sync::Arc;

use anyhow::Result;
use bm25::{Document, Language, SearchEngine, SearchEngineBuilder};
use tokio::sync::RwLock;

use crate::core::types::ChunkRecord;
use crate::index::vector::VectorIndex;

/// Writes tolerated before a built snapshot is considered stale.
const DIRTY_THRESHOLD: u64 = 1;

struct Snapshot {
    /// `None` for an empty corpus; the engine cannot be fit to zero docs.
    engine: Option<SearchEngine<u32>>,
    chunks: Vec<ChunkRecord>,
    built_at_epoch: u64,
}

pub struct LexicalIndex {
    snapshot: RwLock<Option<Snapshot>>,
}

impl LexicalIndex {
    pub fn new() -> LexicalIndex {
        LexicalIndex {
            snapshot: RwLock::new(None),
        }
    }

    /// Rebuild from scratch over the given corpus. Tokenization (lowercase,
    /// Unicode word segmentation) lives inside the engine and is therefore
    /// applied symmetrically to documents and queries.
    fn build_snapshot(chunks: Vec<ChunkRecord>, epoch: u64) -> Snapshot {
        let engine = if chunks.is_empty() {
            None
        } else {
            let documents = chunks
                .iter()
                .enumerate()
                .map(|(i, c)| Document::new(i as u32, c.text.clone()));
            Some(SearchEngineBuilder::with_documents(Language::English, documents).build())
        };
        Snapshot {
            engine,
            chunks,
            built_at_epoch: epoch,
        }
    }

    /// BM25 top-k. Rebuilds from the vector store when no snapshot exists or
    /// the store has drifted past the dirty threshold.
    pub async fn search(
        &self,
        vector_index: &Arc<VectorIndex>,
        query: &str,
        k: usize,
    ) -> Result<Vec<(ChunkRecord, f32)>> {
        self.ensure_fresh(vector_index).await?;

        let guard = self.snapshot.read().await;
        let Some(snapshot) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(engine) = snapshot.engine.as_ref() else {
            return Ok(Vec::new());
        };
        let results = engine.search(query, k);
        Ok(results
            .into_iter()
            .filter_map(|r| {
                snapshot
                    .chunks
                    .get(r.document.id as usize)
                    .map(|c| (c.clone(), r.score))
            })
            .collect())
    }

    async fn ensure_fresh(&self, vector_index: &Arc<VectorIndex>) -> Result<()> {
        let current_epoch = vector_index.write_epoch();
        {
            let guard = self.snapshot.read().await;
            if let Some(s) = guard.as_ref() {
                if current_epoch.saturating_sub(s.built_at_epoch) < DIRTY_THRESHOLD {
                    return Ok(());
                }
            }
        }

        let chunks = vector_index.scan_all().await?;
        let mut guard = self.snapshot.write().await;
        // A racing rebuild may have landed while we scanned; newest wins.
        let stale = guard
            .as_ref()
            .map(|s| current_epoch.saturating_sub(s.built_at_epoch) >= DIRTY_THRESHOLD)
            .unwrap_or(true);
        if stale {
            tracing::debug!(
                "rebuilding lexical index: {} chunks at epoch {}",
                chunks.len(),
                current_epoch
            );
            *guard = Some(Self::build_snapshot(chunks, current_epoch));
        }
        Ok(())
    }

    /// Direct rebuild from an explicit corpus; test seam and startup warmup.
    pub async fn build(&self, chunks: Vec<ChunkRecord>, epoch: u64) {
        let mut guard = self.snapshot.write().await;
        *guard = Some(Self::build_snapshot(chunks, epoch));
    }
}

impl Default for LexicalIndex {
    fn default() -> Self {
        LexicalIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::normalize;
    use crate::core::types::{EnrichedMetadata, SourceKind};
    use chrono::Utc;

    fn chunk(url: &str, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: normalize::url_hash(url),
            chunk_index: 0,
            total_chunks: 1,
            text: text.to_string(),
            source_url: url.to_string(),
            kind: SourceKind::WebPage,
            domain: normalize::domain_of(url),
            content_hash: "h".to_string(),
            http_last_modified: None,
            http_etag: None,
            commit_id: None,
            start_time_secs: None,
            metadata: EnrichedMetadata::default(),
            fetched_at: Utc::now(),
            embedding: Vec::new(),
        }
    }

    #[tokio::test]
    async fn keyword_match_outranks_unrelated_text() {
        let index = LexicalIndex::new();
        index
            .build(
                vec![
                    chunk("https://a.example/1", "OAuth token authorization flow explained"),
                    chunk("https://a.example/2", "gardening tips for spring vegetables"),
                    chunk("https://a.example/3", "access token refresh and expiry"),
                ],
                0,
            )
            .await;

        let guard = index.snapshot.read().await;
        let snapshot = guard.as_ref().unwrap();
        let results = snapshot.engine.as_ref().unwrap().search("token authorization", 3);
        assert!(!results.is_empty());
        let top = &snapshot.chunks[results[0].document.id as usize];
        assert!(top.text.contains("token"));
    }

    #[tokio::test]
    async fn empty_corpus_returns_nothing() {
        let index = LexicalIndex::new();
        index.build(Vec::new(), 0).await;
        let guard = index.snapshot.read().await;
        assert!(guard.as_ref().unwrap().engine.is_none());
    }
}
