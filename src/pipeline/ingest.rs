//! Shared chunk→enrich→embed→store stage.
//!
//! Both the queue processor and the refresher funnel fetched documents
//! through here. Within a document, previously-stored chunks are always
//! deleted before the new set is added (a no-op on first ingest, the
//! replacement mechanism on refresh), and the write is atomic per document.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::catalog::normalize;
use crate::chunk::{content_hash, Chunker, TextChunk};
use crate::core::error::FetchError;
use crate::core::types::{ChunkRecord, EnrichedMetadata, FetchedDocument, SourceKind};
use crate::index::VectorIndex;
use crate::nlp::{Embedder, Enricher};

pub struct Ingestor {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    /// Absent when no LLM endpoint is configured; chunks get empty metadata.
    enricher: Option<Arc<Enricher>>,
    vectors: Arc<VectorIndex>,
    embed_batch_size: usize,
    enrich_concurrency: usize,
}

impl Ingestor {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        enricher: Option<Arc<Enricher>>,
        vectors: Arc<VectorIndex>,
        embed_batch_size: usize,
        enrich_concurrency: usize,
    ) -> Ingestor {
        Ingestor {
            chunker,
            embedder,
            enricher,
            vectors,
            embed_batch_size: embed_batch_size.max(1),
            enrich_concurrency: enrich_concurrency.max(1),
        }
    }

    /// Chunk, enrich, embed, and atomically replace the document's chunks.
    /// Returns the stored chunk count. Embedding failures are transient
    /// (wrapped [`FetchError`] in the chain); an unchunkable document is
    /// permanent.
    pub async fn ingest(
        &self,
        source_url: &str,
        kind: SourceKind,
        doc: &FetchedDocument,
    ) -> Result<usize> {
        let text_chunks = self.chunker.chunk(doc);
        if text_chunks.is_empty() {
            return Err(FetchError::Permanent(format!("document at {source_url} produced no chunks"))
                .into());
        }
        let total = text_chunks.len();

        let texts: Vec<String> = text_chunks.iter().map(|c| c.text.clone()).collect();

        // Enrichment runs per chunk at bounded concurrency; embedding runs in
        // batches on the blocking pool, off the async fetch threads.
        let metadata = self.enrich_all(&texts).await;
        let embeddings = self.embed_all(&texts).await?;

        let document_id = normalize::url_hash(source_url);
        let domain = normalize::domain_of(source_url);
        let hash = content_hash(&doc.text);
        let now = Utc::now();

        let records: Vec<ChunkRecord> = text_chunks
            .iter()
            .zip(embeddings)
            .zip(metadata)
            .enumerate()
            .map(|(i, ((tc, embedding), meta))| {
                chunk_record(
                    source_url, kind, doc, tc, i, total, &document_id, &domain, &hash, meta,
                    embedding, now,
                )
            })
            .collect();

        self.vectors
            .replace_document(source_url, &records)
            .await
            .with_context(|| format!("storing chunks for {source_url}"))?;
        Ok(total)
    }

    async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.embed_batch_size) {
            let vectors = self.embedder.embed_batch(batch).await.map_err(|e| {
                anyhow::Error::from(FetchError::Transient(format!("embedding batch failed: {e}")))
            })?;
            out.extend(vectors);
        }
        Ok(out)
    }

    async fn enrich_all(&self, texts: &[String]) -> Vec<EnrichedMetadata> {
        let Some(enricher) = &self.enricher else {
            return vec![EnrichedMetadata::default(); texts.len()];
        };
        stream::iter(texts.to_vec())
            .map(|text| {
                let enricher = enricher.clone();
                async move { enricher.enrich(&text).await }
            })
            .buffered(self.enrich_concurrency)
            .collect()
            .await
    }
}

#[allow(clippy::too_many_arguments)]
fn chunk_record(
    source_url: &str,
    kind: SourceKind,
    doc: &FetchedDocument,
    tc: &TextChunk,
    index: usize,
    total: usize,
    document_id: &str,
    domain: &str,
    hash: &str,
    metadata: EnrichedMetadata,
    embedding: Vec<f32>,
    now: chrono::DateTime<Utc>,
) -> ChunkRecord {
    ChunkRecord {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        total_chunks: total,
        text: tc.text.clone(),
        source_url: source_url.to_string(),
        kind,
        domain: domain.to_string(),
        content_hash: hash.to_string(),
        http_last_modified: doc.validators.http_last_modified.clone(),
        http_etag: doc.validators.http_etag.clone(),
        commit_id: doc.validators.commit_id.clone(),
        start_time_secs: tc.start_time_secs,
        metadata,
        fetched_at: now,
        embedding,
    }
}
