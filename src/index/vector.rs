//! Persistent chunk store on LanceDB with cosine top-k search.
//!
//! Writers (queue processor, refresher) replace a document's chunks through
//! [`VectorIndex::replace_document`], which serializes on a per-document lock
//! so searchers never observe a union of old and new chunks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow_array::{
    types::Float32Type, Array, FixedSizeListArray, Float32Array, Float64Array, Int64Array,
    RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use lancedb::{
    query::{ExecutableQuery, QueryBase},
    DistanceType, Table,
};
use tokio::sync::Mutex;

use crate::catalog::normalize;
use crate::core::error::CorruptionError;
use crate::core::types::{ChunkRecord, EnrichedMetadata, SourceKind};

const TABLE_NAME: &str = "chunks";

/// Metadata equality filter for [`VectorIndex::search`].
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub kind: Option<SourceKind>,
    pub domain: Option<String>,
}

impl ChunkFilter {
    fn to_predicate(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(kind) = self.kind {
            clauses.push(format!("kind = '{}'", kind.as_str()));
        }
        if let Some(domain) = &self.domain {
            clauses.push(format!("domain = '{}'", escape(domain)));
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

pub struct VectorIndex {
    table: Table,
    embedding_dim: usize,
    /// Bumped on every add/delete; the lexical index compares epochs to know
    /// when its snapshot has gone stale.
    write_epoch: AtomicU64,
    document_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VectorIndex {
    /// Connect to (or create) the store. The embedding dimension is pinned at
    /// table creation; reopening with a different dimension is refused since
    /// mixed-dimension collections cannot be searched.
    pub async fn open(uri: &str, embedding_dim: usize) -> Result<VectorIndex> {
        let db = lancedb::connect(uri)
            .execute()
            .await
            .context("connecting to LanceDB")?;

        let schema = Arc::new(Self::chunk_schema(embedding_dim)?);
        let table = match db.open_table(TABLE_NAME).execute().await {
            Ok(table) => {
                let existing = table.schema().await.context("reading chunk table schema")?;
                let stored_dim = existing
                    .field_with_name("vector")
                    .ok()
                    .and_then(|f| match f.data_type() {
                        DataType::FixedSizeList(_, n) => Some(*n as usize),
                        _ => None,
                    });
                if stored_dim != Some(embedding_dim) {
                    return Err(anyhow!(
                        "chunk table has embedding_dim {:?}, config wants {} — a full rebuild is required",
                        stored_dim,
                        embedding_dim
                    ));
                }
                table
            }
            Err(lancedb::Error::TableNotFound { .. }) => {
                tracing::info!(
                    "creating LanceDB table '{}' (embedding_dim: {})",
                    TABLE_NAME,
                    embedding_dim
                );
                db.create_empty_table(TABLE_NAME, schema.clone())
                    .execute()
                    .await
                    .context("creating chunk table")?
            }
            Err(e) => return Err(e).context("opening chunk table"),
        };

        // Vector index creation is best-effort; flat scan still works.
        if let Err(e) = table
            .create_index(&["vector"], lancedb::index::Index::Auto)
            .execute()
            .await
        {
            tracing::debug!("LanceDB create_index skipped/failed: {}", e);
        }

        Ok(VectorIndex {
            table,
            embedding_dim,
            write_epoch: AtomicU64::new(0),
            document_locks: Mutex::new(HashMap::new()),
        })
    }

    fn chunk_schema(embedding_dim: usize) -> Result<Schema> {
        let vector_len: i32 = embedding_dim
            .try_into()
            .context("embedding dimension too large")?;
        Ok(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("chunk_index", DataType::Int64, false),
            Field::new("total_chunks", DataType::Int64, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("source_url", DataType::Utf8, false),
            Field::new("kind", DataType::Utf8, false),
            Field::new("domain", DataType::Utf8, false),
            Field::new("content_hash", DataType::Utf8, false),
            Field::new("http_last_modified", DataType::Utf8, true),
            Field::new("http_etag", DataType::Utf8, true),
            Field::new("commit_id", DataType::Utf8, true),
            Field::new("start_time_secs", DataType::Float64, true),
            Field::new("metadata", DataType::Utf8, false),
            Field::new("fetched_at_ms", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    vector_len,
                ),
                true,
            ),
        ]))
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn write_epoch(&self) -> u64 {
        self.write_epoch.load(Ordering::SeqCst)
    }

    async fn document_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.document_locks.lock().await;
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Batch insert. Embeddings are pre-computed by the caller and must match
    /// the pinned dimension.
    pub async fn add(&self, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        for c in chunks {
            if c.embedding.len() != self.embedding_dim {
                return Err(anyhow!(
                    "embedding dimension mismatch for chunk {}: expected {}, got {}",
                    c.id,
                    self.embedding_dim,
                    c.embedding.len()
                ));
            }
        }
        let batch = self.chunks_to_record_batch(chunks)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema);
        self.table
            .add(batches)
            .execute()
            .await
            .context("adding chunks to LanceDB")?;
        self.write_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Remove every chunk belonging to `source_url`. The predicate runs on
    /// `document_id` (hex), so no URL escaping subtleties reach the engine.
    pub async fn delete_by_source_url(&self, source_url: &str) -> Result<()> {
        let document_id = normalize::url_hash(source_url);
        let lock = self.document_lock(&document_id).await;
        let _guard = lock.lock().await;
        self.delete_by_document_id(&document_id).await
    }

    async fn delete_by_document_id(&self, document_id: &str) -> Result<()> {
        self.table
            .delete(&format!("document_id = '{}'", escape(document_id)))
            .await
            .context("deleting chunks from LanceDB")?;
        self.write_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Atomic delete-then-add for one document. All chunks must carry the
    /// same `document_id`; the per-document lock keeps the replacement
    /// invisible to concurrent replacers of the same source.
    pub async fn replace_document(&self, source_url: &str, chunks: &[ChunkRecord]) -> Result<()> {
        let document_id = normalize::url_hash(source_url);
        if let Some(stray) = chunks.iter().find(|c| c.document_id != document_id) {
            return Err(anyhow!(
                "replace_document: chunk {} belongs to document {}, not {}",
                stray.id,
                stray.document_id,
                document_id
            ));
        }
        let lock = self.document_lock(&document_id).await;
        let _guard = lock.lock().await;
        self.delete_by_document_id(&document_id).await?;
        self.add(chunks).await
    }

    /// Cosine top-k. Returns `(chunk, distance)` pairs, distance being
    /// `1 − cosine_similarity` per the index metric.
    pub async fn search(
        &self,
        query_vector: &[f32],
        k: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<(ChunkRecord, f32)>> {
        if query_vector.len() != self.embedding_dim {
            return Err(anyhow!(
                "query dimension mismatch: expected {}, got {}",
                self.embedding_dim,
                query_vector.len()
            ));
        }
        let mut query = self
            .table
            .query()
            .nearest_to(query_vector)
            .context("building vector query")?
            .distance_type(DistanceType::Cosine)
            .limit(k);
        if let Some(predicate) = filter.to_predicate() {
            query = query.only_if(predicate);
        }

        let stream = query.execute().await.context("searching LanceDB")?;
        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .context("reading search results")?;

        let mut out = Vec::new();
        for batch in &batches {
            out.extend(batches_to_chunks(batch, true)?);
        }
        Ok(out)
    }

    /// All stored chunks for one source, validator fields included. Used by
    /// the refresher to read stored validators and by corruption checks.
    pub async fn get_by_source_url(&self, source_url: &str) -> Result<Vec<ChunkRecord>> {
        let document_id = normalize::url_hash(source_url);
        let stream = self
            .table
            .query()
            .only_if(format!("document_id = '{}'", escape(&document_id)))
            .execute()
            .await
            .context("scanning chunks by document")?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.context("reading chunks")?;

        let mut chunks = Vec::new();
        for batch in &batches {
            chunks.extend(batches_to_chunks(batch, false)?.into_iter().map(|(c, _)| c));
        }

        // Chunks of one document must all come from the same fetch.
        if let Some(first) = chunks.first() {
            if chunks.iter().any(|c| c.content_hash != first.content_hash) {
                return Err(CorruptionError(format!(
                    "document {document_id} holds chunks from different content hashes"
                ))
                .into());
            }
        }
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    /// Full scan without vectors, feeding the lexical-index rebuild.
    pub async fn scan_all(&self) -> Result<Vec<ChunkRecord>> {
        let stream = self
            .table
            .query()
            .execute()
            .await
            .context("scanning chunk table")?;
        let batches: Vec<RecordBatch> = stream.try_collect().await.context("reading chunks")?;
        let mut chunks = Vec::new();
        for batch in &batches {
            chunks.extend(batches_to_chunks(batch, false)?.into_iter().map(|(c, _)| c));
        }
        Ok(chunks)
    }

    pub async fn count(&self) -> Result<u64> {
        let n = self
            .table
            .count_rows(None)
            .await
            .context("counting chunks")?;
        Ok(n as u64)
    }

    pub async fn count_by_kind(&self, kind: SourceKind) -> Result<u64> {
        let n = self
            .table
            .count_rows(Some(format!("kind = '{}'", kind.as_str())))
            .await
            .context("counting chunks by kind")?;
        Ok(n as u64)
    }

    fn chunks_to_record_batch(&self, chunks: &[ChunkRecord]) -> Result<RecordBatch> {
        let schema = Arc::new(Self::chunk_schema(self.embedding_dim)?);
        let vector_len: i32 = self
            .embedding_dim
            .try_into()
            .context("embedding dimension too large")?;

        let metadata_json: Vec<String> = chunks
            .iter()
            .map(|c| serde_json::to_string(&c.metadata).unwrap_or_else(|_| "{}".to_string()))
            .collect();

        let vectors = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            chunks
                .iter()
                .map(|c| Some(c.embedding.iter().map(|v| Some(*v)).collect::<Vec<_>>())),
            vector_len,
        );

        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| &c.id))),
                Arc::new(StringArray::from_iter_values(
                    chunks.iter().map(|c| &c.document_id),
                )),
                Arc::new(Int64Array::from_iter_values(
                    chunks.iter().map(|c| c.chunk_index as i64),
                )),
                Arc::new(Int64Array::from_iter_values(
                    chunks.iter().map(|c| c.total_chunks as i64),
                )),
                Arc::new(StringArray::from_iter_values(chunks.iter().map(|c| &c.text))),
                Arc::new(StringArray::from_iter_values(
                    chunks.iter().map(|c| &c.source_url),
                )),
                Arc::new(StringArray::from_iter_values(
                    chunks.iter().map(|c| c.kind.as_str()),
                )),
                Arc::new(StringArray::from_iter_values(
                    chunks.iter().map(|c| &c.domain),
                )),
                Arc::new(StringArray::from_iter_values(
                    chunks.iter().map(|c| &c.content_hash),
                )),
                Arc::new(StringArray::from(
                    chunks
                        .iter()
                        .map(|c| c.http_last_modified.clone())
                        .collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    chunks.iter().map(|c| c.http_etag.clone()).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    chunks.iter().map(|c| c.commit_id.clone()).collect::<Vec<_>>(),
                )),
                Arc::new(Float64Array::from(
                    chunks.iter().map(|c| c.start_time_secs).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(metadata_json)),
                Arc::new(Int64Array::from_iter_values(
                    chunks.iter().map(|c| c.fetched_at.timestamp_millis()),
                )),
                Arc::new(vectors),
            ],
        )
        .context("building Arrow RecordBatch")?;
        Ok(batch)
    }
}

fn str_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .with_context(|| format!("missing column: {name}"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("invalid type for column: {name}"))
}

fn i64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .with_context(|| format!("missing column: {name}"))?
        .as_any()
        .downcast_ref::<Int64Array>()
        .with_context(|| format!("invalid type for column: {name}"))
}

fn opt_str(col: &StringArray, row: usize) -> Option<String> {
    if col.is_null(row) {
        None
    } else {
        Some(col.value(row).to_string())
    }
}

fn batches_to_chunks(batch: &RecordBatch, with_distance: bool) -> Result<Vec<(ChunkRecord, f32)>> {
    let id = str_col(batch, "id")?;
    let document_id = str_col(batch, "document_id")?;
    let chunk_index = i64_col(batch, "chunk_index")?;
    let total_chunks = i64_col(batch, "total_chunks")?;
    let text = str_col(batch, "text")?;
    let source_url = str_col(batch, "source_url")?;
    let kind = str_col(batch, "kind")?;
    let domain = str_col(batch, "domain")?;
    let content_hash = str_col(batch, "content_hash")?;
    let last_modified = str_col(batch, "http_last_modified")?;
    let etag = str_col(batch, "http_etag")?;
    let commit_id = str_col(batch, "commit_id")?;
    let start_time = batch
        .column_by_name("start_time_secs")
        .context("missing column: start_time_secs")?
        .as_any()
        .downcast_ref::<Float64Array>()
        .context("invalid type for column: start_time_secs")?;
    let metadata = str_col(batch, "metadata")?;
    let fetched_at = i64_col(batch, "fetched_at_ms")?;
    let distance: Option<&Float32Array> = if with_distance {
        batch
            .column_by_name("_distance")
            .and_then(|arr| arr.as_any().downcast_ref::<Float32Array>())
    } else {
        None
    };

    let mut out = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let kind_raw = kind.value(row);
        let kind = SourceKind::parse(kind_raw)
            .ok_or_else(|| CorruptionError(format!("unknown chunk kind '{kind_raw}'")))?;
        let meta: EnrichedMetadata =
            serde_json::from_str(metadata.value(row)).unwrap_or_default();
        let fetched = DateTime::<Utc>::from_timestamp_millis(fetched_at.value(row))
            .unwrap_or_else(Utc::now);

        let chunk = ChunkRecord {
            id: id.value(row).to_string(),
            document_id: document_id.value(row).to_string(),
            chunk_index: chunk_index.value(row) as usize,
            total_chunks: total_chunks.value(row) as usize,
            text: text.value(row).to_string(),
            source_url: source_url.value(row).to_string(),
            kind,
            domain: domain.value(row).to_string(),
            content_hash: content_hash.value(row).to_string(),
            http_last_modified: opt_str(last_modified, row),
            http_etag: opt_str(etag, row),
            commit_id: opt_str(commit_id, row),
            start_time_secs: if start_time.is_null(row) {
                None
            } else {
                Some(start_time.value(row))
            },
            metadata: meta,
            fetched_at: fetched,
            embedding: Vec::new(),
        };
        let dist = distance.map(|d| d.value(row)).unwrap_or(0.0);
        out.push((chunk, if dist.is_nan() { 0.0 } else { dist }));
    }
    Ok(out)
}
