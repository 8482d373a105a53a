//! Hybrid retrieval: dense + lexical candidates, reciprocal-rank fusion,
//! optional cross-encoder rerank and LLM query expansion.
//!
//! Every stage degrades instead of failing the query: no lexical corpus →
//! semantic-only, LLM down → no expansion, reranker absent → pre-rerank
//! order. Degradations are reported as warning markers next to the results,
//! never as errors masking partial output.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;

use crate::core::types::{ChunkRecord, ScoreKind, SearchHit, SearchOptions};
use crate::index::{ChunkFilter, LexicalIndex, VectorIndex};
use crate::nlp::llm::LlmClient;
use crate::nlp::prompts;
use crate::nlp::rerank::{rerank_by, Reranker};
use crate::nlp::Embedder;

/// RRF constant and stream weights; semantic evidence dominates.
const RRF_K: f32 = 60.0;
const RRF_SEMANTIC_WEIGHT: f32 = 0.7;
const RRF_LEXICAL_WEIGHT: f32 = 0.3;

/// Floor for semantic-only results when the caller sets no threshold.
const DEFAULT_SEMANTIC_THRESHOLD: f32 = 0.3;

/// Queries longer than this skip expansion; long queries are already
/// specific and expansion mostly dilutes them.
const EXPANSION_MAX_TOKENS: usize = 15;

pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub warnings: Vec<String>,
}

pub struct RetrievalEngine {
    vectors: Arc<VectorIndex>,
    lexical: Arc<LexicalIndex>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    /// Expansion LLM; `None` disables the stage outright.
    expansion_llm: Option<(LlmClient, String)>,
}

#[derive(Deserialize)]
struct ExpansionReply {
    expanded: String,
}

impl RetrievalEngine {
    pub fn new(
        vectors: Arc<VectorIndex>,
        lexical: Arc<LexicalIndex>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        expansion_llm: Option<(LlmClient, String)>,
    ) -> RetrievalEngine {
        RetrievalEngine {
            vectors,
            lexical,
            embedder,
            reranker,
            expansion_llm,
        }
    }

    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchOutcome> {
        let mut warnings = Vec::new();
        let k = opts.k.max(1);
        let k_retrieval = (2 * k).max(20);

        let effective_query = if opts.expansion {
            self.expand_query(query, &mut warnings).await
        } else {
            query.to_string()
        };

        let filter = ChunkFilter {
            kind: opts.kind,
            domain: opts.domain.clone(),
        };

        // Dense retrieval.
        let semantic: Vec<(ChunkRecord, f32)> = match self.embedder.embed_one(&effective_query).await
        {
            Ok(vector) => match self.vectors.search(&vector, k_retrieval, &filter).await {
                Ok(results) => results,
                Err(e) => {
                    tracing::warn!("vector search failed: {:#}", e);
                    warnings.push("semantic_unavailable".to_string());
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::warn!("query embedding failed: {:#}", e);
                warnings.push("semantic_unavailable".to_string());
                Vec::new()
            }
        };

        // Lexical retrieval, hybrid only. Metadata filters apply post-hoc:
        // the BM25 snapshot has no filter pushdown.
        let lexical: Vec<(ChunkRecord, f32)> = if opts.hybrid {
            match self
                .lexical
                .search(&self.vectors, &effective_query, k_retrieval)
                .await
            {
                Ok(results) => results
                    .into_iter()
                    .filter(|(c, _)| filter_matches(c, opts))
                    .collect(),
                Err(e) => {
                    tracing::warn!("lexical search failed, semantic-only: {:#}", e);
                    warnings.push("lexical_unavailable".to_string());
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        if semantic.is_empty() && lexical.is_empty() {
            return Ok(SearchOutcome {
                hits: Vec::new(),
                warnings,
            });
        }

        // Fuse or pass through.
        let mut candidates: Vec<SearchHit> = if !lexical.is_empty() && !semantic.is_empty() {
            fuse_rrf(&semantic, &lexical)
        } else if !semantic.is_empty() {
            semantic
                .iter()
                .map(|(chunk, distance)| SearchHit {
                    text: chunk.text.clone(),
                    metadata: chunk.clone(),
                    score: similarity_from_distance(*distance),
                    score_kind: ScoreKind::CosineSimilarity,
                })
                .collect()
        } else {
            // Dense side degraded; lexical ranks stand in.
            lexical
                .iter()
                .enumerate()
                .map(|(rank, (chunk, _))| SearchHit {
                    text: chunk.text.clone(),
                    metadata: chunk.clone(),
                    score: RRF_LEXICAL_WEIGHT / (RRF_K + rank as f32 + 1.0),
                    score_kind: ScoreKind::Rrf,
                })
                .collect()
        };

        // Similarity threshold applies to cosine scores before any rerank.
        if candidates
            .first()
            .map(|h| h.score_kind == ScoreKind::CosineSimilarity)
            .unwrap_or(false)
        {
            let threshold = opts.min_similarity.unwrap_or(DEFAULT_SEMANTIC_THRESHOLD);
            candidates.retain(|h| h.score >= threshold);
        }

        // Rerank, default on. Absent scorer → keep order, flag it.
        let hits = if opts.reranking {
            match &self.reranker {
                Some(reranker) => {
                    let items: Vec<(SearchHit, String)> = candidates
                        .into_iter()
                        .map(|h| {
                            let text = h.text.clone();
                            (h, text)
                        })
                        .collect();
                    let mut reranked: Vec<SearchHit> =
                        rerank_by(reranker.as_ref(), &effective_query, items, k)
                            .into_iter()
                            .map(|(mut hit, score)| {
                                hit.score = score;
                                hit.score_kind = ScoreKind::Rerank;
                                hit
                            })
                            .collect();
                    if let Some(threshold) = opts.min_similarity {
                        reranked.retain(|h| h.score >= threshold);
                    }
                    reranked
                }
                None => {
                    warnings.push("rerank_unavailable".to_string());
                    candidates.truncate(k);
                    candidates
                }
            }
        } else {
            candidates.truncate(k);
            candidates
        };

        Ok(SearchOutcome { hits, warnings })
    }

    async fn expand_query(&self, query: &str, warnings: &mut Vec<String>) -> String {
        if query.split_whitespace().count() > EXPANSION_MAX_TOKENS {
            return query.to_string();
        }
        let Some((llm, model)) = &self.expansion_llm else {
            warnings.push("expansion_unavailable".to_string());
            return query.to_string();
        };
        let rendered = prompts::render(prompts::QUERY_EXPANSION_V1, query);
        match llm
            .complete(model, "You expand search queries.", &rendered, 128)
            .await
        {
            Ok(reply) => match prompts::extract_json(&reply)
                .and_then(|json| serde_json::from_str::<ExpansionReply>(json).ok())
            {
                Some(parsed) if !parsed.expanded.trim().is_empty() => parsed.expanded,
                _ => {
                    warnings.push("expansion_unparseable".to_string());
                    query.to_string()
                }
            },
            Err(e) => {
                tracing::debug!("expansion skipped: {}", e);
                warnings.push("expansion_unavailable".to_string());
                query.to_string()
            }
        }
    }
}

/// Distance is `1 − cosine_similarity`; display/threshold scores use
/// `1/(1+distance)` so they stay in (0, 1].
pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

fn filter_matches(chunk: &ChunkRecord, opts: &SearchOptions) -> bool {
    if let Some(kind) = opts.kind {
        if chunk.kind != kind {
            return false;
        }
    }
    if let Some(domain) = &opts.domain {
        if &chunk.domain != domain {
            return false;
        }
    }
    true
}

/// Reciprocal-rank fusion over the two ranked lists. Missing ranks contribute
/// nothing; ties break toward the better semantic rank.
fn fuse_rrf(
    semantic: &[(ChunkRecord, f32)],
    lexical: &[(ChunkRecord, f32)],
) -> Vec<SearchHit> {
    struct Fused {
        chunk: ChunkRecord,
        score: f32,
        semantic_rank: usize,
    }

    let mut by_id: HashMap<String, Fused> = HashMap::new();

    for (rank, (chunk, _)) in semantic.iter().enumerate() {
        let contribution = RRF_SEMANTIC_WEIGHT / (RRF_K + rank as f32 + 1.0);
        by_id.insert(
            chunk.id.clone(),
            Fused {
                chunk: chunk.clone(),
                score: contribution,
                semantic_rank: rank,
            },
        );
    }
    for (rank, (chunk, _)) in lexical.iter().enumerate() {
        let contribution = RRF_LEXICAL_WEIGHT / (RRF_K + rank as f32 + 1.0);
        by_id
            .entry(chunk.id.clone())
            .and_modify(|f| f.score += contribution)
            .or_insert(Fused {
                chunk: chunk.clone(),
                score: contribution,
                semantic_rank: usize::MAX,
            });
    }

    let mut fused: Vec<Fused> = by_id.into_values().collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.semantic_rank.cmp(&b.semantic_rank))
    });

    fused
        .into_iter()
        .map(|f| SearchHit {
            text: f.chunk.text.clone(),
            metadata: f.chunk,
            score: f.score,
            score_kind: ScoreKind::Rrf,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::normalize;
    use crate::core::types::{EnrichedMetadata, SourceKind};
    use crate::nlp::{HashEmbedder, LexicalReranker};
    use chrono::Utc;

    fn chunk(id: &str, url: &str, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
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

    #[test]
    fn rrf_combines_both_lists_with_weights() {
        let a = chunk("a", "https://x.example/a", "alpha");
        let b = chunk("b", "https://x.example/b", "beta");
        let c = chunk("c", "https://x.example/c", "gamma");

        // a: semantic rank 0 + lexical rank 1; b: semantic rank 1 only;
        // c: lexical rank 0 only.
        let semantic = vec![(a.clone(), 0.1), (b.clone(), 0.2)];
        let lexical = vec![(c.clone(), 9.0), (a.clone(), 5.0)];

        let fused = fuse_rrf(&semantic, &lexical);
        assert_eq!(fused.len(), 3);
        // a leads: it collects both contributions.
        assert_eq!(fused[0].metadata.id, "a");
        let expected_a = 0.7 / 61.0 + 0.3 / 62.0;
        assert!((fused[0].score - expected_a).abs() < 1e-6);
        assert_eq!(fused[0].score_kind, ScoreKind::Rrf);
        // b (0.7/62) beats c (0.3/61).
        assert_eq!(fused[1].metadata.id, "b");
        assert_eq!(fused[2].metadata.id, "c");
    }

    #[test]
    fn rrf_tie_breaks_by_semantic_rank() {
        let a = chunk("a", "https://x.example/a", "alpha");
        let b = chunk("b", "https://x.example/b", "beta");
        // Identical contribution patterns except semantic rank order.
        let semantic = vec![(a.clone(), 0.1), (b.clone(), 0.1)];
        let lexical = vec![(b.clone(), 2.0), (a.clone(), 2.0)];
        let fused = fuse_rrf(&semantic, &lexical);
        // Scores: a = 0.7/61 + 0.3/62, b = 0.7/62 + 0.3/61 → a wins on score;
        // with exactly equal scores the semantic rank would still favor a.
        assert_eq!(fused[0].metadata.id, "a");
    }

    #[test]
    fn similarity_conversion_bounds() {
        assert!((similarity_from_distance(0.0) - 1.0).abs() < 1e-6);
        assert!((similarity_from_distance(1.0) - 0.5).abs() < 1e-6);
        let s = similarity_from_distance(2.0);
        assert!(s > 0.33 && s < 0.34);
    }

    async fn engine_with_corpus(texts: &[(&str, &str)]) -> (RetrievalEngine, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let embedder = Arc::new(HashEmbedder { dim: 64 });
        let vectors = Arc::new(
            VectorIndex::open(dir.path().to_str().unwrap(), 64).await.unwrap(),
        );
        let mut records = Vec::new();
        for (i, (url, text)) in texts.iter().enumerate() {
            let mut c = chunk(&format!("c{i}"), url, text);
            c.embedding = embedder
                .embed_batch(&[text.to_string()])
                .await
                .unwrap()
                .remove(0);
            records.push(c);
        }
        vectors.add(&records).await.unwrap();

        let lexical = Arc::new(LexicalIndex::new());
        let engine = RetrievalEngine::new(
            vectors,
            lexical,
            embedder,
            Some(Arc::new(LexicalReranker)),
            None,
        );
        (engine, dir)
    }

    #[tokio::test]
    async fn hybrid_rerank_returns_on_topic_chunks_only() {
        let (engine, _dir) = engine_with_corpus(&[
            (
                "https://auth.example/1",
                "OAuth token exchange: the client presents an auth token to the server.",
            ),
            (
                "https://auth.example/2",
                "Refresh token rotation keeps auth sessions alive in OAuth deployments.",
            ),
            (
                "https://auth.example/3",
                "Bearer token usage and auth header formats for OAuth APIs.",
            ),
            (
                "https://zoo.example/unicorns",
                "Unicorns are mythical creatures that love rainbows and glitter.",
            ),
        ])
        .await;

        let opts = SearchOptions {
            k: 3,
            hybrid: true,
            reranking: true,
            ..Default::default()
        };
        let outcome = engine.search("token based auth", &opts).await.unwrap();
        assert_eq!(outcome.hits.len(), 3);
        for hit in &outcome.hits {
            assert_eq!(hit.score_kind, ScoreKind::Rerank);
            assert!(
                hit.text.to_lowercase().contains("token"),
                "unexpected off-topic hit: {}",
                hit.text
            );
        }
    }

    #[tokio::test]
    async fn semantic_only_tags_cosine_scores() {
        let (engine, _dir) = engine_with_corpus(&[
            ("https://a.example/1", "tokio async runtime internals"),
            ("https://a.example/2", "completely unrelated cooking recipe"),
        ])
        .await;

        let opts = SearchOptions {
            k: 2,
            hybrid: false,
            reranking: false,
            min_similarity: Some(0.0),
            ..Default::default()
        };
        let outcome = engine
            .search("tokio async runtime internals", &opts)
            .await
            .unwrap();
        assert!(!outcome.hits.is_empty());
        assert_eq!(outcome.hits[0].score_kind, ScoreKind::CosineSimilarity);
        assert_eq!(outcome.hits[0].metadata.source_url, "https://a.example/1");
        // Exact text match embeds identically: similarity ≈ 1.
        assert!(outcome.hits[0].score > 0.95);
    }

    #[tokio::test]
    async fn empty_store_returns_no_hits() {
        let (engine, _dir) = engine_with_corpus(&[]).await;
        let outcome = engine
            .search("anything", &SearchOptions::default())
            .await
            .unwrap();
        assert!(outcome.hits.is_empty());
    }

    #[tokio::test]
    async fn kind_filter_applies_to_both_streams() {
        let (engine, _dir) = engine_with_corpus(&[
            ("https://a.example/page", "shared keyword passage alpha"),
        ])
        .await;
        let opts = SearchOptions {
            k: 5,
            kind: Some(SourceKind::Repo),
            reranking: false,
            ..Default::default()
        };
        let outcome = engine.search("shared keyword passage", &opts).await.unwrap();
        assert!(outcome.hits.is_empty());
    }
}
