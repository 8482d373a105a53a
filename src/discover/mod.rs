//! Discovery orchestrator: free-form input → deduplicated, typed, prioritized
//! URL candidates.
//!
//! Inputs containing syntactic URLs short-circuit straight to candidates at
//! priority 100. Anything else is a research prompt: the LLM synthesizes
//! diverse search queries, the web-search provider fans out (responses
//! cached), and results are scored by provider rank weighted with a per-host
//! quality table. LLM unreachable degrades to the prompt as a literal query;
//! provider exhaustion returns whatever was gathered.

pub mod websearch;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;

use crate::catalog::normalize;
use crate::catalog::UrlCatalog;
use crate::core::types::{ApiCallRecord, DiscoveredUrl, DiscoveryResult, SourceKind};
use crate::nlp::llm::LlmClient;
use crate::nlp::prompts;

pub use websearch::{ApiSearchProvider, SearchProvider, SearchReply, WebSearchHit};

const USER_URL_PRIORITY: i64 = 100;
const SEARCH_PRIORITY: i64 = 50;
const MAX_QUERIES: usize = 8;
const RESULTS_PER_QUERY: usize = 10;
const MAX_CANDIDATES: usize = 50;

/// Default host-quality multipliers: documentation hosts and transcript
/// platforms rank above generic pages, code hosts slightly above baseline.
const DEFAULT_HOST_QUALITY: &[(&str, f32)] = &[
    ("readthedocs.io", 1.5),
    ("gitbook.io", 1.5),
    ("readme.io", 1.5),
    ("notion.site", 1.3),
    ("youtube.com", 1.3),
    ("youtu.be", 1.3),
    ("github.com", 1.2),
    ("gitlab.com", 1.2),
    ("stackoverflow.com", 1.1),
];

pub struct Orchestrator {
    provider: Arc<dyn SearchProvider>,
    llm: LlmClient,
    query_model: String,
    catalog: Arc<UrlCatalog>,
    search_cache: moka::future::Cache<String, Arc<Vec<WebSearchHit>>>,
    host_quality: Vec<(String, f32)>,
    tracking_params: Vec<String>,
    competitor_queries: bool,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        llm: LlmClient,
        query_model: String,
        catalog: Arc<UrlCatalog>,
        extra_host_quality: Vec<(String, f32)>,
        tracking_params: Vec<String>,
        competitor_queries: bool,
    ) -> Orchestrator {
        let mut host_quality: Vec<(String, f32)> = DEFAULT_HOST_QUALITY
            .iter()
            .map(|(h, w)| (h.to_string(), *w))
            .collect();
        host_quality.extend(extra_host_quality);
        Orchestrator {
            provider,
            llm,
            query_model,
            catalog,
            search_cache: moka::future::Cache::builder()
                .max_capacity(1_000)
                .time_to_live(std::time::Duration::from_secs(60 * 10))
                .build(),
            host_quality,
            tracking_params,
            competitor_queries,
        }
    }

    pub async fn discover(&self, input: &str) -> DiscoveryResult {
        let urls = extract_urls(input);
        if !urls.is_empty() {
            return self.from_explicit_urls(&urls);
        }
        self.from_prompt(input).await
    }

    /// User-supplied URLs: normalize, type, dedup. Priority 100.
    fn from_explicit_urls(&self, urls: &[String]) -> DiscoveryResult {
        let mut result = DiscoveryResult::default();
        let mut seen = std::collections::HashSet::new();
        for raw in urls {
            match normalize::normalize_url_with(raw, &self.tracking_params) {
                Ok(normalized) => {
                    if !seen.insert(normalized.clone()) {
                        continue;
                    }
                    let kind = normalize::detect_kind(&normalized);
                    result.candidates.push(DiscoveredUrl {
                        url: normalized,
                        kind,
                        priority: USER_URL_PRIORITY,
                        discovered_from: None,
                    });
                }
                Err(e) => result.warnings.push(format!("skipped '{raw}': {e}")),
            }
        }
        result
    }

    async fn from_prompt(&self, prompt: &str) -> DiscoveryResult {
        let mut result = DiscoveryResult::default();
        let prompt_id = format!("prompt:{}", normalize::url_hash(prompt));

        let mut queries = self.synthesize_queries(prompt, &mut result.warnings).await;
        if self.competitor_queries {
            for alt in self.competitor_names(prompt).await {
                queries.push(format!("{alt} documentation"));
            }
        }
        queries.truncate(MAX_QUERIES);
        result.queries_used = queries.clone();

        // url → (best weighted score, kind)
        let mut scored: std::collections::HashMap<String, (f32, SourceKind)> =
            std::collections::HashMap::new();

        for query in &queries {
            let hits = match self.cached_search(query).await {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!("search failed for '{}': {}", query, e);
                    result.warnings.push(format!("search_failed:{query}"));
                    continue;
                }
            };
            for (rank, hit) in hits.iter().enumerate() {
                let Ok(normalized) =
                    normalize::normalize_url_with(&hit.url, &self.tracking_params)
                else {
                    continue;
                };
                let score = self.weighted_score(rank, &normalized);
                let kind = normalize::detect_kind(&normalized);
                scored
                    .entry(normalized)
                    .and_modify(|(s, _)| *s = s.max(score))
                    .or_insert((score, kind));
            }
        }

        let mut ranked: Vec<(String, (f32, SourceKind))> = scored.into_iter().collect();
        ranked.sort_by(|a, b| b.1 .0.partial_cmp(&a.1 .0).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(MAX_CANDIDATES);

        result.candidates = ranked
            .into_iter()
            .map(|(url, (_, kind))| DiscoveredUrl {
                url,
                kind,
                priority: SEARCH_PRIORITY,
                discovered_from: Some(prompt_id.clone()),
            })
            .collect();
        result
    }

    /// Provider rank folded with the host-quality table:
    /// `score = 1/(1+rank) × host_weight`.
    fn weighted_score(&self, rank: usize, url: &str) -> f32 {
        let host = normalize::domain_of(url);
        let mut weight = 1.0f32;
        for (suffix, w) in &self.host_quality {
            if host == *suffix || host.ends_with(&format!(".{suffix}")) {
                weight = weight.max(*w);
            }
        }
        if host.starts_with("docs.") || host.starts_with("doc.") {
            weight = weight.max(1.5);
        }
        (1.0 / (1.0 + rank as f32)) * weight
    }

    async fn cached_search(&self, query: &str) -> anyhow::Result<Arc<Vec<WebSearchHit>>> {
        if let Some(cached) = self.search_cache.get(query).await {
            return Ok(cached);
        }
        let started = Instant::now();
        let reply = self.provider.search(query, RESULTS_PER_QUERY).await;
        let latency = started.elapsed().as_millis() as u64;

        let record = ApiCallRecord {
            api_name: "websearch".to_string(),
            timestamp: Utc::now(),
            success: reply.is_ok(),
            latency_ms: latency,
            remaining_quota: reply.as_ref().ok().and_then(|r| r.remaining_quota),
        };
        if let Err(e) = self.catalog.log_api_call(record).await {
            tracing::debug!("api-call log write failed: {}", e);
        }

        let reply = reply?;
        let hits = Arc::new(reply.hits);
        self.search_cache.insert(query.to_string(), hits.clone()).await;
        Ok(hits)
    }

    /// LLM query synthesis with literal-query fallback.
    async fn synthesize_queries(&self, prompt: &str, warnings: &mut Vec<String>) -> Vec<String> {
        let rendered = prompts::render(prompts::QUERY_SYNTHESIS_V2, prompt);
        let started = Instant::now();
        let reply = self
            .llm
            .complete(&self.query_model, "You write web search queries.", &rendered, 256)
            .await;
        let record = ApiCallRecord {
            api_name: "llm".to_string(),
            timestamp: Utc::now(),
            success: reply.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
            remaining_quota: None,
        };
        if let Err(e) = self.catalog.log_api_call(record).await {
            tracing::debug!("api-call log write failed: {}", e);
        }

        match reply {
            Ok(text) => match parse_query_list(&text) {
                Some(queries) if !queries.is_empty() => queries,
                _ => {
                    warnings.push("query_synthesis_unparseable".to_string());
                    vec![prompt.to_string()]
                }
            },
            Err(e) => {
                tracing::warn!("query synthesis failed ({}), using literal prompt", e);
                warnings.push("query_synthesis_unavailable".to_string());
                vec![prompt.to_string()]
            }
        }
    }

    async fn competitor_names(&self, prompt: &str) -> Vec<String> {
        let rendered = prompts::render(prompts::COMPETITOR_V1, prompt);
        match self
            .llm
            .complete(&self.query_model, "You know the technology landscape.", &rendered, 128)
            .await
        {
            Ok(text) => parse_query_list(&text).unwrap_or_default(),
            Err(e) => {
                tracing::debug!("competitor pass skipped: {}", e);
                Vec::new()
            }
        }
    }
}

fn parse_query_list(reply: &str) -> Option<Vec<String>> {
    let json = prompts::extract_json(reply)?;
    let value: Value = serde_json::from_str(json).ok()?;
    let list = value.as_array()?;
    Some(
        list.iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

/// Syntactic URL extraction; trailing sentence punctuation is not part of the
/// URL.
pub fn extract_urls(input: &str) -> Vec<String> {
    let re = Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("static regex");
    re.find_iter(input)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', '!', '?']).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_extraction_from_free_text() {
        let urls = extract_urls(
            "index https://docs.example.com/intro and HTTP not https://github.com/a/b, thanks",
        );
        assert_eq!(
            urls,
            vec!["https://docs.example.com/intro", "https://github.com/a/b"]
        );
        assert!(extract_urls("just a research prompt").is_empty());
    }

    #[test]
    fn query_list_parsing_tolerates_fences() {
        let parsed = parse_query_list("```json\n[\"a query\", \"another\"]\n```").unwrap();
        assert_eq!(parsed, vec!["a query", "another"]);
        assert!(parse_query_list("not json at all").is_none());
    }

    #[tokio::test]
    async fn explicit_urls_take_priority_100_and_dedup() {
        let orchestrator = test_orchestrator(Arc::new(EmptyProvider)).await;
        let result = orchestrator
            .discover("see https://Docs.Example.com/intro/ and https://docs.example.com/intro")
            .await;
        assert_eq!(result.candidates.len(), 1);
        let c = &result.candidates[0];
        assert_eq!(c.url, "https://docs.example.com/intro");
        assert_eq!(c.priority, 100);
        assert_eq!(c.kind, SourceKind::DocSitePage);
        assert!(c.discovered_from.is_none());
    }

    #[tokio::test]
    async fn prompt_path_degrades_to_literal_query_without_llm() {
        let provider = Arc::new(StaticProvider {
            hits: vec![
                WebSearchHit {
                    url: "https://docs.example.com/auth".into(),
                    title: "Auth docs".into(),
                    snippet: "docs".into(),
                },
                WebSearchHit {
                    url: "https://blogspam.example.net/post".into(),
                    title: "post".into(),
                    snippet: "blog".into(),
                },
            ],
        });
        let orchestrator = test_orchestrator(provider).await;
        let result = orchestrator.discover("token based auth").await;

        // LLM at an unreachable endpoint → literal query fallback, flagged.
        assert_eq!(result.queries_used, vec!["token based auth"]);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.starts_with("query_synthesis")));
        assert_eq!(result.candidates.len(), 2);
        // Doc host outranks the generic host despite equal provider ranks
        // only when ranks differ; here rank 0 wins regardless — check fields.
        for c in &result.candidates {
            assert_eq!(c.priority, 50);
            assert!(c.discovered_from.as_deref().unwrap().starts_with("prompt:"));
        }
    }

    #[tokio::test]
    async fn host_quality_outweighs_adjacent_rank() {
        let orchestrator = test_orchestrator(Arc::new(EmptyProvider)).await;
        // Generic host at rank 0 vs documentation host at rank 1:
        // 1.0 vs (1/2)·1.5 = 0.75 — rank 0 still wins.
        let generic = orchestrator.weighted_score(0, "https://example.org/a");
        let doc_rank1 = orchestrator.weighted_score(1, "https://api.readthedocs.io/b");
        assert!(generic > doc_rank1);
        // Same rank: documentation host wins.
        let doc_rank0 = orchestrator.weighted_score(0, "https://api.readthedocs.io/b");
        assert!(doc_rank0 > generic);
    }

    struct EmptyProvider;

    #[async_trait::async_trait]
    impl SearchProvider for EmptyProvider {
        async fn search(&self, _query: &str, _count: usize) -> anyhow::Result<SearchReply> {
            Ok(SearchReply::default())
        }
    }

    struct StaticProvider {
        hits: Vec<WebSearchHit>,
    }

    #[async_trait::async_trait]
    impl SearchProvider for StaticProvider {
        async fn search(&self, _query: &str, _count: usize) -> anyhow::Result<SearchReply> {
            Ok(SearchReply {
                hits: self.hits.clone(),
                remaining_quota: Some(100),
            })
        }
    }

    async fn test_orchestrator(provider: Arc<dyn SearchProvider>) -> Orchestrator {
        let catalog = Arc::new(UrlCatalog::open_in_memory().unwrap());
        // Port 9 (discard) is never listening; LLM calls fail fast.
        let llm = LlmClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/v1".to_string(),
            None,
            2,
        );
        Orchestrator::new(
            provider,
            llm,
            "test-model".to_string(),
            catalog,
            Vec::new(),
            Vec::new(),
            false,
        )
    }
}
