//! Web-search provider adapter.
//!
//! One GET endpoint, API key in a header, JSON results carrying url / title /
//! snippet. Everything provider-specific lives here; swapping providers means
//! swapping this adapter behind [`SearchProvider`].

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct WebSearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Default)]
pub struct SearchReply {
    pub hits: Vec<WebSearchHit>,
    /// Remaining request allowance as reported by the provider, if any.
    pub remaining_quota: Option<i64>,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, count: usize) -> Result<SearchReply>;
}

/// Brave-Search-API-shaped provider: `?q=` query, `X-Subscription-Token`
/// header, `web.results[]` response body.
pub struct ApiSearchProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    web: ApiWebSection,
}

#[derive(Deserialize, Default)]
struct ApiWebSection {
    #[serde(default)]
    results: Vec<ApiResult>,
}

#[derive(Deserialize)]
struct ApiResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

impl ApiSearchProvider {
    pub fn new(http: reqwest::Client, endpoint: String, api_key: String) -> ApiSearchProvider {
        ApiSearchProvider {
            http,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl SearchProvider for ApiSearchProvider {
    async fn search(&self, query: &str, count: usize) -> Result<SearchReply> {
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&[("q", query), ("count", &count.to_string())])
            .header("X-Subscription-Token", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .context("search provider request")?;

        let remaining_quota = resp
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<i64>().ok());

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(anyhow!("search provider over quota (429)"));
        }
        if !status.is_success() {
            return Err(anyhow!("search provider returned {}", status));
        }

        let parsed: ApiResponse = resp.json().await.context("decoding search response")?;
        let hits = parsed
            .web
            .results
            .into_iter()
            .map(|r| WebSearchHit {
                url: r.url,
                title: r.title,
                snippet: r.description,
            })
            .collect();

        Ok(SearchReply {
            hits,
            remaining_quota,
        })
    }
}
