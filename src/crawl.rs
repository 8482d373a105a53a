//! Bounded same-origin crawler for documentation domains.
//!
//! BFS from a start URL, collecting link targets (anchors plus sitemap
//! entries) into a discovered set. The crawler only fetches pages to extract
//! links; discovered URLs become ordinary pending catalog entries and are
//! fetched later through the normal queue. Crawl-discovered entries are never
//! crawled again, which is what stops recursive amplification.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use aho_corasick::{AhoCorasick, Anchored, Input, MatchKind};
use anyhow::Result;
use scraper::{Html, Selector};
use url::Url;

use crate::catalog::normalize;

/// Path prefixes that never lead to content.
const EXCLUDED_PATH_PREFIXES: &[&str] = &[
    "/login", "/signup", "/search", "/cart", "/checkout", "/account", "/admin", "/api/",
];

/// Opaque file types: images, media, archives, executables, documents, and
/// asset files that are not content pages.
const EXCLUDED_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".mp4", ".mp3", ".wav", ".avi",
    ".mov", ".mkv", ".webm", ".zip", ".tar", ".gz", ".tgz", ".bz2", ".7z", ".rar", ".exe", ".dmg",
    ".msi", ".deb", ".rpm", ".iso", ".bin", ".pdf", ".doc", ".docx", ".ppt", ".pptx", ".xls",
    ".xlsx", ".woff", ".woff2", ".ttf", ".eot", ".css", ".js", ".map", ".json", ".xml", ".rss",
    ".atom",
];

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub max_pages: usize,
    pub time_budget: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        CrawlConfig {
            max_pages: 1000,
            time_budget: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
pub struct CrawlOutcome {
    /// Normalized URLs accepted into the crawl, start URL included.
    pub discovered: Vec<String>,
    pub pages_visited: usize,
    /// True when the page cap or the soft time bound cut the crawl short.
    pub truncated: bool,
}

pub struct Crawler {
    http: reqwest::Client,
    user_agent: String,
    path_matcher: AhoCorasick,
}

impl Crawler {
    pub fn new(http: reqwest::Client, user_agent: String) -> Crawler {
        let path_matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostFirst)
            .start_kind(aho_corasick::StartKind::Anchored)
            .build(EXCLUDED_PATH_PREFIXES)
            .expect("static prefix patterns");
        Crawler {
            http,
            user_agent,
            path_matcher,
        }
    }

    pub async fn crawl(&self, start_url: &str, config: &CrawlConfig) -> Result<CrawlOutcome> {
        if config.max_pages == 0 {
            return Ok(CrawlOutcome {
                discovered: Vec::new(),
                pages_visited: 0,
                truncated: false,
            });
        }

        let started = Instant::now();
        let start = normalize::normalize_url(start_url)?;
        let origin = Url::parse(&start)?;

        let mut discovered: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        discovered.insert(start.clone());
        queue.push_back(start.clone());

        // Sitemap entries seed the frontier alongside anchor extraction.
        for loc in self.fetch_sitemap(&origin).await {
            if discovered.len() >= config.max_pages {
                break;
            }
            if let Ok(normalized) = normalize::normalize_url(&loc) {
                if self.should_enqueue(&origin, &normalized) && discovered.insert(normalized.clone())
                {
                    queue.push_back(normalized);
                }
            }
        }

        let mut pages_visited = 0usize;
        let mut truncated = false;

        while let Some(url) = queue.pop_front() {
            if started.elapsed() > config.time_budget {
                tracing::info!("crawl of {} hit time budget, stopping", start);
                truncated = true;
                break;
            }
            if pages_visited >= config.max_pages {
                truncated = true;
                break;
            }

            pages_visited += 1;
            let html = match self.fetch_page(&url).await {
                Ok(html) => html,
                Err(e) => {
                    tracing::debug!("crawl fetch failed for {}: {}", url, e);
                    continue;
                }
            };

            for href in extract_links(&html, &url) {
                if discovered.len() >= config.max_pages {
                    truncated = true;
                    break;
                }
                let Ok(normalized) = normalize::normalize_url(&href) else {
                    continue;
                };
                if self.should_enqueue(&origin, &normalized) && discovered.insert(normalized.clone())
                {
                    queue.push_back(normalized);
                }
            }
        }

        tracing::info!(
            "crawl of {} finished: {} discovered, {} visited, {}ms",
            start,
            discovered.len(),
            pages_visited,
            started.elapsed().as_millis()
        );

        let mut discovered: Vec<String> = discovered.into_iter().collect();
        discovered.sort();
        Ok(CrawlOutcome {
            discovered,
            pages_visited,
            truncated,
        })
    }

    async fn fetch_page(&self, url: &str) -> Result<String> {
        let resp = self
            .http
            .get(url)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/html,application/xhtml+xml")
            .timeout(Duration::from_secs(15))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("status {}", resp.status());
        }
        Ok(resp.text().await?)
    }

    async fn fetch_sitemap(&self, origin: &Url) -> Vec<String> {
        let Ok(sitemap_url) = origin.join("/sitemap.xml") else {
            return Vec::new();
        };
        match self.fetch_page(sitemap_url.as_str()).await {
            Ok(xml) => parse_sitemap_locs(&xml),
            Err(_) => Vec::new(),
        }
    }

    /// Same origin, not an excluded prefix, not an opaque extension.
    fn should_enqueue(&self, origin: &Url, candidate: &str) -> bool {
        let Ok(parsed) = Url::parse(candidate) else {
            return false;
        };
        if parsed.scheme() != origin.scheme()
            || parsed.host_str() != origin.host_str()
            || parsed.port_or_known_default() != origin.port_or_known_default()
        {
            return false;
        }

        let path = parsed.path().to_ascii_lowercase();
        let input = Input::new(path.as_str()).anchored(Anchored::Yes);
        if self.path_matcher.find(input).is_some() {
            return false;
        }
        if EXCLUDED_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            return false;
        }
        true
    }
}

/// Resolve every anchor href against the page URL; keep http(s) targets only.
fn extract_links(html: &str, base: &str) -> Vec<String> {
    let Ok(base_url) = Url::parse(base) else {
        return Vec::new();
    };
    let doc = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("static selector");

    let mut out = Vec::new();
    for a in doc.select(&selector) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("data:")
        {
            continue;
        }
        if let Ok(resolved) = base_url.join(href) {
            if resolved.scheme() == "http" || resolved.scheme() == "https" {
                out.push(resolved.to_string());
            }
        }
    }
    out
}

fn parse_sitemap_locs(xml: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(open) = rest.find("<loc>") {
        let after = &rest[open + 5..];
        let Some(close) = after.find("</loc>") else {
            break;
        };
        let loc = after[..close].trim();
        if !loc.is_empty() {
            out.push(loc.to_string());
        }
        rest = &after[close + 6..];
    }
    out
}
