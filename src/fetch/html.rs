//! HTML page fetcher: static GET, main-content extraction, markdown output.
//!
//! Validators (`Last-Modified`, `ETag`) are recorded verbatim from the
//! response for the refresher's cheap checks. Pages that render their content
//! client-side fall back to a shared headless browser when one is available.

use std::sync::Arc;
use std::time::Duration;

use backoff::{future::retry, ExponentialBackoffBuilder};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use url::Url;

use crate::core::error::FetchError;
use crate::core::types::{DocumentValidators, FetchedDocument, SourceKind};
use crate::fetch::render::Renderer;

/// Below this many extracted words a JS-rendered page is suspected and the
/// headless fallback kicks in.
const MIN_STATIC_WORDS: usize = 40;

pub struct HtmlFetcher {
    http: reqwest::Client,
    user_agent: String,
    head_timeout: Duration,
    renderer: Option<Arc<Renderer>>,
}

impl HtmlFetcher {
    pub fn new(
        http: reqwest::Client,
        user_agent: String,
        head_timeout_secs: u64,
        renderer: Option<Arc<Renderer>>,
    ) -> HtmlFetcher {
        HtmlFetcher {
            http,
            user_agent,
            head_timeout: Duration::from_secs(head_timeout_secs),
            renderer,
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let (html, validators) = self.get_html(url).await?;

        let mut doc = extract_document(url, &html, validators)?;

        // Suspiciously empty extraction usually means a client-rendered app.
        if doc.text.split_whitespace().count() < MIN_STATIC_WORDS {
            if let Some(renderer) = &self.renderer {
                match renderer.render_html(url).await {
                    Ok(rendered) => {
                        tracing::debug!("static extraction thin for {}, re-extracted after render", url);
                        let rendered_doc =
                            extract_document(url, &rendered, doc.validators.clone())?;
                        if rendered_doc.text.split_whitespace().count()
                            > doc.text.split_whitespace().count()
                        {
                            doc = rendered_doc;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("headless render failed for {}: {}", url, e);
                    }
                }
            }
        }

        if doc.text.trim().is_empty() {
            return Err(FetchError::Permanent(format!("no extractable content at {url}")));
        }
        Ok(doc)
    }

    /// GET with a short inner retry on connect-level failures. HTTP statuses
    /// are never retried here; the scheduler owns that accounting.
    async fn get_html(&self, url: &str) -> Result<(String, DocumentValidators), FetchError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(Duration::from_secs(8)))
            .build();

        let resp = retry(policy, || async {
            self.http
                .get(url)
                .header("User-Agent", &self.user_agent)
                .header("Accept", "text/html,application/xhtml+xml")
                .send()
                .await
                .map_err(backoff::Error::transient)
        })
        .await
        .map_err(|e| FetchError::Transient(format!("request failed for {url}: {e}")))?;

        let status = resp.status();
        if let Some(err) = FetchError::from_status(status, url) {
            return Err(err);
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        if let Some(ct) = &content_type {
            let ct = ct.to_ascii_lowercase();
            if !ct.contains("html") && !ct.contains("text") && !ct.contains("xml") {
                return Err(FetchError::Permanent(format!(
                    "unsupported content-type '{ct}' at {url}"
                )));
            }
        }

        let validators = DocumentValidators {
            http_last_modified: header_string(&resp, reqwest::header::LAST_MODIFIED),
            http_etag: header_string(&resp, reqwest::header::ETAG),
            commit_id: None,
            status_code: Some(status.as_u16()),
            content_type,
        };

        let html = resp
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("reading body of {url}: {e}")))?;
        Ok((html, validators))
    }

    /// HEAD request for the refresher: follows redirects, 10s deadline,
    /// returns whatever validators the server presents.
    pub async fn head_validators(&self, url: &str) -> Result<DocumentValidators, FetchError> {
        let resp = self
            .http
            .head(url)
            .header("User-Agent", &self.user_agent)
            .timeout(self.head_timeout)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("HEAD failed for {url}: {e}")))?;

        let status = resp.status();
        // 405 means the server rejects HEAD outright; callers fall through to
        // a full fetch rather than failing the entry.
        if status != StatusCode::METHOD_NOT_ALLOWED {
            if let Some(err) = FetchError::from_status(status, url) {
                return Err(err);
            }
        }

        Ok(DocumentValidators {
            http_last_modified: header_string(&resp, reqwest::header::LAST_MODIFIED),
            http_etag: header_string(&resp, reqwest::header::ETAG),
            commit_id: None,
            status_code: Some(status.as_u16()),
            content_type: header_string(&resp, reqwest::header::CONTENT_TYPE),
        })
    }
}

fn header_string(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Readability main-content extraction, markdown conversion, language
/// detection. Pure, so the render fallback can reuse it.
fn extract_document(
    url: &str,
    html: &str,
    validators: DocumentValidators,
) -> Result<FetchedDocument, FetchError> {
    let parsed_url = Url::parse(url)
        .map_err(|e| FetchError::Permanent(format!("unparseable url {url}: {e}")))?;

    let extracted = readability::extractor::extract(&mut html.as_bytes(), &parsed_url)
        .map_err(|e| FetchError::Permanent(format!("content extraction failed for {url}: {e}")))?;

    let markdown = html2md::parse_html(&extracted.content);
    let text = if markdown.trim().is_empty() {
        extracted.text.clone()
    } else {
        markdown
    };

    let title = if extracted.title.trim().is_empty() {
        html_title(html).unwrap_or_else(|| url.to_string())
    } else {
        extracted.title.clone()
    };

    let language = whatlang::detect(&text).map(|info| info.lang().code().to_string());

    Ok(FetchedDocument {
        url: url.to_string(),
        kind: SourceKind::WebPage,
        title,
        language,
        text,
        validators,
        attributes: serde_json::Value::Null,
    })
}

fn html_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    let title = doc.select(&selector).next()?;
    let text = title.text().collect::<Vec<_>>().join(" ");
    let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
