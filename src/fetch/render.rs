//! Shared headless-browser fallback for JS-rendered pages.
//!
//! One Chromium instance, launched lazily on first use and reused across
//! fetches; each render opens and closes a tab. Absent a local Chromium the
//! renderer is simply not constructed and the HTML fetcher stays static-only.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::sync::OnceCell;

const NAV_TIMEOUT: Duration = Duration::from_secs(25);
const SETTLE_DELAY: Duration = Duration::from_millis(600);

const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "msedge",
];

pub struct Renderer {
    browser: OnceCell<Browser>,
}

impl Renderer {
    /// Construct only when a Chromium-family executable is discoverable.
    pub fn new_auto() -> Option<Renderer> {
        let found = CHROME_CANDIDATES.iter().any(|c| which::which(c).is_ok());
        if !found {
            tracing::info!("no Chromium executable found; headless rendering disabled");
            return None;
        }
        Some(Renderer {
            browser: OnceCell::new(),
        })
    }

    async fn browser(&self) -> Result<&Browser> {
        self.browser
            .get_or_try_init(|| async {
                let config = BrowserConfig::builder()
                    .build()
                    .map_err(|e| anyhow!("browser config: {e}"))?;
                let (browser, mut handler) = Browser::launch(config)
                    .await
                    .context("launching headless browser")?;
                tokio::spawn(async move { while handler.next().await.is_some() {} });
                tracing::info!("headless browser launched");
                Ok(browser)
            })
            .await
    }

    /// Navigate, wait for the page to settle, return the live DOM as HTML.
    pub async fn render_html(&self, url: &str) -> Result<String> {
        let browser = self.browser().await?;
        let page = tokio::time::timeout(NAV_TIMEOUT, browser.new_page(url))
            .await
            .map_err(|_| anyhow!("navigation timed out for {url}"))?
            .with_context(|| format!("opening page {url}"))?;

        let _ = tokio::time::timeout(NAV_TIMEOUT, page.wait_for_navigation()).await;
        tokio::time::sleep(SETTLE_DELAY).await;

        let html = page
            .content()
            .await
            .with_context(|| format!("reading rendered DOM of {url}"))?;
        let _ = page.close().await;
        Ok(html)
    }
}
