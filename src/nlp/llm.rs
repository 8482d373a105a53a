//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint speaking the `/chat/completions` shape —
//! hosted APIs or local Ollama / LM Studio. An empty API key means a
//! key-less local endpoint; no auth header is sent.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl LlmClient {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> LlmClient {
        LlmClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// One completion round-trip. Timeouts and transport failures surface as
    /// errors; callers decide whether to degrade (enrichment, expansion) or
    /// fall back (query synthesis).
    pub async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.2,
            "max_tokens": max_tokens,
        });

        let mut req = self.http.post(&url).timeout(self.timeout).json(&body);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("LLM request to {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "LLM endpoint returned {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            ));
        }

        let parsed: ChatResponse = resp.json().await.context("decoding LLM response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("LLM response had no choices"))
    }
}
