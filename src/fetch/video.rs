//! Transcript-provider adapter: per-video transcript pulls and channel
//! enumeration.
//!
//! The provider is a configurable HTTPS endpoint returning timestamped
//! segments; swapping providers means changing this adapter only. Videos are
//! immutable: a missing transcript is permanent and indexed videos are never
//! re-fetched.

use serde::Deserialize;
use url::Url;

use crate::core::error::FetchError;
use crate::core::types::{DocumentValidators, FetchedDocument, SourceKind};

pub struct VideoFetcher {
    http: reqwest::Client,
    endpoint: String,
    user_agent: String,
}

#[derive(Deserialize)]
struct TranscriptResponse {
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    duration_secs: Option<f64>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

#[derive(Deserialize)]
struct TranscriptSegment {
    start: f64,
    text: String,
}

#[derive(Deserialize)]
struct ChannelResponse {
    #[serde(default)]
    videos: Vec<ChannelVideo>,
}

#[derive(Deserialize)]
struct ChannelVideo {
    #[serde(default)]
    video_id: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl VideoFetcher {
    pub fn new(http: reqwest::Client, endpoint: String, user_agent: String) -> VideoFetcher {
        VideoFetcher {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            user_agent,
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let id = video_id(url)
            .ok_or_else(|| FetchError::Permanent(format!("no video id in {url}")))?;

        let request_url = format!("{}/transcript?video_id={}", self.endpoint, id);
        let resp = self
            .http
            .get(&request_url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("transcript request for {id}: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::Permanent(format!("no transcript for video {id}")));
        }
        if let Some(err) = FetchError::from_status(status, &request_url) {
            return Err(err);
        }

        let transcript: TranscriptResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("decoding transcript for {id}: {e}")))?;
        if transcript.segments.is_empty() {
            return Err(FetchError::Permanent(format!("empty transcript for video {id}")));
        }

        let text = transcript
            .segments
            .iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| format!("[{:.1}] {}", s.start, s.text.trim()))
            .collect::<Vec<_>>()
            .join("\n");

        let title = if transcript.title.trim().is_empty() {
            format!("video {id}")
        } else {
            transcript.title.clone()
        };

        Ok(FetchedDocument {
            url: url.to_string(),
            kind: SourceKind::Video,
            title,
            language: transcript.language.clone(),
            text,
            validators: DocumentValidators::default(),
            attributes: serde_json::json!({
                "video_id": id,
                "author": transcript.author,
                "duration_secs": transcript.duration_secs,
                "segment_count": transcript.segments.len(),
            }),
        })
    }

    /// Enumerate up to `limit` video URLs for a channel. Produces no document
    /// itself; the processor inserts the results as new pending entries.
    pub async fn expand_channel(&self, url: &str, limit: usize) -> Result<Vec<String>, FetchError> {
        let request_url = format!(
            "{}/channel/videos?channel_url={}&limit={}",
            self.endpoint,
            urlencode(url),
            limit
        );
        let resp = self
            .http
            .get(&request_url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("channel listing for {url}: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::Permanent(format!("channel not found: {url}")));
        }
        if let Some(err) = FetchError::from_status(status, &request_url) {
            return Err(err);
        }

        let listing: ChannelResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("decoding channel listing: {e}")))?;

        let videos = listing
            .videos
            .into_iter()
            .filter_map(|v| {
                v.url.or_else(|| {
                    v.video_id
                        .map(|id| format!("https://www.youtube.com/watch?v={id}"))
                })
            })
            .take(limit)
            .collect();
        Ok(videos)
    }
}

fn urlencode(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// Extract the platform video id from the watch-style URL shapes the kind
/// detector admits.
pub fn video_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if host == "youtu.be" {
        return parsed
            .path_segments()?
            .find(|s| !s.is_empty())
            .map(|s| s.to_string());
    }
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    match segments.first().copied() {
        Some("watch") => parsed
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned()),
        Some("shorts") | Some("embed") => segments.get(1).map(|s| s.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_id_extraction() {
        assert_eq!(
            video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            Some("dQw4w9WgXcQ".to_string())
        );
        assert_eq!(video_id("https://youtu.be/abc123"), Some("abc123".to_string()));
        assert_eq!(
            video_id("https://www.youtube.com/shorts/xyz789"),
            Some("xyz789".to_string())
        );
        assert_eq!(video_id("https://www.youtube.com/@channel"), None);
        assert_eq!(video_id("https://example.org/watch?v=nope"), Some("nope".to_string()));
    }

    #[test]
    fn transcript_lines_match_chunker_format() {
        let segments = vec![
            TranscriptSegment { start: 0.0, text: "hello there".into() },
            TranscriptSegment { start: 12.34, text: " general".into() },
        ];
        let text = segments
            .iter()
            .map(|s| format!("[{:.1}] {}", s.start, s.text.trim()))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(text, "[0.0] hello there\n[12.3] general");
    }
}
