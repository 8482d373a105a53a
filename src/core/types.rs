use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Catalog model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    WebPage,
    DocSitePage,
    Repo,
    Video,
    VideoChannel,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::WebPage => "web_page",
            SourceKind::DocSitePage => "doc_site_page",
            SourceKind::Repo => "repo",
            SourceKind::Video => "video",
            SourceKind::VideoChannel => "video_channel",
        }
    }

    pub fn parse(s: &str) -> Option<SourceKind> {
        match s {
            "web_page" => Some(SourceKind::WebPage),
            "doc_site_page" => Some(SourceKind::DocSitePage),
            "repo" => Some(SourceKind::Repo),
            "video" => Some(SourceKind::Video),
            "video_channel" => Some(SourceKind::VideoChannel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Fetched,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Fetched => "fetched",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<EntryStatus> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "fetched" => Some(EntryStatus::Fetched),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }
}

/// How often an indexed source is revisited. Serialized as `never` / `days:N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    Never,
    Days(u32),
}

impl RefreshPolicy {
    /// Defaults per source kind: videos are immutable, repos move fast,
    /// documentation at a middle cadence, everything else monthly.
    pub fn for_kind(kind: SourceKind) -> RefreshPolicy {
        match kind {
            SourceKind::Video | SourceKind::VideoChannel => RefreshPolicy::Never,
            SourceKind::Repo => RefreshPolicy::Days(7),
            SourceKind::DocSitePage => RefreshPolicy::Days(14),
            SourceKind::WebPage => RefreshPolicy::Days(30),
        }
    }

    pub fn as_str(&self) -> String {
        match self {
            RefreshPolicy::Never => "never".to_string(),
            RefreshPolicy::Days(n) => format!("days:{n}"),
        }
    }

    pub fn parse(s: &str) -> RefreshPolicy {
        if let Some(n) = s.strip_prefix("days:").and_then(|v| v.parse().ok()) {
            RefreshPolicy::Days(n)
        } else {
            RefreshPolicy::Never
        }
    }

    /// Next refresh deadline counted from `when`; `None` for immutable sources.
    pub fn next_from(&self, when: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RefreshPolicy::Never => None,
            RefreshPolicy::Days(n) => Some(when + Duration::days(i64::from(*n))),
        }
    }
}

/// A row in the URL catalog. Identity is `url_hash` over the normalized URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub url_hash: String,
    pub url: String,
    pub kind: SourceKind,
    pub status: EntryStatus,
    pub priority: i64,
    pub discovered_from: Option<String>,
    pub added_at: DateTime<Utc>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    #[serde(with = "refresh_policy_serde")]
    pub refresh_policy: RefreshPolicy,
}

mod refresh_policy_serde {
    use super::RefreshPolicy;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(p: &RefreshPolicy, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&p.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<RefreshPolicy, D::Error> {
        Ok(RefreshPolicy::parse(&String::deserialize(d)?))
    }
}

impl CatalogEntry {
    /// Build a pending entry for an already-normalized URL.
    pub fn new(
        normalized_url: String,
        kind: SourceKind,
        priority: i64,
        discovered_from: Option<String>,
    ) -> CatalogEntry {
        CatalogEntry {
            url_hash: crate::catalog::normalize::url_hash(&normalized_url),
            url: normalized_url,
            kind,
            status: EntryStatus::Pending,
            priority,
            discovered_from,
            added_at: Utc::now(),
            last_fetched_at: None,
            next_refresh_at: None,
            retry_count: 0,
            last_error: None,
            refresh_policy: RefreshPolicy::for_kind(kind),
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch model
// ---------------------------------------------------------------------------

/// Cheap-check validators captured at fetch time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentValidators {
    pub http_last_modified: Option<String>,
    pub http_etag: Option<String>,
    pub commit_id: Option<String>,
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
}

/// Normalized output of any fetcher, ready for chunking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub url: String,
    pub kind: SourceKind,
    pub title: String,
    pub language: Option<String>,
    pub text: String,
    pub validators: DocumentValidators,
    /// Kind-specific extras (video duration, repo star count, file count…).
    #[serde(default)]
    pub attributes: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Chunk model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn parse(s: &str) -> Option<Difficulty> {
        match s {
            "beginner" => Some(Difficulty::Beginner),
            "intermediate" => Some(Difficulty::Intermediate),
            "advanced" => Some(Difficulty::Advanced),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Beginner => "beginner",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
        }
    }
}

/// LLM-extracted topical metadata. Every field degrades to empty on parse
/// failure; enrichment never fails a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichedMetadata {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
}

/// A fully-assembled vector-index record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    /// Hash of the source URL; groups all of a URL's chunks.
    pub document_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    pub source_url: String,
    pub kind: SourceKind,
    pub domain: String,
    pub content_hash: String,
    pub http_last_modified: Option<String>,
    pub http_etag: Option<String>,
    pub commit_id: Option<String>,
    /// Start offset of the first transcript segment, video chunks only.
    pub start_time_secs: Option<f64>,
    pub metadata: EnrichedMetadata,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Discovery model
// ---------------------------------------------------------------------------

/// One candidate produced by discovery, normalized and typed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredUrl {
    pub url: String,
    pub kind: SourceKind,
    pub priority: i64,
    pub discovered_from: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub candidates: Vec<DiscoveredUrl>,
    pub queries_used: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Operation reports (the exposed-operation contract shapes)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub added: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub checked: usize,
    pub unchanged: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub catalog_by_status: BTreeMap<String, u64>,
    pub catalog_by_kind: BTreeMap<String, u64>,
    pub chunk_count: u64,
    pub api_quota: Vec<ApiQuotaSnapshot>,
}

/// Latest-call view of one remote API, derived from the call log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiQuotaSnapshot {
    pub api_name: String,
    pub calls_today: u64,
    pub failures_today: u64,
    pub remaining_quota: Option<i64>,
}

/// Transient log row for quota surfacing; never consulted on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallRecord {
    pub api_name: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    pub remaining_quota: Option<i64>,
}

// ---------------------------------------------------------------------------
// Retrieval model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    CosineSimilarity,
    Rrf,
    Rerank,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub metadata: ChunkRecord,
    pub score: f32,
    pub score_kind: ScoreKind,
}

/// Caller-facing retrieval knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub kind: Option<SourceKind>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "default_true")]
    pub reranking: bool,
    #[serde(default = "default_true")]
    pub hybrid: bool,
    #[serde(default)]
    pub expansion: bool,
    /// Minimum similarity, only applied where the score kind supports it.
    #[serde(default)]
    pub min_similarity: Option<f32>,
}

fn default_k() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            k: default_k(),
            kind: None,
            domain: None,
            reranking: true,
            hybrid: true,
            expansion: false,
            min_similarity: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_policy_round_trip() {
        assert_eq!(RefreshPolicy::parse("never"), RefreshPolicy::Never);
        assert_eq!(RefreshPolicy::parse("days:14"), RefreshPolicy::Days(14));
        assert_eq!(RefreshPolicy::Days(7).as_str(), "days:7");
        assert_eq!(
            RefreshPolicy::parse(&RefreshPolicy::Days(30).as_str()),
            RefreshPolicy::Days(30)
        );
    }

    #[test]
    fn refresh_policy_defaults_by_kind() {
        assert_eq!(RefreshPolicy::for_kind(SourceKind::Video), RefreshPolicy::Never);
        assert_eq!(RefreshPolicy::for_kind(SourceKind::Repo), RefreshPolicy::Days(7));
        assert_eq!(
            RefreshPolicy::for_kind(SourceKind::DocSitePage),
            RefreshPolicy::Days(14)
        );
        assert_eq!(RefreshPolicy::for_kind(SourceKind::WebPage), RefreshPolicy::Days(30));
    }

    #[test]
    fn never_policy_has_no_deadline() {
        assert!(RefreshPolicy::Never.next_from(Utc::now()).is_none());
        let now = Utc::now();
        let next = RefreshPolicy::Days(7).next_from(now).unwrap();
        assert_eq!((next - now).num_days(), 7);
    }

    #[test]
    fn kind_and_status_string_round_trip() {
        for kind in [
            SourceKind::WebPage,
            SourceKind::DocSitePage,
            SourceKind::Repo,
            SourceKind::Video,
            SourceKind::VideoChannel,
        ] {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        for status in [EntryStatus::Pending, EntryStatus::Fetched, EntryStatus::Failed] {
            assert_eq!(EntryStatus::parse(status.as_str()), Some(status));
        }
    }
}
