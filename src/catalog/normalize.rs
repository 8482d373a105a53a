//! URL normalization, stable hashing, and source-kind detection.
//!
//! Normalization is the deduplication authority for the whole engine: two
//! URLs with identical normalized forms must hash identically, so every
//! insert path funnels through [`normalize_url`] before touching the catalog.

use anyhow::{anyhow, Result};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use url::Url;

use crate::core::types::SourceKind;

/// Tracking-parameter keys stripped during normalization. Config may extend
/// this list; these defaults are always applied.
pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "utm_id",
    "ref",
    "ref_src",
    "fbclid",
    "gclid",
    "mc_cid",
    "mc_eid",
    "igshid",
];

pub fn normalize_url(raw: &str) -> Result<String> {
    normalize_url_with(raw, &[])
}

/// Canonicalize a URL: lowercase scheme/host, strip default ports, drop the
/// fragment and tracking params, collapse repeated slashes, normalize
/// percent-escapes, and trim the trailing slash (except at root).
pub fn normalize_url_with(raw: &str, extra_tracking_params: &[String]) -> Result<String> {
    let trimmed = raw.trim();
    let mut parsed =
        Url::parse(trimmed).map_err(|e| anyhow!("unparseable url '{}': {}", trimmed, e))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(anyhow!("unsupported scheme '{}'", parsed.scheme()));
    }
    if parsed.host_str().is_none() {
        return Err(anyhow!("url without host: '{}'", trimmed));
    }

    // `Url::parse` already lowercases scheme+host and drops default ports.
    parsed.set_fragment(None);

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !DEFAULT_TRACKING_PARAMS.contains(&k.as_str())
                && !extra_tracking_params.iter().any(|p| p.eq_ignore_ascii_case(&k))
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let mut qp = parsed.query_pairs_mut();
        qp.clear();
        for (k, v) in &kept {
            qp.append_pair(k, v);
        }
        drop(qp);
    }

    let path = normalize_path(parsed.path());
    parsed.set_path(&path);

    // `Url` always renders a bare authority with the root "/"; deeper paths
    // had their trailing slash removed above.
    Ok(parsed.to_string())
}

/// Collapse `//` runs, drop the trailing slash (except at root), and apply
/// RFC 3986 percent-escape normalization to each path segment: escapes
/// decoding to unreserved ASCII are decoded, all other escapes are kept with
/// uppercase hex.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<String> = Vec::new();
    for seg in path.split('/') {
        if seg.is_empty() {
            continue; // collapses repeated slashes
        }
        segments.push(normalize_segment(seg));
    }
    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    out
}

fn normalize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    let bytes = seg.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let escape = &seg[i..i + 3];
            match percent_decode_str(escape).decode_utf8().ok().and_then(|d| {
                let c = d.chars().next()?;
                is_unreserved(c).then_some(c)
            }) {
                Some(c) => out.push(c),
                None => out.push_str(&escape.to_ascii_uppercase()),
            }
            i += 3;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    out
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

/// Stable 64-bit identity for a normalized URL: first 16 hex chars of its
/// SHA-256. Survives process restarts, unlike the stdlib hasher.
pub fn url_hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}

pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Kind detection
// ---------------------------------------------------------------------------

const VIDEO_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "m.youtube.com"];
const VIDEO_SHORT_HOSTS: &[&str] = &["youtu.be"];
const REPO_HOSTS: &[&str] = &["github.com", "gitlab.com", "codeberg.org", "bitbucket.org"];

/// Host labels / label-prefixes and path segments that mark a documentation
/// or article-style page worth crawling to completeness.
const DOC_HOST_LABELS: &[&str] = &["docs", "doc", "documentation", "wiki", "confluence"];
const DOC_HOST_SUFFIXES: &[&str] = &["readthedocs.io", "gitbook.io", "readme.io", "notion.site"];
const DOC_PATH_SEGMENTS: &[&str] = &[
    "docs", "doc", "documentation", "wiki", "tutorial", "guide", "learn", "blog", "article",
    "post", "news",
];

/// Classify a normalized URL per the catalog's kind taxonomy.
pub fn detect_kind(normalized: &str) -> SourceKind {
    let Ok(parsed) = Url::parse(normalized) else {
        return SourceKind::WebPage;
    };
    let host = parsed.host_str().unwrap_or_default();
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    if VIDEO_SHORT_HOSTS.contains(&host) {
        // youtu.be/<id> is always a single video.
        if !segments.is_empty() {
            return SourceKind::Video;
        }
    }
    if VIDEO_HOSTS.contains(&host) {
        match segments.first().copied() {
            Some("watch") | Some("shorts") | Some("embed") => return SourceKind::Video,
            Some("channel") | Some("c") | Some("user") => return SourceKind::VideoChannel,
            Some(seg) if seg.starts_with('@') => return SourceKind::VideoChannel,
            _ => {}
        }
    }

    if REPO_HOSTS.contains(&host) && segments.len() == 2 {
        let owner = segments[0];
        let reserved = ["orgs", "topics", "search", "settings", "marketplace", "explore"];
        if !reserved.contains(&owner) {
            return SourceKind::Repo;
        }
    }

    if is_doc_site(&parsed) {
        SourceKind::DocSitePage
    } else {
        SourceKind::WebPage
    }
}

fn is_doc_site(parsed: &Url) -> bool {
    let host = parsed.host_str().unwrap_or_default();
    for label in host.split('.') {
        if DOC_HOST_LABELS
            .iter()
            .any(|d| label == *d || label.starts_with(&format!("{d}-")))
        {
            return true;
        }
    }
    if DOC_HOST_SUFFIXES
        .iter()
        .any(|s| host == *s || host.ends_with(&format!(".{s}")))
    {
        return true;
    }
    let path = parsed.path().to_ascii_lowercase();
    path.split('/')
        .any(|seg| DOC_PATH_SEGMENTS.iter().any(|d| seg.contains(d)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_scheme_and_host() {
        assert_eq!(
            normalize_url("HTTP://EXAMPLE.ORG/a/").unwrap(),
            "http://example.org/a"
        );
    }

    #[test]
    fn normalization_equivalent_pair_hashes_identically() {
        let a = normalize_url("HTTP://EXAMPLE.ORG/a/").unwrap();
        let b = normalize_url("http://example.org/a").unwrap();
        assert_eq!(a, b);
        assert_eq!(url_hash(&a), url_hash(&b));
    }

    #[test]
    fn strips_default_port_fragment_and_tracking() {
        assert_eq!(
            normalize_url("https://example.org:443/docs/intro?utm_source=x#top").unwrap(),
            "https://example.org/docs/intro"
        );
        // Non-tracking params survive.
        assert_eq!(
            normalize_url("https://example.org/p?page=2&utm_medium=mail").unwrap(),
            "https://example.org/p?page=2"
        );
    }

    #[test]
    fn collapses_repeated_slashes_keeps_root_slash() {
        assert_eq!(
            normalize_url("https://example.org//a///b/").unwrap(),
            "https://example.org/a/b"
        );
        assert_eq!(normalize_url("https://example.org").unwrap(), "https://example.org/");
        assert_eq!(normalize_url("https://example.org/").unwrap(), "https://example.org/");
    }

    #[test]
    fn percent_escape_normalization() {
        // %7E decodes to unreserved '~'; %2F must stay escaped, hex uppercased.
        assert_eq!(
            normalize_url("https://example.org/%7euser/a%2fb").unwrap(),
            "https://example.org/~user/a%2Fb"
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(normalize_url("ftp://example.org/x").is_err());
        assert!(normalize_url("mailto:a@b.c").is_err());
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn hash_is_stable_hex() {
        let h = url_hash("https://example.org/a");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, url_hash("https://example.org/a"));
    }

    #[test]
    fn detects_video_and_channel_kinds() {
        let cases = [
            ("https://www.youtube.com/watch?v=abc123", SourceKind::Video),
            ("https://youtu.be/abc123", SourceKind::Video),
            ("https://www.youtube.com/shorts/abc123", SourceKind::Video),
            ("https://www.youtube.com/@somecreator", SourceKind::VideoChannel),
            ("https://www.youtube.com/channel/UCabc", SourceKind::VideoChannel),
            ("https://www.youtube.com/user/someone", SourceKind::VideoChannel),
        ];
        for (url, want) in cases {
            assert_eq!(detect_kind(&normalize_url(url).unwrap()), want, "{url}");
        }
    }

    #[test]
    fn detects_repo_kind_for_owner_repo_shape() {
        assert_eq!(
            detect_kind("https://github.com/tokio-rs/tokio"),
            SourceKind::Repo
        );
        assert_eq!(
            detect_kind("https://gitlab.com/group/project"),
            SourceKind::Repo
        );
        // Deeper paths are ordinary pages, reserved owners are not repos.
        assert_eq!(
            detect_kind("https://github.com/tokio-rs/tokio/issues/1"),
            SourceKind::WebPage
        );
        assert_eq!(detect_kind("https://github.com/orgs/tokio-rs"), SourceKind::WebPage);
    }

    #[test]
    fn doc_site_promotion() {
        assert_eq!(
            detect_kind("https://docs.example.com/intro"),
            SourceKind::DocSitePage
        );
        assert_eq!(
            detect_kind("https://example.org/docs/intro"),
            SourceKind::DocSitePage
        );
        assert_eq!(
            detect_kind("https://myproject.readthedocs.io/en/latest"),
            SourceKind::DocSitePage
        );
        assert_eq!(
            detect_kind("https://example.org/blog/why-rust"),
            SourceKind::DocSitePage
        );
        assert_eq!(detect_kind("https://example.org/pricing"), SourceKind::WebPage);
    }
}
