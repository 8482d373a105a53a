//! Versioned prompt templates with JSON parse contracts.
//!
//! Prompts are string resources, not inline literals: the version suffix
//! changes whenever the wording or output schema changes, so behavior shifts
//! are visible in diffs. Every response is JSON and validated by the caller;
//! invalid output degrades (empty metadata, literal-query fallback), never
//! propagates.

/// Prompt → list of web-search queries. Output contract: JSON array of
/// strings. The instruction asks for source-type diversity so the result mix
/// spans docs, repos, and videos.
pub const QUERY_SYNTHESIS_V2: &str = "\
You generate web search queries for building a technical knowledge base.
Given the research topic below, produce 3 to 6 search queries that together \
cover: official documentation, source code repositories, and video tutorials \
or conference talks. Vary the phrasing; avoid near-duplicates.
Respond with a JSON array of strings and nothing else.

Topic: {input}";

/// Chunk text → topical metadata. Output contract: one JSON object with the
/// exact keys listed; missing keys default to empty.
pub const ENRICH_V3: &str = "\
Extract metadata from the passage below. Respond with a single JSON object \
and nothing else, using exactly these keys:
  \"topics\": array of 1-5 short topic strings
  \"keywords\": array of 3-10 keywords
  \"summary\": one sentence
  \"concepts\": array of technical concepts mentioned
  \"difficulty\": one of \"beginner\", \"intermediate\", \"advanced\"
  \"languages\": programming languages mentioned
  \"frameworks\": libraries or frameworks mentioned

Passage:
{input}";

/// Short query → expanded query phrase. Output contract: JSON object with an
/// \"expanded\" string key.
pub const QUERY_EXPANSION_V1: &str = "\
Expand the search query below with synonyms and closely related technical \
terms, as a single search phrase. Keep it under 25 words. Respond with JSON: \
{\"expanded\": \"...\"} and nothing else.

Query: {input}";

/// Entities → competing/alternative technologies. Output contract: JSON
/// array of strings (names only).
pub const COMPETITOR_V1: &str = "\
List up to 4 technologies that compete with or are common alternatives to \
the subject below. Respond with a JSON array of name strings and nothing \
else. If the subject is not a technology, respond with [].

Subject: {input}";

/// Substitute `{input}` in a template. Single placeholder by design — the
/// contracts above all take one input blob.
pub fn render(template: &str, input: &str) -> String {
    template.replace("{input}", input)
}

/// Pull the first JSON value out of an LLM reply, tolerating ```json fences
/// and leading chatter. Returns the raw slice for serde to parse.
pub fn extract_json(reply: &str) -> Option<&str> {
    let trimmed = reply.trim();
    // Fenced block first.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }
    // Otherwise the outermost bracket/brace span.
    let open = trimmed.find(|c| c == '{' || c == '[')?;
    let close_char = if trimmed.as_bytes()[open] == b'{' { '}' } else { ']' };
    let close = trimmed.rfind(close_char)?;
    if close > open {
        Some(trimmed[open..=close].trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_input() {
        let rendered = render(QUERY_SYNTHESIS_V2, "rust async runtimes");
        assert!(rendered.contains("Topic: rust async runtimes"));
        assert!(!rendered.contains("{input}"));
    }

    #[test]
    fn extract_json_handles_fences_and_chatter() {
        assert_eq!(extract_json("[\"a\", \"b\"]"), Some("[\"a\", \"b\"]"));
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"expanded\": \"x\"}\n```"),
            Some("{\"expanded\": \"x\"}")
        );
        assert_eq!(
            extract_json("Sure! The answer is {\"topics\": []} — enjoy."),
            Some("{\"topics\": []}")
        );
        assert_eq!(extract_json("no json here"), None);
    }
}
