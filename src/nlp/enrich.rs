//! LLM-backed metadata extraction per chunk.
//!
//! Strict JSON contract, soft failure: a timeout or malformed reply logs a
//! warning and yields empty metadata. Enrichment never fails an ingestion.

use serde::Deserialize;

use crate::core::types::{Difficulty, EnrichedMetadata};
use crate::nlp::llm::LlmClient;
use crate::nlp::prompts;

/// Cap on passage characters sent per enrichment call; chunks are bounded in
/// tokens but code-heavy text can still be long.
const MAX_INPUT_CHARS: usize = 6000;

pub struct Enricher {
    llm: LlmClient,
    model: String,
}

/// Tolerant deserialization target: difficulty arrives as a free string and
/// is mapped onto the enum afterwards.
#[derive(Deserialize, Default)]
struct RawEnrichment {
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    concepts: Vec<String>,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    frameworks: Vec<String>,
}

impl Enricher {
    pub fn new(llm: LlmClient, model: String) -> Enricher {
        Enricher { llm, model }
    }

    pub async fn enrich(&self, text: &str) -> EnrichedMetadata {
        let input: String = text.chars().take(MAX_INPUT_CHARS).collect();
        let prompt = prompts::render(prompts::ENRICH_V3, &input);

        let reply = match self
            .llm
            .complete(&self.model, "You extract structured metadata.", &prompt, 512)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("enrichment call failed, storing empty metadata: {}", e);
                return EnrichedMetadata::default();
            }
        };

        parse_enrichment(&reply)
    }
}

pub fn parse_enrichment(reply: &str) -> EnrichedMetadata {
    let Some(json) = prompts::extract_json(reply) else {
        tracing::warn!("enrichment reply had no JSON, storing empty metadata");
        return EnrichedMetadata::default();
    };
    match serde_json::from_str::<RawEnrichment>(json) {
        Ok(raw) => EnrichedMetadata {
            topics: raw.topics,
            keywords: raw.keywords,
            summary: raw.summary,
            concepts: raw.concepts,
            difficulty: raw
                .difficulty
                .as_deref()
                .and_then(|d| Difficulty::parse(&d.to_lowercase())),
            languages: raw.languages,
            frameworks: raw.frameworks,
        },
        Err(e) => {
            tracing::warn!("enrichment JSON invalid ({}), storing empty metadata", e);
            EnrichedMetadata::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_reply() {
        let reply = r#"{"topics":["auth"],"keywords":["oauth","token"],"summary":"About OAuth.",
                        "concepts":["authorization code flow"],"difficulty":"Intermediate",
                        "languages":["rust"],"frameworks":["axum"]}"#;
        let meta = parse_enrichment(reply);
        assert_eq!(meta.topics, vec!["auth"]);
        assert_eq!(meta.difficulty, Some(Difficulty::Intermediate));
        assert_eq!(meta.frameworks, vec!["axum"]);
    }

    #[test]
    fn partial_reply_fills_missing_fields_with_defaults() {
        let meta = parse_enrichment(r#"{"topics":["x"]}"#);
        assert_eq!(meta.topics, vec!["x"]);
        assert!(meta.keywords.is_empty());
        assert!(meta.difficulty.is_none());
    }

    #[test]
    fn garbage_reply_degrades_to_empty_metadata() {
        let meta = parse_enrichment("I could not process this passage, sorry!");
        assert!(meta.topics.is_empty());
        assert!(meta.summary.is_empty());

        let meta = parse_enrichment(r#"{"topics": "not-an-array"}"#);
        assert!(meta.topics.is_empty());
    }

    #[test]
    fn unknown_difficulty_becomes_none() {
        let meta = parse_enrichment(r#"{"difficulty":"wizard"}"#);
        assert!(meta.difficulty.is_none());
    }
}
