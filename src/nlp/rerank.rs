//! Cross-encoder seam for the retrieval pipeline's rerank stage.
//!
//! The contract is joint (query, passage) → relevance score, descending sort.
//! The default implementation is a lexical coverage scorer; a neural
//! cross-encoder drops in behind the same trait. When scoring fails the
//! caller keeps the pre-rerank order.

use std::cmp::Ordering;
use std::collections::HashMap;

pub trait Reranker: Send + Sync {
    /// Relevance of `text` to `query`, higher is better, roughly [0, 1].
    fn score(&self, query: &str, text: &str) -> f32;
}

/// Score, sort descending, truncate. Ties keep the incoming order, which
/// callers arrange to be the semantic rank.
pub fn rerank_by<T>(
    reranker: &dyn Reranker,
    query: &str,
    items: Vec<(T, String)>,
    top_n: usize,
) -> Vec<(T, f32)> {
    let mut scored: Vec<(T, f32)> = items
        .into_iter()
        .map(|(item, text)| {
            let s = reranker.score(query, &text);
            (item, s)
        })
        .collect();
    scored.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    scored.truncate(top_n);
    scored
}

/// Term-frequency saturation constant: the second and third occurrence of a
/// query term in a passage add progressively less evidence.
const TF_SATURATION: f32 = 1.5;

/// Share of the score reserved for phrase evidence (query bigrams found
/// intact in the passage).
const ADJACENCY_SHARE: f32 = 0.25;

/// Lexical coverage scorer.
///
/// Per distinct query term, the passage earns `tf / (tf + k)` — a saturating
/// term-frequency credit — and the mean over query terms gives base coverage.
/// Passages that also preserve the query's word order (bigram hits) earn the
/// adjacency share on top, so "access token" beats a passage that merely
/// mentions both words far apart.
pub struct LexicalReranker;

fn terms(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.len() >= 2)
        .collect()
}

impl Reranker for LexicalReranker {
    fn score(&self, query: &str, text: &str) -> f32 {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return 0.0;
        }
        let passage_terms = terms(text);

        let mut tf: HashMap<&str, f32> = HashMap::new();
        for t in &passage_terms {
            *tf.entry(t.as_str()).or_insert(0.0) += 1.0;
        }

        let mut distinct: Vec<&str> = query_terms.iter().map(String::as_str).collect();
        distinct.sort_unstable();
        distinct.dedup();

        let coverage: f32 = distinct
            .iter()
            .map(|t| {
                let f = tf.get(t).copied().unwrap_or(0.0);
                f / (f + TF_SATURATION)
            })
            .sum::<f32>()
            / distinct.len() as f32;

        let adjacency = if query_terms.len() < 2 {
            0.0
        } else {
            let passage_pairs: std::collections::HashSet<(&str, &str)> = passage_terms
                .windows(2)
                .map(|w| (w[0].as_str(), w[1].as_str()))
                .collect();
            let query_pairs: Vec<(&str, &str)> = query_terms
                .windows(2)
                .map(|w| (w[0].as_str(), w[1].as_str()))
                .collect();
            let hits = query_pairs
                .iter()
                .filter(|p| passage_pairs.contains(*p))
                .count();
            hits as f32 / query_pairs.len() as f32
        };

        (coverage * (1.0 - ADJACENCY_SHARE) + adjacency * ADJACENCY_SHARE).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terms_trim_punctuation_and_keep_hyphenated_words() {
        let t = terms("Run `cargo build` first; a token-based flow follows.");
        assert!(t.contains(&"cargo".to_string()));
        assert!(t.contains(&"token-based".to_string()));
        assert!(t.contains(&"follows".to_string()));
        assert!(!t.contains(&"a".to_string()));
    }

    #[test]
    fn relevant_passage_outranks_unrelated_one() {
        let reranker = LexicalReranker;
        let items = vec![
            ("unrelated", "Seasonal planting schedules for raised garden beds".to_string()),
            ("relevant", "Async runtime tuning notes for the tokio scheduler".to_string()),
        ];
        let ranked = rerank_by(&reranker, "tokio async runtime", items, 2);
        assert_eq!(ranked[0].0, "relevant");
        assert!(ranked[0].1 > ranked[1].1);
    }

    #[test]
    fn intact_phrase_beats_scattered_terms() {
        let reranker = LexicalReranker;
        let phrase = "Rotate the access token before it expires.";
        let scattered = "Access to the vault requires a hardware token and a badge.";
        let a = reranker.score("access token", phrase);
        let b = reranker.score("access token", scattered);
        assert!(a > b, "phrase {a} should beat scattered {b}");
    }

    #[test]
    fn repeated_term_credit_saturates() {
        let reranker = LexicalReranker;
        let once = reranker.score("cache", "the cache layer");
        let thrice = reranker.score("cache", "cache cache cache layer");
        assert!(thrice > once);
        // Tripling the mentions must not triple the score.
        assert!(thrice < once * 2.0);
    }

    #[test]
    fn top_n_truncates() {
        let reranker = LexicalReranker;
        let items = (0..10)
            .map(|i| (i, format!("passage number {i}")))
            .collect::<Vec<_>>();
        assert_eq!(rerank_by(&reranker, "passage", items, 3).len(), 3);
    }

    #[test]
    fn empty_query_scores_zero() {
        let reranker = LexicalReranker;
        assert_eq!(reranker.score("", "anything at all"), 0.0);
        assert_eq!(reranker.score("!!", "anything at all"), 0.0);
    }
}
