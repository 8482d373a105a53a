//! Kind-aware text segmentation.
//!
//! Markdown splits on heading boundaries, then paragraphs, then sentences;
//! repo trees split on file boundaries, then blank-line blocks; transcripts
//! aggregate timestamped segments. Units are greedily packed into chunks of
//! `min..=max` whitespace tokens with a fixed-token overlap between
//! consecutive chunks, so stripping the overlap prefix from every chunk after
//! the first reproduces the source text up to whitespace normalization.

use sha2::{Digest, Sha256};

use crate::core::types::{FetchedDocument, SourceKind};

/// Marker the repo fetcher writes before each file's content. The chunker
/// treats it as a hard boundary: chunks never span two files.
pub const REPO_FILE_MARKER: &str = "--- FILE: ";

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig {
            min_tokens: 100,
            max_tokens: 512,
            overlap_tokens: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub text: String,
    /// Transcript offset of the first fresh segment, video chunks only.
    pub start_time_secs: Option<f64>,
}

/// Whitespace-normalized SHA-256 of document text; the change-detection
/// validator of last resort.
pub fn content_hash(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

fn token_count(s: &str) -> usize {
    s.split_whitespace().count()
}

#[derive(Debug, Clone)]
struct Unit {
    text: String,
    tokens: usize,
    time: Option<f64>,
    /// Prefer a chunk boundary right before this unit (heading sections).
    hard_start: bool,
}

impl Unit {
    fn plain(text: &str) -> Unit {
        Unit {
            tokens: token_count(text),
            text: text.to_string(),
            time: None,
            hard_start: false,
        }
    }

}

pub struct Chunker {
    cfg: ChunkerConfig,
}

impl Chunker {
    pub fn new(cfg: ChunkerConfig) -> Chunker {
        Chunker { cfg }
    }

    pub fn chunk(&self, doc: &FetchedDocument) -> Vec<TextChunk> {
        match doc.kind {
            SourceKind::Repo => self.chunk_repo(&doc.text),
            SourceKind::Video | SourceKind::VideoChannel => self.chunk_transcript(&doc.text),
            SourceKind::WebPage | SourceKind::DocSitePage => self.chunk_markdown(&doc.text),
        }
    }

    pub fn chunk_markdown(&self, text: &str) -> Vec<TextChunk> {
        self.pack(self.markdown_units(text))
    }

    /// File boundaries are hard: each file is packed independently so every
    /// file yields at least one chunk headed by its path marker.
    pub fn chunk_repo(&self, text: &str) -> Vec<TextChunk> {
        let mut out = Vec::new();
        for file_block in split_on_file_markers(text) {
            let units = self.block_units(&file_block);
            out.extend(self.pack(units));
        }
        out
    }

    /// Lines of the form `[12.3] spoken text`. Segments aggregate until the
    /// minimum size; the first fresh segment's offset is carried on the chunk.
    pub fn chunk_transcript(&self, text: &str) -> Vec<TextChunk> {
        let mut units = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (time, spoken) = parse_timestamped(line);
            if spoken.is_empty() {
                continue;
            }
            units.push(Unit {
                tokens: token_count(spoken),
                text: spoken.to_string(),
                time,
                hard_start: false,
            });
        }
        self.pack(units)
    }

    // -- unit construction ---------------------------------------------------

    fn markdown_units(&self, text: &str) -> Vec<Unit> {
        let mut units = Vec::new();
        for section in split_sections(text) {
            let section_first = units.len();
            if token_count(&section) <= self.cfg.max_tokens {
                if !section.trim().is_empty() {
                    units.push(Unit::plain(section.trim()));
                }
            } else {
                for para in section.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
                    if token_count(para) <= self.cfg.max_tokens {
                        units.push(Unit::plain(para));
                    } else {
                        // Oversized paragraph: sentence granularity; a sentence
                        // still above max is window-split during packing.
                        for sentence in split_sentences(para) {
                            units.push(Unit::plain(&sentence));
                        }
                    }
                }
            }
            if let Some(first) = units.get_mut(section_first) {
                first.hard_start = true;
            }
        }
        units
    }

    fn block_units(&self, text: &str) -> Vec<Unit> {
        if token_count(text) <= self.cfg.max_tokens {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Vec::new();
            }
            return vec![Unit::plain(trimmed)];
        }
        text.split("\n\n")
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(Unit::plain)
            .collect()
    }

    // -- packing -------------------------------------------------------------

    fn pack(&self, units: Vec<Unit>) -> Vec<TextChunk> {
        let max = self.cfg.max_tokens;
        let overlap = self.cfg.overlap_tokens;
        // Oversized units become windows small enough that the overlap prefix
        // never pushes a chunk past max.
        let window = max.saturating_sub(overlap).max(1);

        let mut flat: Vec<Unit> = Vec::new();
        for unit in units {
            if unit.tokens > max {
                let tokens: Vec<&str> = unit.text.split_whitespace().collect();
                let mut first = true;
                for piece in tokens.chunks(window) {
                    flat.push(Unit {
                        text: piece.join(" "),
                        tokens: piece.len(),
                        time: unit.time,
                        hard_start: unit.hard_start && first,
                    });
                    first = false;
                }
            } else {
                flat.push(unit);
            }
        }

        let mut chunks: Vec<TextChunk> = Vec::new();
        let mut parts: Vec<String> = Vec::new();
        let mut total_tokens = 0usize;
        let mut fresh = 0usize;
        let mut time: Option<f64> = None;

        for unit in flat {
            let section_break = unit.hard_start && fresh >= self.cfg.min_tokens;
            if fresh > 0 && (total_tokens + unit.tokens > max || section_break) {
                let text = parts.join("\n\n");
                let prefix = overlap_suffix(&text, overlap);
                chunks.push(TextChunk {
                    text,
                    start_time_secs: time,
                });
                parts = vec![prefix.clone()];
                total_tokens = token_count(&prefix);
                fresh = 0;
                time = None;
            }
            if time.is_none() {
                time = unit.time;
            }
            total_tokens += unit.tokens;
            fresh += unit.tokens;
            parts.push(unit.text);
        }
        if fresh > 0 {
            chunks.push(TextChunk {
                text: parts.join("\n\n"),
                start_time_secs: time,
            });
        }

        chunks
    }
}

/// Last `overlap` whitespace tokens of `text`, joined with single spaces.
fn overlap_suffix(text: &str, overlap: usize) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let start = tokens.len().saturating_sub(overlap);
    tokens[start..].join(" ")
}

/// Remove the duplicated overlap prefix a chunk inherited from `prev`.
fn strip_overlap_prefix(text: &str, prev: &str, overlap: usize) -> String {
    let prefix_len = token_count(prev).min(overlap);
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() <= prefix_len {
        return String::new();
    }
    tokens[prefix_len..].join(" ")
}

/// Split markdown into sections at `#`/`##`/`###` heading lines; the heading
/// stays with its section body.
fn split_sections(text: &str) -> Vec<String> {
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        let is_heading = {
            let hashes = trimmed.chars().take_while(|c| *c == '#').count();
            (1..=3).contains(&hashes)
                && trimmed.chars().nth(hashes).map(|c| c == ' ').unwrap_or(false)
        };
        if is_heading && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

/// Sentence boundaries: terminal punctuation followed by whitespace. The
/// splitter never produces empty sentences.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') && chars.peek().map(|n| n.is_whitespace()).unwrap_or(true) {
            let s = current.trim().to_string();
            if !s.is_empty() {
                sentences.push(s);
            }
            current.clear();
        }
    }
    let s = current.trim().to_string();
    if !s.is_empty() {
        sentences.push(s);
    }
    sentences
}

fn split_on_file_markers(text: &str) -> Vec<String> {
    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.starts_with(REPO_FILE_MARKER) && !current.trim().is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        blocks.push(current);
    }
    blocks
}

fn parse_timestamped(line: &str) -> (Option<f64>, &str) {
    if let Some(rest) = line.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            if let Ok(secs) = rest[..close].trim().parse::<f64>() {
                return (Some(secs), rest[close + 1..].trim_start());
            }
        }
    }
    (None, line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ChunkerConfig {
        ChunkerConfig::default()
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    /// Strip each chunk's inherited overlap and compare against the original,
    /// whitespace-normalized.
    fn assert_reconstructs(chunks: &[TextChunk], original: &str, overlap: usize) {
        let mut rebuilt: Vec<String> = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                rebuilt.push(chunk.text.split_whitespace().collect::<Vec<_>>().join(" "));
            } else {
                rebuilt.push(strip_overlap_prefix(&chunk.text, &chunks[i - 1].text, overlap));
            }
        }
        let rebuilt = rebuilt.join(" ");
        let normalized: String = original.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(rebuilt, normalized);
    }

    #[test]
    fn single_paragraph_is_one_chunk() {
        let chunker = Chunker::new(cfg());
        let chunks = chunker.chunk_markdown("Hello world. See more below.");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("Hello world."));
    }

    #[test]
    fn ninety_nine_tokens_stay_one_chunk() {
        let chunker = Chunker::new(cfg());
        let text = words(99);
        let chunks = chunker.chunk_markdown(&text);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn five_hundred_thirteen_tokens_split_with_overlap() {
        let chunker = Chunker::new(cfg());
        let text = words(513);
        let chunks = chunker.chunk_markdown(&text);
        assert!(chunks.len() >= 2, "513 tokens must split, got {}", chunks.len());
        for c in &chunks {
            assert!(token_count(&c.text) <= 512, "chunk exceeds max: {}", token_count(&c.text));
        }
        // Second chunk begins with the previous chunk's tail.
        let tail = overlap_suffix(&chunks[0].text, 50);
        assert!(chunks[1].text.starts_with(&tail));
        assert_reconstructs(&chunks, &text, 50);
    }

    #[test]
    fn heading_sections_pack_and_reconstruct() {
        let chunker = Chunker::new(cfg());
        let text = format!(
            "# Intro\n\n{}\n\n## Details\n\n{}\n\n### Edge cases\n\n{}",
            words(200),
            words(300),
            words(250)
        );
        let chunks = chunker.chunk_markdown(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(token_count(&c.text) <= 512);
        }
        assert_reconstructs(&chunks, &text, 50);
    }

    #[test]
    fn oversized_sentence_is_window_split_not_dropped() {
        let chunker = Chunker::new(cfg());
        // One "sentence" with no terminal punctuation, far beyond max.
        let text = words(1200);
        let chunks = chunker.chunk_markdown(&text);
        assert!(chunks.len() >= 3);
        assert_reconstructs(&chunks, &text, 50);
    }

    #[test]
    fn repo_files_never_share_a_chunk() {
        let chunker = Chunker::new(cfg());
        let text = format!(
            "{}src/lib.rs ---\n{}\n{}src/main.rs ---\n{}\n",
            REPO_FILE_MARKER,
            words(120),
            REPO_FILE_MARKER,
            words(130)
        );
        let chunks = chunker.chunk_repo(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.contains("src/lib.rs"));
        assert!(chunks[1].text.contains("src/main.rs"));
        assert!(!chunks[1].text.contains("src/lib.rs"));
    }

    #[test]
    fn transcript_segments_aggregate_and_keep_first_timestamp() {
        let chunker = Chunker::new(ChunkerConfig {
            min_tokens: 10,
            max_tokens: 40,
            overlap_tokens: 5,
        });
        let mut lines = Vec::new();
        for i in 0..20 {
            lines.push(format!("[{}.0] segment {} has exactly five words", i * 10, i));
        }
        let text = lines.join("\n");
        let chunks = chunker.chunk_transcript(&text);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start_time_secs, Some(0.0));
        // Later chunks carry the offset of their first fresh segment.
        assert!(chunks[1].start_time_secs.unwrap() > 0.0);
    }

    #[test]
    fn small_trailing_paragraph_merges_forward_when_it_fits() {
        let chunker = Chunker::new(cfg());
        // 480 + 25 = 505 <= max: greedy packing keeps them together.
        let text = format!("{}\n\n{}", words(480), words(25));
        let chunks = chunker.chunk_markdown(&text);
        assert_eq!(chunks.len(), 1);
        assert_eq!(token_count(&chunks[0].text), 505);
    }

    #[test]
    fn trailing_remainder_splits_when_merging_would_exceed_max() {
        let chunker = Chunker::new(cfg());
        let text = format!("{}\n\n{}", words(510), words(20));
        let chunks = chunker.chunk_markdown(&text);
        assert_eq!(chunks.len(), 2);
        assert!(token_count(&chunks[0].text) <= 512);
        assert_reconstructs(&chunks, &text, 50);
    }

    #[test]
    fn content_hash_ignores_whitespace_shape() {
        assert_eq!(content_hash("a  b\nc"), content_hash("a b c"));
        assert_ne!(content_hash("a b c"), content_hash("a b d"));
    }
}
