//! Boundary-aware, length-bounded text chunker.
//!
//! Splits extracted document text into overlapping [`Chunk`]s of at most
//! `max_chars` characters. Within each window the chunk ends at the latest
//! boundary of the strongest kind available:
//!
//! 1. paragraph break (`\n\n`)
//! 2. sentence end (`.`, `!` or `?` followed by whitespace)
//! 3. line break
//! 4. whitespace
//!
//! Paragraph and sentence boundaries only count in the second half of the
//! window. With no boundary at all the chunk is cut hard at `max_chars`, so
//! a sentence longer than the window is split mid-sentence.
//!
//! The next chunk starts `overlap_chars` before the previous end, moved
//! forward to the start of a word. A chunk always ends past the end of its
//! predecessor, so no chunk is contained in the one before it. Chunk ids are `<source_id>#<index>`, so
//! re-chunking unchanged text reproduces the same ids.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{chunk_id, Chunk};

/// Split `text` into chunks with contiguous indices starting at 0.
///
/// Empty or whitespace-only text produces no chunks.
pub fn chunk_document(
    source_id: &str,
    filename: &str,
    text: &str,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let max_chars = config.max_chars.max(1);
    let overlap = config.overlap_chars.min(max_chars - 1);
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();

    let mut chunks = Vec::new();
    let mut start = skip_whitespace(&chars, 0, n);
    // Lowest acceptable end: each chunk must reach past the previous one.
    let mut floor = 0;

    while start < n {
        let hard_end = (start + max_chars).min(n);
        let end = if hard_end == n {
            n
        } else {
            find_break(&chars, start, hard_end, max_chars, floor)
        };

        let mut text_end = end;
        while text_end > start && chars[text_end - 1].is_whitespace() {
            text_end -= 1;
        }
        if text_end > start {
            let piece: String = chars[start..text_end].iter().collect();
            chunks.push(make_chunk(
                source_id,
                filename,
                chunks.len() as i64,
                start,
                piece,
            ));
        }

        if end >= n {
            break;
        }
        let resume = skip_whitespace(&chars, end, n);
        if resume >= n {
            break;
        }

        let mut next = end.saturating_sub(overlap);
        if next <= start {
            next = end;
        }
        // Never start an overlap in the middle of a word.
        while next < end && next > 0 && !chars[next - 1].is_whitespace() {
            next += 1;
        }
        start = skip_whitespace(&chars, next, n);
        if start + max_chars <= resume {
            start = resume;
        }
        floor = resume + 1;
    }

    chunks
}

fn skip_whitespace(chars: &[char], mut pos: usize, n: usize) -> usize {
    while pos < n && chars[pos].is_whitespace() {
        pos += 1;
    }
    pos
}

/// Pick the end (exclusive) of a chunk starting at `start` whose window ends
/// at `hard_end`, where `hard_end < chars.len()`. Only boundaries at or past
/// `floor` count, and `floor <= hard_end`.
fn find_break(
    chars: &[char],
    start: usize,
    hard_end: usize,
    max_chars: usize,
    floor: usize,
) -> usize {
    let weak_floor = (start + 1).max(floor);
    let strong_floor = (start + max_chars / 2).max(weak_floor);

    let is_paragraph = |b: usize| b >= 2 && chars[b - 1] == '\n' && chars[b - 2] == '\n';
    let is_sentence = |b: usize| {
        b >= 1 && matches!(chars[b - 1], '.' | '!' | '?') && chars[b].is_whitespace()
    };
    let is_line = |b: usize| b >= 1 && chars[b - 1] == '\n';
    let is_space = |b: usize| chars[b].is_whitespace() || chars[b - 1].is_whitespace();

    let search = |floor: usize, pred: &dyn Fn(usize) -> bool| -> Option<usize> {
        (floor..=hard_end).rev().find(|&b| pred(b))
    };

    search(strong_floor, &is_paragraph)
        .or_else(|| search(strong_floor, &is_sentence))
        .or_else(|| search(weak_floor, &is_line))
        .or_else(|| search(weak_floor, &is_space))
        .unwrap_or(hard_end)
}

fn make_chunk(
    source_id: &str,
    filename: &str,
    index: i64,
    char_offset: usize,
    text: String,
) -> Chunk {
    Chunk {
        chunk_id: chunk_id(source_id, index),
        source_id: source_id.to_string(),
        source_filename: filename.to_string(),
        sequence_index: index,
        char_offset: char_offset as i64,
        hash: hash_text(&text),
        text,
    }
}

/// SHA-256 of `text`, hex encoded.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_chars: usize, overlap_chars: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_chars,
            overlap_chars,
        }
    }

    fn slice_at(text: &str, chunk: &Chunk) -> String {
        text.chars()
            .skip(chunk.char_offset as usize)
            .take(chunk.text.chars().count())
            .collect()
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_document("doc1", "doc1.pdf", "Hello, world!", &cfg(300, 50));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, "doc1#0");
        assert_eq!(chunks[0].sequence_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].source_filename, "doc1.pdf");
    }

    #[test]
    fn test_empty_text_no_chunks() {
        assert!(chunk_document("doc1", "doc1.pdf", "", &cfg(300, 50)).is_empty());
        assert!(chunk_document("doc1", "doc1.pdf", "  \n\n\t ", &cfg(300, 50)).is_empty());
    }

    #[test]
    fn test_never_empty_and_bounded() {
        let text = "Lorem ipsum dolor sit amet. ".repeat(40);
        let chunks = chunk_document("d", "d.pdf", &text, &cfg(50, 10));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(!c.text.trim().is_empty());
            assert!(c.text.chars().count() <= 50, "chunk too long: {:?}", c.text);
        }
    }

    #[test]
    fn test_indices_contiguous_and_ids_derived() {
        let text = (0..50)
            .map(|i| format!("Sentence number {} is here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_document("reports/q1.pdf", "q1.pdf", &text, &cfg(60, 15));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i as i64);
            assert_eq!(c.chunk_id, format!("reports/q1.pdf#{}", i));
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta gamma. Delta epsilon zeta.\n\nEta theta iota. Kappa lambda mu.";
        let a = chunk_document("doc1", "doc1.pdf", text, &cfg(25, 8));
        let b = chunk_document("doc1", "doc1.pdf", text, &cfg(25, 8));
        assert_eq!(a, b);
    }

    #[test]
    fn test_char_offset_points_at_text() {
        let text = "Première phrase ici. Deuxième phrase là. Troisième phrase encore.";
        let chunks = chunk_document("d", "d.pdf", text, &cfg(30, 10));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert_eq!(slice_at(text, c), c.text);
        }
    }

    #[test]
    fn test_splits_at_sentence_end_when_available() {
        // The first sentence ends inside the window, past its midpoint.
        let text = "The reactor shuts down safely. Operators then log the event in the binder.";
        let chunks = chunk_document("d", "d.pdf", text, &cfg(40, 0));
        assert_eq!(chunks[0].text, "The reactor shuts down safely.");
        assert!(chunks[1].text.starts_with("Operators"));
    }

    #[test]
    fn test_long_sentence_split_mid_sentence_on_whitespace() {
        // One sentence, no terminator inside the window: split between words.
        let text = "this sentence has no full stop until the very end of it.";
        let chunks = chunk_document("d", "d.pdf", text, &cfg(20, 0));
        assert!(chunks.len() > 1);
        assert!(!chunks[0].text.ends_with('.'));
        for c in &chunks {
            assert!(!c.text.starts_with(' ') && !c.text.ends_with(' '));
        }
        let rejoined = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rejoined, text);
    }

    #[test]
    fn test_hard_cut_without_whitespace() {
        let text = "x".repeat(25);
        let chunks = chunk_document("d", "d.pdf", &text, &cfg(10, 0));
        let lens: Vec<usize> = chunks.iter().map(|c| c.text.len()).collect();
        assert_eq!(lens, vec![10, 10, 5]);
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let text = "First paragraph sentence one. Sentence two.\n\nSecond paragraph.";
        let chunks = chunk_document("d", "d.pdf", text, &cfg(55, 0));
        assert_eq!(
            chunks[0].text,
            "First paragraph sentence one. Sentence two."
        );
        assert_eq!(chunks[1].text, "Second paragraph.");
    }

    fn assert_each_chunk_advances(text: &str, chunks: &[Chunk]) {
        for pair in chunks.windows(2) {
            let end = |c: &Chunk| c.char_offset as usize + c.text.chars().count();
            assert!(
                end(&pair[1]) > end(&pair[0]),
                "{} is contained in {}",
                pair[1].chunk_id,
                pair[0].chunk_id
            );
            assert!(pair[1].char_offset > pair[0].char_offset);
        }
        for c in chunks {
            assert_eq!(slice_at(text, c), c.text);
        }
    }

    #[test]
    fn test_large_overlap_never_repeats_previous_break() {
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta eta theta.";
        let chunks = chunk_document("d", "d.pdf", text, &cfg(20, 12));
        assert_eq!(chunks[0].text, "Alpha beta gamma.");
        assert!(chunks.len() > 1);
        assert_each_chunk_advances(text, &chunks);
        assert!(chunks.last().unwrap().text.ends_with("theta."));
    }

    #[test]
    fn test_paragraph_followed_by_long_run_at_defaults() {
        let first = "word ".repeat(40);
        let text = format!("{}\n\n{}", first.trim_end(), "run ".repeat(120).trim_end());
        let chunks = chunk_document("d", "d.pdf", &text, &cfg(300, 50));
        assert_eq!(chunks[0].text, first.trim_end());
        assert_each_chunk_advances(&text, &chunks);
    }

    #[test]
    fn test_ends_strictly_increase_for_any_overlap() {
        let text = "Pump alpha.\n\nValve beta closes.\nGauge reads high\n\n\
                    Turbine gamma spins at nine thousand rpm without stopping at all";
        for max in [12, 20, 33] {
            for overlap in [0, max / 3, max / 2, max - 1] {
                let chunks = chunk_document("d", "d.pdf", text, &cfg(max, overlap));
                assert_each_chunk_advances(text, &chunks);
            }
        }
    }

    #[test]
    fn test_overlap_shares_text_with_previous_chunk() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let chunks = chunk_document("d", "d.pdf", text, &cfg(24, 10));
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let prev_end = pair[0].char_offset as usize + pair[0].text.chars().count();
            let next_start = pair[1].char_offset as usize;
            assert!(next_start > pair[0].char_offset as usize, "no progress");
            assert!(next_start <= prev_end, "gap between chunks");
            assert!(prev_end - next_start <= 10, "overlap larger than configured");
        }
    }
}
