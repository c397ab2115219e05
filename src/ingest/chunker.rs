//! Token-bounded text chunking with overlap.
//!
//! Chunks are contiguous, 0-indexed slices of the source text: each chunk
//! holds at most `target_tokens` tokens (a single oversized word still forms
//! a chunk), and consecutive chunks share roughly `overlap_tokens` of
//! trailing context. Token counts come from the cl100k_base BPE.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("embedded cl100k_base vocabulary"))
}

/// Count BPE tokens in a text.
#[must_use]
pub fn count_tokens(text: &str) -> usize {
    bpe().encode_ordinary(text).len()
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkerConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 400,
            overlap_tokens: 40,
        }
    }
}

/// One chunk of source text with its character span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub content: String,
    pub token_count: usize,
    pub start_char: usize,
    pub end_char: usize,
}

/// A whitespace-delimited word with its char span and token cost.
#[derive(Clone, Debug)]
struct Word {
    start: usize,
    end: usize,
    tokens: usize,
}

fn words_of(text: &str) -> Vec<Word> {
    let chars: Vec<char> = text.chars().collect();
    let mut words = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }
        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        words.push(Word {
            start,
            end: i,
            tokens: count_tokens(&word).max(1),
        });
    }
    words
}

/// Split `text` into overlapping token-bounded chunks.
///
/// Returns an empty vector for whitespace-only input; callers treat that as
/// a parse failure upstream.
#[must_use]
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<TextChunk> {
    let words = words_of(text);
    if words.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    let overlap = config.overlap_tokens.min(config.target_tokens.saturating_sub(1));

    let mut chunks = Vec::new();
    let mut cursor = 0usize;
    while cursor < words.len() {
        let mut end = cursor;
        let mut tokens = 0usize;
        while end < words.len() {
            let next = tokens + words[end].tokens;
            if end > cursor && next > config.target_tokens {
                break;
            }
            tokens = next;
            end += 1;
        }

        let start_char = words[cursor].start;
        let end_char = words[end - 1].end;
        let content: String = chars[start_char..end_char].iter().collect();
        chunks.push(TextChunk {
            index: chunks.len(),
            content,
            token_count: tokens,
            start_char,
            end_char,
        });

        if end >= words.len() {
            break;
        }

        // Walk back far enough to carry ~overlap tokens into the next chunk,
        // always advancing by at least one word.
        let mut back = end;
        let mut carried = 0usize;
        while back > cursor + 1 && carried + words[back - 1].tokens <= overlap {
            carried += words[back - 1].tokens;
            back -= 1;
        }
        cursor = back.max(cursor + 1);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_short_text_is_one_chunk() {
        let config = ChunkerConfig::default();
        let chunks = chunk_text("The capital of France is Paris.", &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].start_char, 0);
        assert!(chunks[0].token_count > 0);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("  \n\t ", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn long_text_splits_with_overlap() {
        let text = (0..300)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let config = ChunkerConfig {
            target_tokens: 50,
            overlap_tokens: 10,
        };
        let chunks = chunk_text(&text, &config);
        assert!(chunks.len() > 1);
        for window in chunks.windows(2) {
            // Overlap means the next chunk starts before the previous ends.
            assert!(window[1].start_char < window[0].end_char);
            assert!(window[1].start_char > window[0].start_char);
        }
    }

    proptest! {
        #[test]
        fn chunk_indices_are_contiguous_and_spans_ordered(
            words in prop::collection::vec("[a-z]{1,10}", 0..200),
            target in 8usize..64,
            overlap in 0usize..8,
        ) {
            let text = words.join(" ");
            let config = ChunkerConfig { target_tokens: target, overlap_tokens: overlap };
            let chunks = chunk_text(&text, &config);

            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert!(chunk.start_char < chunk.end_char);
                prop_assert!(!chunk.content.trim().is_empty());
            }
            for window in chunks.windows(2) {
                prop_assert!(window[1].start_char > window[0].start_char);
                prop_assert!(window[1].end_char >= window[0].end_char);
            }
            if !words.is_empty() {
                prop_assert!(!chunks.is_empty());
                prop_assert_eq!(chunks.last().unwrap().end_char, text.chars().count());
            }
        }
    }
}
