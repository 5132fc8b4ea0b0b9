//! Sentence-aligned, overlapping text chunking for embedding.

use serde::{Deserialize, Serialize};

/// Fragments at or below this many characters are treated as extraction noise.
pub const MIN_SENTENCE_CHARS: usize = 10;

/// Approximate characters per word used to turn a character overlap into a word count.
const CHARS_PER_WORD: usize = 5;

/// Chunking knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOptions {
    /// Character budget before a chunk is closed.
    pub chunk_size: usize,
    /// Characters of trailing context carried into the next chunk.
    pub chunk_overlap: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 200,
        }
    }
}

impl ChunkOptions {
    fn overlap_words(&self) -> usize {
        self.chunk_overlap / CHARS_PER_WORD
    }
}

/// Chunk emitted for downstream embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    /// Chunk text, trimmed.
    pub text: String,
    /// Zero-based position in document order.
    pub index: usize,
}

impl TextChunk {
    /// Rough 1-based page number, assuming ten chunks per page.
    pub fn page_estimate(&self) -> i32 {
        i32::try_from(self.index / 10 + 1).unwrap_or(i32::MAX)
    }
}

/// Splits `text` into overlapping chunks of whole sentences.
///
/// A chunk closes when appending the next sentence would push it past
/// `chunk_size` characters; the next chunk is seeded with the closed chunk's
/// trailing `chunk_overlap / 5` words. A single sentence longer than
/// `chunk_size` is never split, so a chunk may exceed the budget by at most
/// one sentence.
pub fn chunk_text(text: &str, options: &ChunkOptions) -> Vec<TextChunk> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for sentence in sentences {
        let sentence_chars = sentence.chars().count();
        if current_chars > 0 && current_chars + sentence_chars > options.chunk_size {
            let closed = current.trim().to_string();
            current = overlap_tail(&closed, options.overlap_words());
            current_chars = current.chars().count();
            flush_chunk(&mut chunks, closed);
        }
        current.push_str(sentence);
        current.push(' ');
        current_chars += sentence_chars + 1;
    }

    let trailing = current.trim();
    if !trailing.is_empty() {
        flush_chunk(&mut chunks, trailing.to_string());
    }

    tracing::debug!(
        chunks = chunks.len(),
        characters = text.len(),
        "chunked document text"
    );
    chunks
}

fn flush_chunk(chunks: &mut Vec<TextChunk>, text: String) {
    if text.is_empty() {
        return;
    }
    chunks.push(TextChunk {
        text,
        index: chunks.len(),
    });
}

fn overlap_tail(closed: &str, words: usize) -> String {
    if words == 0 {
        return String::new();
    }
    let all: Vec<&str> = closed.split_whitespace().collect();
    let start = all.len().saturating_sub(words);
    let mut seed = all[start..].join(" ");
    if !seed.is_empty() {
        seed.push(' ');
    }
    seed
}

/// Splits on `.`, `!` or `?` followed by whitespace, trims, and drops short fragments.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        let Some(&(_, next)) = chars.peek() else {
            continue;
        };
        if next.is_whitespace() {
            let end = idx + ch.len_utf8();
            push_sentence(&mut sentences, &text[start..end]);
            start = end;
        }
    }
    push_sentence(&mut sentences, &text[start..]);
    sentences
}

fn push_sentence<'a>(sentences: &mut Vec<&'a str>, raw: &'a str) {
    let trimmed = raw.trim();
    if trimmed.chars().count() > MIN_SENTENCE_CHARS {
        sentences.push(trimmed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tender_text(sentences: usize) -> String {
        (0..sentences)
            .map(|i| {
                format!(
                    "Clause {i:02} obliges every bidder to furnish audited balance sheets promptly."
                )
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", &ChunkOptions::default()).is_empty());
        assert!(chunk_text("   \n\t ", &ChunkOptions::default()).is_empty());
    }

    #[test]
    fn short_input_is_a_single_chunk() {
        let text = "The bid security is two percent of the quoted value. Late bids are rejected.";
        let chunks = chunk_text(text, &ChunkOptions::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn drops_noise_fragments() {
        let sentences = split_sentences("Page 3. Ok. The contractor shall insure all works. A.");
        assert_eq!(sentences, vec!["The contractor shall insure all works."]);
    }

    #[test]
    fn keeps_punctuation_without_trailing_space_inside_sentence() {
        let sentences = split_sentences("Value is Rs. 5.2 crore in total here. Deadline is 12.03.2025 at noon.");
        assert_eq!(
            sentences,
            vec![
                "Value is Rs.",
                "5.2 crore in total here.",
                "Deadline is 12.03.2025 at noon."
            ]
        );
    }

    #[test]
    fn three_page_document_produces_bounded_chunks() {
        let text = tender_text(33);
        assert!(text.len() >= 2_400, "fixture is {} chars", text.len());
        let chunks = chunk_text(&text, &ChunkOptions::default());
        assert!(chunks.len() >= 3, "got {} chunks", chunks.len());
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 1_000, "{}", chunk.text.len());
        }
        assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[test]
    fn chunks_carry_overlap_and_preserve_sentence_order() {
        let text = tender_text(30);
        let sentences = split_sentences(&text);
        let chunks = chunk_text(&text, &ChunkOptions::default());

        let mut cursor = 0usize;
        for chunk in &chunks {
            while cursor < sentences.len() && chunk.text.contains(sentences[cursor]) {
                cursor += 1;
            }
        }
        assert_eq!(cursor, sentences.len(), "every sentence lands in order");

        for pair in chunks.windows(2) {
            let tail: Vec<&str> = pair[0].text.split_whitespace().rev().take(5).collect();
            let head = pair[1].text.split_whitespace().take(40).collect::<Vec<_>>();
            assert!(tail.iter().all(|word| head.contains(word)));
        }
    }

    #[test]
    fn oversized_sentence_is_not_split() {
        let long = format!("{}.", "x".repeat(1_500));
        let text = format!("A short opening sentence here. {long} A closing remark follows.");
        let options = ChunkOptions {
            chunk_size: 800,
            chunk_overlap: 0,
        };
        let chunks = chunk_text(&text, &options);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].text, long);
        assert!(chunks
            .iter()
            .all(|c| c.text.chars().count() <= options.chunk_size + long.len()));
    }

    #[test]
    fn page_estimate_groups_ten_chunks() {
        let chunk = |index| TextChunk {
            text: String::new(),
            index,
        };
        assert_eq!(chunk(0).page_estimate(), 1);
        assert_eq!(chunk(9).page_estimate(), 1);
        assert_eq!(chunk(10).page_estimate(), 2);
    }
}
