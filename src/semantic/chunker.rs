//! Text chunking for retrieval.
//!
//! Long text is cut into segments sized for the embedding model:
//! 1. Split into sentences at `.`, `!` or `?` followed by whitespace
//! 2. Accumulate sentences until the next one would exceed the max size
//! 3. Start the next chunk with trailing sentences of the previous one
//!    (the overlap window)
//!
//! Sizes are estimated tokens, `chars / 4`. Offsets are byte offsets into
//! the source text, so `&source[start_offset..end_offset] == chunk.text`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::{ChunkMode, ChunkerConfig};
use crate::records::Metadata;

/// Blank line, possibly containing whitespace.
static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());

/// A segment of source text ready for embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextChunk {
    /// 0-based, contiguous across the emitted sequence
    pub index: usize,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub estimated_tokens: usize,
    pub metadata: Metadata,
}

/// Rough token count used for all size decisions.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk `text` with the configured mode. Blank input yields no chunks.
    pub fn chunk(&self, text: &str, metadata: &Metadata) -> Vec<TextChunk> {
        match self.config.mode {
            ChunkMode::Sentence => self.chunk_sentences(text, metadata),
            ChunkMode::Paragraph => self.chunk_paragraphs(text, metadata),
        }
    }

    /// Sentence accumulation with overlap.
    pub fn chunk_sentences(&self, text: &str, metadata: &Metadata) -> Vec<TextChunk> {
        let sentences = sentence_spans(text);
        let max = self.config.max_chunk_tokens;
        let min = self.config.min_chunk_tokens;
        let tokens = |from: usize, to: usize| {
            estimate_tokens(&text[sentences[from].start..sentences[to].end])
        };

        let mut spans = Vec::new();
        // pending chunk is sentences[first..i]
        let mut first = 0;

        for i in 0..sentences.len() {
            if first == i || tokens(first, i) <= max {
                continue;
            }

            if tokens(first, i - 1) < min {
                // too small to stand alone, let it absorb the oversized sentence
                continue;
            }

            spans.push(Span {
                start: sentences[first].start,
                end: sentences[i - 1].end,
            });
            first = self.overlap_seed(first, i, &tokens);
        }

        if first < sentences.len() {
            let last = sentences.len() - 1;
            if tokens(first, last) >= min || self.config.keep_trailing_fragment {
                spans.push(Span {
                    start: sentences[first].start,
                    end: sentences[last].end,
                });
            } else {
                log::debug!(
                    "Dropping trailing fragment of {} tokens (minimum {})",
                    tokens(first, last),
                    min
                );
            }
        }

        build_chunks(text, spans, metadata)
    }

    /// First sentence of the chunk that follows `prev_first..next`.
    ///
    /// Walks back from the end of the finished chunk until about
    /// `overlap_tokens` are covered, always leaving out at least its first
    /// sentence, then gives back sentences while seed plus `next` would not
    /// fit in a chunk.
    fn overlap_seed(
        &self,
        prev_first: usize,
        next: usize,
        tokens: &impl Fn(usize, usize) -> usize,
    ) -> usize {
        let overlap = self.config.overlap_tokens;
        let mut seed = next;

        if overlap > 0 {
            while seed > prev_first + 1 {
                seed -= 1;
                if tokens(seed, next - 1) >= overlap {
                    break;
                }
            }
        }

        while seed < next && tokens(seed, next) > self.config.max_chunk_tokens {
            seed += 1;
        }
        seed
    }

    /// Blank-line separated paragraphs, minimum size filter, no overlap.
    pub fn chunk_paragraphs(&self, text: &str, metadata: &Metadata) -> Vec<TextChunk> {
        let mut spans = Vec::new();
        let mut start = 0;

        for separator in PARAGRAPH_BREAK.find_iter(text) {
            push_trimmed(text, start, separator.start(), &mut spans);
            start = separator.end();
        }
        push_trimmed(text, start, text.len(), &mut spans);

        spans.retain(|span| {
            estimate_tokens(&text[span.start..span.end]) >= self.config.min_chunk_tokens
        });

        build_chunks(text, spans, metadata)
    }
}

fn build_chunks(text: &str, spans: Vec<Span>, metadata: &Metadata) -> Vec<TextChunk> {
    spans
        .into_iter()
        .enumerate()
        .map(|(index, span)| {
            let chunk_text = &text[span.start..span.end];
            TextChunk {
                index,
                text: chunk_text.to_string(),
                start_offset: span.start,
                end_offset: span.end,
                estimated_tokens: estimate_tokens(chunk_text),
                metadata: metadata.clone(),
            }
        })
        .collect()
}

/// Sentence boundaries as trimmed, non-empty byte spans.
fn sentence_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let at_boundary = match chars.peek() {
            None => true,
            Some((_, next)) => next.is_whitespace(),
        };
        if at_boundary {
            let end = idx + c.len_utf8();
            push_trimmed(text, start, end, &mut spans);
            start = end;
        }
    }
    push_trimmed(text, start, text.len(), &mut spans);

    spans
}

fn push_trimmed(text: &str, start: usize, end: usize, spans: &mut Vec<Span>) {
    let slice = &text[start..end];
    let trimmed = slice.trim_start();
    let leading = slice.len() - trimmed.len();
    let trimmed = trimmed.trim_end();
    if trimmed.is_empty() {
        return;
    }
    spans.push(Span {
        start: start + leading,
        end: start + leading + trimmed.len(),
    });
}
