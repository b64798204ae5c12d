//! Paragraph-first chunking with a token budget and a carried overlap.
//!
//! Tokens are whitespace-delimited words. Each chunk owns a *fresh* run of
//! tokens of at most `target_tokens`; the last `overlap_tokens` of the
//! previous chunk are prepended to its text. Fresh spans tile the source, so
//! `text[span]` over all chunks of a document reconstructs it byte for byte.

use crate::config::ChunkingConfig;
use crate::error::RagError;
use crate::models::{CharSpan, Chunk};
use regex::Regex;
use std::ops::Range;

const PARAGRAPH_BREAK: &str = r"\n[^\S\n]*\n";
const SENTENCE_END: &str = r#"[.!?]["'\u{201D}\u{2019})\]]*$"#;

/// A whitespace-delimited token, as byte offsets into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub start: usize,
    pub end: usize,
}

pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut open: Option<usize> = None;

    for (offset, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(start) = open.take() {
                tokens.push(Token { start, end: offset });
            }
        } else if open.is_none() {
            open = Some(offset);
        }
    }

    if let Some(start) = open {
        tokens.push(Token {
            start,
            end: text.len(),
        });
    }

    tokens
}

pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// One chunk of a text before it is attached to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    pub overlap_tokens: usize,
    pub char_span: CharSpan,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
    paragraph_break: Regex,
    sentence_end: Regex,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, RagError> {
        config.validate()?;
        Ok(Self {
            config,
            paragraph_break: Regex::new(PARAGRAPH_BREAK)?,
            sentence_end: Regex::new(SENTENCE_END)?,
        })
    }

    pub fn split(&self, text: &str) -> Vec<TextSegment> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }

        let bodies = self.plan(text, &tokens);
        let mut segments = Vec::with_capacity(bodies.len());
        let mut previous_text_start = 0usize;

        for (index, body) in bodies.iter().enumerate() {
            let text_start = if index == 0 {
                body.start
            } else {
                body.start
                    .saturating_sub(self.config.overlap_tokens)
                    .max(previous_text_start)
            };

            let span_start = if index == 0 {
                0
            } else {
                tokens[body.start].start
            };
            let span_end = match bodies.get(index + 1) {
                Some(next) => tokens[next.start].start,
                None => text.len(),
            };

            segments.push(TextSegment {
                chunk_index: index,
                text: text[tokens[text_start].start..tokens[body.end - 1].end].to_string(),
                token_count: body.end - text_start,
                overlap_tokens: body.start - text_start,
                char_span: CharSpan {
                    start: span_start,
                    end: span_end,
                },
            });
            previous_text_start = text_start;
        }

        segments
    }

    pub fn chunk_document(&self, document_id: &str, filename: &str, text: &str) -> Vec<Chunk> {
        self.split(text)
            .into_iter()
            .map(|segment| Chunk {
                document_id: document_id.to_string(),
                filename: filename.to_string(),
                chunk_index: segment.chunk_index,
                text: segment.text,
                token_count: segment.token_count,
                overlap_tokens: segment.overlap_tokens,
                char_span: segment.char_span,
            })
            .collect()
    }

    /// Fresh token ranges of every chunk, in order. Each range holds at most
    /// `target_tokens` tokens.
    fn plan(&self, text: &str, tokens: &[Token]) -> Vec<Range<usize>> {
        let target = self.config.target_tokens;
        let mut bodies = Vec::new();
        let mut current: Option<Range<usize>> = None;

        for paragraph in self.paragraphs(text, tokens) {
            if paragraph.len() <= target {
                pack(&mut current, paragraph, target, &mut bodies);
                continue;
            }

            bodies.extend(current.take());
            let mut sentence_buffer = None;
            for sentence in self.sentences(text, tokens, paragraph) {
                for unit in hard_split(sentence, target) {
                    pack(&mut sentence_buffer, unit, target, &mut bodies);
                }
            }
            bodies.extend(sentence_buffer);
        }

        bodies.extend(current);
        bodies
    }

    fn paragraphs(&self, text: &str, tokens: &[Token]) -> Vec<Range<usize>> {
        let mut paragraphs = Vec::new();
        let mut start = 0;

        for index in 1..tokens.len() {
            let gap = &text[tokens[index - 1].end..tokens[index].start];
            if self.paragraph_break.is_match(gap) {
                paragraphs.push(start..index);
                start = index;
            }
        }
        paragraphs.push(start..tokens.len());
        paragraphs
    }

    fn sentences(&self, text: &str, tokens: &[Token], paragraph: Range<usize>) -> Vec<Range<usize>> {
        let mut sentences = Vec::new();
        let mut start = paragraph.start;

        for index in paragraph.clone() {
            let token = tokens[index];
            if self.sentence_end.is_match(&text[token.start..token.end]) {
                sentences.push(start..index + 1);
                start = index + 1;
            }
        }
        if start < paragraph.end {
            sentences.push(start..paragraph.end);
        }
        sentences
    }
}

fn pack(
    current: &mut Option<Range<usize>>,
    unit: Range<usize>,
    target: usize,
    out: &mut Vec<Range<usize>>,
) {
    if let Some(open) = current.as_mut() {
        if open.len() + unit.len() <= target {
            open.end = unit.end;
            return;
        }
    }
    out.extend(current.replace(unit));
}

/// Last resort for a sentence longer than the budget: cut every `target` tokens.
fn hard_split(range: Range<usize>, target: usize) -> Vec<Range<usize>> {
    if range.len() <= target {
        return vec![range];
    }
    let mut pieces = Vec::new();
    let mut start = range.start;
    while start < range.end {
        let end = (start + target).min(range.end);
        pieces.push(start..end);
        start = end;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(prefix: &str, count: usize) -> String {
        (0..count)
            .map(|index| format!("{prefix}{index}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn chunker(target_tokens: usize, overlap_tokens: usize) -> Chunker {
        Chunker::new(ChunkingConfig {
            target_tokens,
            overlap_tokens,
        })
        .expect("valid chunking config")
    }

    fn fresh_tokens(segment: &TextSegment) -> usize {
        segment.token_count - segment.overlap_tokens
    }

    #[test]
    fn tokenizer_reports_byte_offsets() {
        let text = "  alpha\tbeta\n\ngamma ";
        let tokens = tokenize(text);
        assert_eq!(tokens.len(), 3);
        assert_eq!(&text[tokens[0].start..tokens[0].end], "alpha");
        assert_eq!(&text[tokens[2].start..tokens[2].end], "gamma");
        assert_eq!(count_tokens(text), tokens.len());
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunker = chunker(512, 50);
        assert!(chunker.split("").is_empty());
        assert!(chunker.split(" \n\n\t ").is_empty());
    }

    #[test]
    fn overlap_not_smaller_than_target_fails_fast() {
        let result = Chunker::new(ChunkingConfig {
            target_tokens: 50,
            overlap_tokens: 60,
        });
        assert!(matches!(result, Err(RagError::InvalidInput(_))));
    }

    #[test]
    fn short_input_is_a_single_chunk_without_overlap() {
        let text = "First paragraph here.\n\nSecond paragraph there.\n";
        let segments = chunker(512, 50).split(text);

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].overlap_tokens, 0);
        assert_eq!(segments[0].token_count, 6);
        assert_eq!(segments[0].text, "First paragraph here.\n\nSecond paragraph there.");
        assert_eq!(segments[0].char_span, CharSpan { start: 0, end: text.len() });
    }

    #[test]
    fn fifteen_hundred_tokens_make_three_chunks_sharing_fifty_tokens() {
        let text = words("w", 1500);
        let segments = chunker(512, 50).split(&text);

        assert_eq!(segments.len(), 3);
        let first: Vec<&str> = segments[0].text.split_whitespace().collect();
        let second: Vec<&str> = segments[1].text.split_whitespace().collect();
        assert_eq!(&second[..50], &first[first.len() - 50..]);
        assert_eq!(segments[1].overlap_tokens, 50);
        assert_eq!(segments[2].overlap_tokens, 50);
    }

    #[test]
    fn paragraphs_are_packed_greedily() {
        let text = [words("a", 200), words("b", 200), words("c", 200)].join("\n\n");
        let segments = chunker(512, 50).split(&text);

        assert_eq!(segments.len(), 2);
        assert_eq!(fresh_tokens(&segments[0]), 400);
        assert!(segments[0].text.contains("a199\n\nb0"));
        assert_eq!(fresh_tokens(&segments[1]), 200);
        assert!(segments[1].text.starts_with("b150 "));
        assert_eq!(segments[1].token_count, 250);
    }

    #[test]
    fn oversized_paragraph_splits_on_sentences() {
        let text = "a1 a2 a3 a4. b1 b2 b3 b4. c1 c2 c3 c4. d1 d2 d3 d4. e1 e2 e3 e4.";
        let segments = chunker(10, 2).split(text);

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].text, "a1 a2 a3 a4. b1 b2 b3 b4.");
        assert_eq!(segments[1].text, "b3 b4. c1 c2 c3 c4. d1 d2 d3 d4.");
        assert_eq!(segments[2].text, "d3 d4. e1 e2 e3 e4.");
    }

    #[test]
    fn no_fresh_run_exceeds_the_budget() {
        let text = [
            words("p", 30),
            "Short one. Another short one!".to_string(),
            words("q", 75),
            "x. y. z.".to_string(),
        ]
        .join("\n\n");
        let segments = chunker(16, 4).split(&text);

        assert!(!segments.is_empty());
        for (index, segment) in segments.iter().enumerate() {
            assert_eq!(segment.chunk_index, index);
            assert!(fresh_tokens(segment) <= 16, "chunk {index} is too large");
            assert_eq!(segment.token_count, count_tokens(&segment.text));
        }
    }

    #[test]
    fn fresh_spans_reconstruct_the_source() {
        let text = format!(
            "  Intro line.\n\n{}\n\n\n{}  \n",
            words("m", 40),
            words("n", 7)
        );
        let segments = chunker(12, 3).split(&text);

        let rebuilt: String = segments
            .iter()
            .map(|segment| &text[segment.char_span.start..segment.char_span.end])
            .collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = [words("a", 90), words("b", 33)].join("\n\n");
        let chunker = chunker(40, 5);
        assert_eq!(chunker.split(&text), chunker.split(&text));
    }

    #[test]
    fn chunk_document_attaches_document_fields() {
        let chunks = chunker(512, 50).chunk_document("doc-1", "notes.txt", "hello world");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].document_id, "doc-1");
        assert_eq!(chunks[0].filename, "notes.txt");
        assert_eq!(chunks[0].chunk_index, 0);
    }
}
