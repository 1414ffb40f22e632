//! Token-window text chunker.
//!
//! Splits text into overlapping windows of `target_tokens` BPE tokens
//! (`cl100k_base`), advancing `target_tokens - overlap_tokens` tokens per
//! step. Each [`TextSpan`] carries its absolute character offsets, counted in
//! Unicode scalar values, so a span can be located in the source text.
//!
//! # Algorithm
//!
//! 1. Encode the whole text once.
//! 2. Decode `tokens[start..start + target]` as the window. A window end that
//!    would split a multi-byte character is moved forward one token at a time
//!    until the slice decodes.
//! 3. Stop once a window reaches the end of the token stream.
//! 4. Otherwise the next window starts at `end - overlap`, or at `end` when
//!    that would not move forward. The char offset advances by the decoded
//!    length of the skipped tokens.
//!
//! The same text and parameters always produce the same spans; the span
//! position is the `chunk_index` used for vector identity.

use anyhow::{anyhow, bail, Result};
use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// One chunk of text with its location in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub char_start: usize,
    pub char_end: usize,
    pub token_start: usize,
    pub token_end: usize,
    pub text: String,
}

/// Split `text` into overlapping token windows.
///
/// Returns an empty list for empty input.
pub fn chunk_text(text: &str, target_tokens: usize, overlap_tokens: usize) -> Result<Vec<TextSpan>> {
    if target_tokens == 0 {
        bail!("target_tokens must be > 0");
    }

    let bpe = tokenizer()?;
    let tokens = bpe.encode_ordinary(text);
    let mut spans = Vec::new();

    let mut start = 0usize;
    let mut char_start = 0usize;

    while start < tokens.len() {
        let (end, window) = decode_forward(bpe, &tokens, start, (start + target_tokens).min(tokens.len()))?;
        let char_end = char_start + window.chars().count();
        spans.push(TextSpan {
            char_start,
            char_end,
            token_start: start,
            token_end: end,
            text: window,
        });

        if end >= tokens.len() {
            break;
        }

        let stepped = end.saturating_sub(overlap_tokens);
        let candidate = if stepped > start { stepped } else { end };
        let (next, skipped) = decode_forward(bpe, &tokens, start, candidate)?;
        char_start += skipped.chars().count();
        start = next;
    }

    Ok(spans)
}

/// Number of `cl100k_base` tokens in `text`.
pub fn count_tokens(text: &str) -> Result<usize> {
    Ok(tokenizer()?.encode_ordinary(text).len())
}

/// Decode `tokens[start..end]`, extending `end` until the bytes form valid
/// UTF-8. `start` must already sit on a character boundary.
fn decode_forward(
    bpe: &CoreBPE,
    tokens: &[usize],
    start: usize,
    mut end: usize,
) -> Result<(usize, String)> {
    loop {
        match bpe.decode(tokens[start..end].to_vec()) {
            Ok(decoded) => return Ok((end, decoded)),
            Err(_) if end < tokens.len() => end += 1,
            Err(e) => {
                return Err(anyhow!(
                    "failed to decode tokens {}..{}: {}",
                    start,
                    end,
                    e
                ))
            }
        }
    }
}

fn tokenizer() -> Result<&'static CoreBPE> {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    if let Some(bpe) = TOKENIZER.get() {
        return Ok(bpe);
    }
    let bpe = cl100k_base().map_err(|e| anyhow!("failed to load cl100k_base tokenizer: {}", e))?;
    Ok(TOKENIZER.get_or_init(|| bpe))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("Sentence {} mentions widget{} and gadget{}.", i, i, i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn char_slice(text: &str, start: usize, end: usize) -> String {
        text.chars().skip(start).take(end - start).collect()
    }

    #[test]
    fn empty_text_has_no_spans() {
        assert!(chunk_text("", 800, 200).unwrap().is_empty());
    }

    #[test]
    fn short_text_is_one_span() {
        let spans = chunk_text("Hello, world!", 800, 200).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].char_start, 0);
        assert_eq!(spans[0].char_end, 13);
        assert_eq!(spans[0].text, "Hello, world!");
    }

    #[test]
    fn zero_target_is_rejected() {
        assert!(chunk_text("abc", 0, 0).is_err());
    }

    #[test]
    fn spans_cover_text_and_match_offsets() {
        let text = corpus(200);
        let spans = chunk_text(&text, 100, 20).unwrap();
        assert!(spans.len() > 1);

        assert_eq!(spans[0].char_start, 0);
        assert_eq!(spans.last().unwrap().char_end, text.chars().count());
        for span in &spans {
            assert_eq!(char_slice(&text, span.char_start, span.char_end), span.text);
        }
        for pair in spans.windows(2) {
            // No gaps between consecutive spans.
            assert!(pair[1].char_start <= pair[0].char_end);
            assert!(pair[1].char_start > pair[0].char_start);
        }
    }

    #[test]
    fn consecutive_windows_overlap_by_configured_tokens() {
        let text = corpus(200);
        let spans = chunk_text(&text, 100, 20).unwrap();
        for pair in spans.windows(2) {
            assert_eq!(pair[0].token_end - pair[0].token_start, 100);
            assert_eq!(pair[1].token_start, pair[0].token_end - 20);
        }
    }

    #[test]
    fn window_count_follows_stride() {
        let text = corpus(300);
        let total = count_tokens(&text).unwrap();
        let spans = chunk_text(&text, 800, 200).unwrap();
        // Windows start at 0, 600, 1200, ... until one reaches the end.
        let expected = if total <= 800 {
            1
        } else {
            (total - 800).div_ceil(600) + 1
        };
        assert_eq!(spans.len(), expected);
        assert_eq!(spans.last().unwrap().token_end, total);
    }

    #[test]
    fn deterministic() {
        let text = corpus(120);
        let a = chunk_text(&text, 64, 16).unwrap();
        let b = chunk_text(&text, 64, 16).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn overlap_not_smaller_than_target_still_progresses() {
        let text = corpus(50);
        let spans = chunk_text(&text, 10, 10).unwrap();
        for pair in spans.windows(2) {
            assert_eq!(pair[1].token_start, pair[0].token_end);
        }
        assert_eq!(spans.last().unwrap().char_end, text.chars().count());
    }

    #[test]
    fn multibyte_text_keeps_valid_offsets() {
        let text = "Größe überprüfen - 日本語のテキストと絵文字 🚀🚀🚀 ".repeat(40);
        let spans = chunk_text(&text, 7, 2).unwrap();
        assert!(spans.len() > 1);
        for span in &spans {
            assert_eq!(char_slice(&text, span.char_start, span.char_end), span.text);
        }
        assert_eq!(spans.last().unwrap().char_end, text.chars().count());
    }
}
