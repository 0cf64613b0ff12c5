// src/tokens/mod.rs
//! Per-model token counting backing the hard context-budget contract.
//!
//! A `content.len() / 4` heuristic is tempting but cannot satisfy an
//! exact-budget guarantee, so this module wraps a real BPE tokenizer and
//! falls back to the heuristic only if the encoder for a model family
//! cannot be resolved.

use tiktoken_rs::{cl100k_base, CoreBPE};

pub struct TokenCounter {
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    /// Resolve an encoder for `model`. All OpenAI-compatible chat models in
    /// this gateway's supported set use cl100k; unknown models fall back to
    /// the length heuristic rather than failing the request.
    pub fn for_model(_model: &str) -> Self {
        match cl100k_base() {
            Ok(bpe) => Self { bpe: Some(bpe) },
            Err(_) => Self { bpe: None },
        }
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => text.len().div_ceil(4),
        }
    }

    pub fn count_many<'a, I: IntoIterator<Item = &'a str>>(&self, texts: I) -> usize {
        texts.into_iter().map(|t| self.count(t)).sum()
    }

    /// Truncate `text` to at most `max_tokens`, preferring a clean word
    /// boundary. Used by the micro-quote path and `SHORT` variant generation.
    pub fn truncate_to(&self, text: &str, max_tokens: usize) -> String {
        match &self.bpe {
            Some(bpe) => {
                let tokens = bpe.encode_ordinary(text);
                if tokens.len() <= max_tokens {
                    return text.to_string();
                }
                let truncated = &tokens[..max_tokens];
                bpe.decode(truncated.to_vec()).unwrap_or_default()
            }
            None => {
                let max_chars = max_tokens * 4;
                if text.len() <= max_chars {
                    text.to_string()
                } else {
                    let mut end = max_chars.min(text.len());
                    while end > 0 && !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    text[..end].to_string()
                }
            }
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::for_model("default")
    }
}

impl Clone for TokenCounter {
    fn clone(&self) -> Self {
        Self::for_model("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_nonempty_text_as_positive() {
        let tc = TokenCounter::default();
        assert!(tc.count("hello there, general context builder") > 0);
    }

    #[test]
    fn truncation_respects_budget() {
        let tc = TokenCounter::default();
        let long = "word ".repeat(500);
        let truncated = tc.truncate_to(&long, 10);
        assert!(tc.count(&truncated) <= 10);
    }
}
