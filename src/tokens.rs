//! Token-count metric.
//!
//! The catalog reports how many tokens a card's prompt text costs. The count
//! is derived on every read from the stored text and never persisted.
//! Implementations of [`Tokenizer`] must be pure.
//!
//! The bundled [`PretokenCounter`] is an estimate, not a BPE encoder: it has
//! no vocabulary, so its counts track a llama-family tokenizer only roughly
//! (typically within a few tokens per sentence of English prose). Callers
//! that need exact counts pass their own [`Tokenizer`] to
//! [`Catalog::with_tokenizer`](crate::Catalog::with_tokenizer).

use std::sync::LazyLock;

use regex::Regex;

/// Counts tokens in a piece of text.
pub trait Tokenizer: Send + Sync {
    /// Returns the number of tokens `text` encodes to.
    fn count_tokens(&self, text: &str) -> usize;

    /// Sums the token counts of several optional fields; absent fields count as zero.
    fn count_fields(&self, fields: &[Option<&str>]) -> usize {
        fields
            .iter()
            .flatten()
            .map(|text| self.count_tokens(text))
            .sum()
    }
}

/// GPT-2 style pre-tokenizer split: contractions, letter runs, digit runs,
/// punctuation runs and whitespace, each with an optional leading space.
#[allow(clippy::expect_used)]
static PRETOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+")
        .expect("pretoken regex is valid")
});

/// Estimates a BPE token count by counting pre-tokenizer pieces.
///
/// The result is approximate; it never consults a merge table.
///
/// Long words cost more than one token under real BPE; every 8 bytes of a
/// piece beyond the first 8 adds one token to stay close to llama-family
/// counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct PretokenCounter;

/// Piece length (bytes) covered by a single token.
const BYTES_PER_TOKEN: usize = 8;

impl Tokenizer for PretokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        PRETOKEN
            .find_iter(text)
            .map(|piece| piece.as_str().trim_start().len().div_ceil(BYTES_PER_TOKEN).max(1))
            .sum()
    }
}
