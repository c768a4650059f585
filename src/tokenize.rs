//! Line tokenization for the stream engine.
//!
//! Splitting follows the classic tokenizer contract: tokens are separated
//! by runs of ASCII whitespace, empty tokens never occur, and no case
//! folding or punctuation stripping happens. Each token becomes a
//! `(word, 1)` pair.

/// Split a line into `(token, 1)` pairs, in input order.
pub fn tokenize(line: &str) -> Vec<(String, u64)> {
    line.split_ascii_whitespace()
        .map(|token| (token.to_string(), 1))
        .collect()
}

/// Re-key a pair to the first character of its word.
///
/// Tokens from [`tokenize`] are never empty; an empty word maps to an empty
/// key rather than panicking.
pub fn first_char_key((word, count): (String, u64)) -> (String, u64) {
    let key = word.chars().next().map(String::from).unwrap_or_default();
    (key, count)
}
