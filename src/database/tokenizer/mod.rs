//! Full-text tokenizer used by the library's FTS3 indexes
//!
//! [`UnicodeTokenizer`] lower-cases its input, splits on every character that
//! is neither a letter nor a number, and reduces each decomposable character
//! to its first base code point so `café` and `cafe` index identically.
//! Offsets always refer to the unmodified input bytes because the engine cuts
//! snippets straight out of the stored text.
//!
//! [`module`] exposes a tokenizer to the engine through the FTS3 C tokenizer
//! interface.

pub mod module;

pub use module::{register_tokenizer, TokenizerModule, UNICODE_TOKENIZER_MODULE};

use serde::Serialize;
use unicode_normalization::char::decompose_compatible;

/// Name the unicode tokenizer is registered under (`tokenize=unicode`)
pub const UNICODE_TOKENIZER_NAME: &str = "unicode";

/// A single token produced by a tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    /// The normalized term
    pub text: String,
    /// Byte offset of the first byte of this token in the original text
    pub start: usize,
    /// Byte offset one past the last byte of this token in the original text
    pub end: usize,
}

impl Token {
    pub fn new(text: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            text: text.into(),
            start,
            end,
        }
    }
}

/// Trait for full-text tokenizers.
pub trait FtsTokenizer: Send + Sync {
    /// Return the tokenizer name.
    fn name(&self) -> &'static str;

    /// Tokenize the input text, producing tokens in input order.
    fn tokenize(&self, text: &str) -> Vec<Token>;
}

/// Lower-casing, de-accenting tokenizer that splits on anything that is not
/// a letter or a number.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnicodeTokenizer;

impl UnicodeTokenizer {
    pub fn new() -> Self {
        Self
    }
}

/// First code point of the compatibility decomposition of `ch`, or `ch` itself
fn base_char(ch: char) -> char {
    let mut first = None;
    decompose_compatible(ch, |d| {
        if first.is_none() {
            first = Some(d);
        }
    });
    first.unwrap_or(ch)
}

impl FtsTokenizer for UnicodeTokenizer {
    fn name(&self) -> &'static str {
        UNICODE_TOKENIZER_NAME
    }

    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut token_start = None;
        let mut current_term = String::new();

        for (byte_idx, ch) in text.char_indices() {
            if ch.is_alphanumeric() {
                if token_start.is_none() {
                    token_start = Some(byte_idx);
                    current_term.clear();
                }
                for lc in ch.to_lowercase() {
                    // Lower-casing may add combining marks (e.g. U+0130); they carry no search weight
                    if lc.is_alphanumeric() {
                        current_term.push(base_char(lc));
                    }
                }
            } else if let Some(start) = token_start.take() {
                if !current_term.is_empty() {
                    tokens.push(Token::new(current_term.clone(), start, byte_idx));
                }
            }
        }

        // Flush trailing token.
        if let Some(start) = token_start {
            if !current_term.is_empty() {
                tokens.push(Token::new(current_term, start, text.len()));
            }
        }

        tokens
    }
}

/// Tokenize raw engine input that may not be valid UTF-8.
///
/// Invalid byte sequences act as separators; offsets refer to `input`.
pub fn tokenize_bytes(tokenizer: &dyn FtsTokenizer, input: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut offset = 0;

    for chunk in input.utf8_chunks() {
        let valid = chunk.valid();
        tokens.extend(
            tokenizer
                .tokenize(valid)
                .into_iter()
                .map(|t| Token::new(t.text, t.start + offset, t.end + offset)),
        );
        offset += valid.len() + chunk.invalid().len();
    }

    tokens
}
