//! English-only output guard.

pub const ENGLISH_ONLY_FALLBACK: &str =
    "I apologize, but I can only respond in English. Please ask your question in English.";

/// Share of non-ASCII letters above which a reply is treated as non-English.
pub const NON_ASCII_THRESHOLD: f64 = 0.15;

/// Only the head of a reply is inspected.
pub const SAMPLE_CHARS: usize = 2000;

/// Fraction of alphabetic characters in the sampled head of `text` that are
/// outside ASCII. Text with no letters scores 0.
pub fn non_ascii_alpha_ratio(text: &str) -> f64 {
    let mut alpha = 0usize;
    let mut non_ascii = 0usize;
    for c in text.chars().take(SAMPLE_CHARS).filter(|c| c.is_alphabetic()) {
        alpha += 1;
        if !c.is_ascii() {
            non_ascii += 1;
        }
    }
    if alpha == 0 {
        return 0.0;
    }
    non_ascii as f64 / alpha as f64
}

pub fn is_probably_english(text: &str) -> bool {
    non_ascii_alpha_ratio(text) <= NON_ASCII_THRESHOLD
}

/// Returns `text` unchanged, or the fixed fallback when it looks non-English.
pub fn enforce_english(text: String) -> String {
    if is_probably_english(&text) {
        text
    } else {
        ENGLISH_ONLY_FALLBACK.to_string()
    }
}
