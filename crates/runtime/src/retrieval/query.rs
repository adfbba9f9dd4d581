//! Query derivation
//!
//! Normalizes the question into scoring tokens. Questions that touch the
//! warp/physics vocabulary collapse to just those tokens so generic words
//! cannot drown out the focused intent.

/// Words dropped from every query.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "does", "for", "how", "in", "is", "of", "on", "or", "that", "the",
    "this", "to", "with", "system", "solve", "solves", "solver", "solution",
];

/// Tokens that pull a question into warp focus.
pub const WARP_FOCUS: &[&str] = &[
    "warp", "bubble", "alcubierre", "natario", "geometry", "metric", "sdf",
];

/// Tokens derived from a question, plus whether warp focus applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedQuery {
    pub tokens: Vec<String>,
    pub warp_focus: bool,
}

/// Approximate token count: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Lowercase, squash every non-alphanumeric run to a single space, trim.
pub fn normalize(question: &str) -> String {
    let mut out = String::with_capacity(question.len());
    let mut pending_space = false;
    for ch in question.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_space = true;
        }
    }
    out
}

/// Derive scoring tokens from a question.
pub fn derive_query(question: &str) -> DerivedQuery {
    let normalized = normalize(question);
    let mut tokens: Vec<String> = Vec::new();
    for token in normalized.split_whitespace() {
        if STOP_WORDS.contains(&token) {
            continue;
        }
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }

    let warp_focus = tokens.iter().any(|t| WARP_FOCUS.contains(&t.as_str()));
    if warp_focus {
        tokens.retain(|t| WARP_FOCUS.contains(&t.as_str()));
    }

    DerivedQuery { tokens, warp_focus }
}
