//! Question intent classification
//!
//! Decides whether a question is about this repository (grounded) or
//! general, and derives the lattice search queries for the fallback path.

use std::sync::OnceLock;

use regex::Regex;

use crate::retrieval::derive_query;

fn file_extension_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\.(ts|tsx|js|jsx|rs|py|go|md|json|yaml|yml|toml|sql|css|html)\b").unwrap()
    })
}

fn repo_vocab_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(repo|repository|module|file|function|class|endpoint|route|server|client|pipeline|schema|component|config|test|codebase|implementation)\b",
        )
        .unwrap()
    })
}

fn domain_vocab_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(warp|bubble|resonance|helix|patch|lattice|knowledge|trace|solver)\b")
            .unwrap()
    })
}

/// Is the question asking about this repository's code or domain?
pub fn is_repo_grounded(question: &str) -> bool {
    let lower = question.to_lowercase();
    file_extension_re().is_match(&lower)
        || repo_vocab_re().is_match(&lower)
        || domain_vocab_re().is_match(&lower)
}

/// Derive up to `limit` search queries from a question: the full token
/// string first, then adjacent token pairs, then single tokens.
pub fn derive_search_queries(question: &str, limit: usize) -> Vec<String> {
    let tokens = derive_query(question).tokens;
    let mut queries: Vec<String> = Vec::new();

    if !tokens.is_empty() {
        queries.push(tokens.join(" "));
    }
    for pair in tokens.windows(2) {
        queries.push(pair.join(" "));
    }
    for token in &tokens {
        queries.push(token.clone());
    }

    queries.dedup();
    let mut seen = Vec::new();
    queries.retain(|q| {
        if seen.contains(q) {
            false
        } else {
            seen.push(q.clone());
            true
        }
    });
    queries.truncate(limit);
    queries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_mentions_are_grounded() {
        assert!(is_repo_grounded("what does warp-module.ts export?"));
        assert!(is_repo_grounded("which endpoint handles sessions"));
        assert!(is_repo_grounded("how does the warp bubble solver work?"));
    }

    #[test]
    fn small_talk_is_not_grounded() {
        assert!(!is_repo_grounded("what's a good espresso ratio?"));
    }

    #[test]
    fn query_derivation_is_bounded_and_deduplicated() {
        let queries = derive_search_queries("how does the warp bubble solver work?", 10);
        assert_eq!(queries[0], "warp bubble");
        assert!(queries.contains(&"warp".to_string()));
        assert!(queries.len() <= 10);

        let capped = derive_search_queries(
            "resonance lattice scoring selection budget ordering pipeline",
            3,
        );
        assert_eq!(capped.len(), 3);
    }
}
