//! Tokenization and string similarity shared by search, fusion and reranking.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex_lite::Regex;

/// Runs of characters that are neither whitespace nor ASCII punctuation.
/// Non-ASCII letters are kept as token characters.
const TOKEN_PATTERN: &str = r"[^\s!-/:-@\[-`{-~]+";

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(TOKEN_PATTERN).expect("static token pattern"))
}

/// Lowercased alphanumeric tokens, in order (duplicates kept).
pub fn tokenize(text: &str) -> Vec<String> {
    token_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Distinct lowercased tokens.
pub fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Canonical form used for name comparison: tokens joined by single spaces.
pub fn normalize(text: &str) -> String {
    tokenize(text).join(" ")
}

/// Jaccard similarity of two token sets (1.0 when both are empty).
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Fraction of query tokens present in the document tokens.
pub fn token_overlap(query: &BTreeSet<String>, document: &BTreeSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    query.intersection(document).count() as f64 / query.len() as f64
}

/// Levenshtein edit distance over chars.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// `1 - distance / max_len`, in [0, 1].
pub fn normalized_levenshtein(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(tokenize("Acme Corp., Inc!"), vec!["acme", "corp", "inc"]);
        assert_eq!(normalize("  ACME   corp "), "acme corp");
    }

    #[test]
    fn test_jaccard_and_overlap() {
        let a = token_set("acme corp");
        let b = token_set("acme corporation");
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert!((token_overlap(&token_set("acme"), &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert!((normalized_levenshtein("abc", "abc") - 1.0).abs() < 1e-9);
        assert!(normalized_levenshtein("jon smith", "john smith") > 0.89);
    }
}
