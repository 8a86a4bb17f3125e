//! Name similarity used to decide merges.

use crate::text::{jaccard, normalize, normalized_levenshtein, token_set};

/// `max(token Jaccard, normalized Levenshtein)` over normalized names.
///
/// Token Jaccard catches reordered words ("Smith, John" / "John Smith"),
/// Levenshtein catches typos. Two names that normalize to nothing are not
/// similar.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let (na, nb) = (normalize(a), normalize(b));
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }
    let tokens = jaccard(&token_set(&na), &token_set(&nb));
    tokens.max(normalized_levenshtein(&na, &nb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reordered_and_misspelled_names() {
        assert!((name_similarity("Smith, John", "john smith") - 1.0).abs() < 1e-9);
        assert!(name_similarity("Jon Smith", "John Smith") > 0.89);
        assert!(name_similarity("Acme Corp", "Globex Corp") < 0.9);
        assert_eq!(name_similarity("", "Acme"), 0.0);
        assert_eq!(name_similarity("!!", "??"), 0.0);
    }
}
