//! Token-blocking candidate index.
//!
//! Entities are only compared with entities that share at least one name
//! token, and at most `max_candidates` of those, ranked by shared-token
//! count. This keeps fusion far below a full pairwise scan on large inputs.

use std::collections::{BTreeMap, BTreeSet};

use crate::text::token_set;

/// Inverted index from name token to entity positions.
#[derive(Debug, Default)]
pub struct CandidateIndex {
    postings: BTreeMap<String, BTreeSet<usize>>,
    tokens: Vec<BTreeSet<String>>,
    max_candidates: usize,
}

impl CandidateIndex {
    /// Index `names`; position `i` refers to `names[i]`.
    pub fn build<'a>(names: impl IntoIterator<Item = &'a str>, max_candidates: usize) -> Self {
        let mut index = Self {
            max_candidates,
            ..Self::default()
        };
        for (i, name) in names.into_iter().enumerate() {
            let tokens = token_set(name);
            for token in &tokens {
                index.postings.entry(token.clone()).or_default().insert(i);
            }
            index.tokens.push(tokens);
        }
        index
    }

    /// Number of indexed names.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Candidates for position `i` with a higher position, best first.
    ///
    /// Only higher positions are returned so each pair is considered once.
    pub fn candidates(&self, i: usize) -> Vec<usize> {
        let Some(tokens) = self.tokens.get(i) else {
            return Vec::new();
        };
        let mut shared: BTreeMap<usize, usize> = BTreeMap::new();
        for token in tokens {
            if let Some(postings) = self.postings.get(token) {
                for &j in postings.range(i + 1..) {
                    *shared.entry(j).or_default() += 1;
                }
            }
        }
        let mut ranked: Vec<(usize, usize)> = shared.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(self.max_candidates);
        ranked.into_iter().map(|(j, _)| j).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_share_tokens() {
        let index = CandidateIndex::build(["Acme Corp", "Globex", "ACME Corporation", "Acme Corp Ltd"], 10);
        assert_eq!(index.candidates(0), vec![3, 2]);
        assert!(index.candidates(1).is_empty());
        assert!(index.candidates(3).is_empty());
    }

    #[test]
    fn test_candidates_are_bounded() {
        let names: Vec<String> = (0..100).map(|i| format!("acme {}", i)).collect();
        let index = CandidateIndex::build(names.iter().map(String::as_str), 5);
        assert_eq!(index.candidates(0).len(), 5);
    }
}
