//! BM25 text relevance over entity names and string properties.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::text::{token_set, tokenize};
use crate::types::Entity;

use super::{RerankQuery, RerankStrategy};

/// BM25 parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f32,
    /// Length normalization.
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// BM25 with the candidate list as the corpus.
#[derive(Debug, Clone, Default)]
pub struct TextStrategy {
    params: Bm25Params,
}

impl TextStrategy {
    /// Strategy with explicit parameters.
    pub fn new(params: Bm25Params) -> Self {
        Self { params }
    }
}

impl RerankStrategy for TextStrategy {
    fn name(&self) -> &'static str {
        "text"
    }

    fn score(&self, query: &RerankQuery, entities: &[Entity]) -> Vec<f32> {
        let terms = token_set(&query.text);
        if terms.is_empty() || entities.is_empty() {
            return vec![0.0; entities.len()];
        }

        let docs: Vec<Vec<String>> = entities.iter().map(|e| tokenize(&e.representative_text())).collect();
        let n = docs.len() as f32;
        let avg_len = docs.iter().map(Vec::len).sum::<usize>() as f32 / n;

        let mut df: BTreeMap<&str, usize> = BTreeMap::new();
        for doc in &docs {
            for term in &terms {
                if doc.iter().any(|t| t == term) {
                    *df.entry(term.as_str()).or_default() += 1;
                }
            }
        }

        let Bm25Params { k1, b } = self.params;
        docs.iter()
            .map(|doc| {
                let len_norm = if avg_len > 0.0 { doc.len() as f32 / avg_len } else { 0.0 };
                terms
                    .iter()
                    .map(|term| {
                        let tf = doc.iter().filter(|t| *t == term).count() as f32;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let df = df.get(term.as_str()).copied().unwrap_or(0) as f32;
                        let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                        idf * tf * (k1 + 1.0) / (tf + k1 * (1.0 - b + b * len_norm))
                    })
                    .sum()
            })
            .collect()
    }
}
