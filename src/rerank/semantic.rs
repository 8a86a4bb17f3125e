//! Embedding similarity, with a token-overlap fallback.

use crate::embedding::{cosine_with_norm, norm};
use crate::text::{token_overlap, token_set};
use crate::types::Entity;

use super::{RerankQuery, RerankStrategy};

/// Cosine similarity between the query and entity embeddings.
///
/// An entity is scored by token overlap instead when the query or the entity
/// has no usable embedding, so missing vectors degrade ranking rather than
/// failing it. Negative cosines are clamped to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticStrategy;

impl RerankStrategy for SemanticStrategy {
    fn name(&self) -> &'static str {
        "semantic"
    }

    fn score(&self, query: &RerankQuery, entities: &[Entity]) -> Vec<f32> {
        let query_norm = query.embedding.as_deref().map(norm).unwrap_or(0.0);
        let query_tokens = token_set(&query.text);
        entities
            .iter()
            .map(|entity| {
                let cosine = match (query.embedding.as_deref(), entity.embedding.as_deref()) {
                    (Some(q), Some(v)) => cosine_with_norm(q, query_norm, v, norm(v)),
                    _ => None,
                };
                match cosine {
                    Some(score) => score.max(0.0),
                    None => token_overlap(&query_tokens, &token_set(&entity.representative_text())) as f32,
                }
            })
            .collect()
    }
}
