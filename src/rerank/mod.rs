//! Result reranking.
//!
//! Strategies score a candidate list as a whole (BM25 and centrality need
//! corpus statistics) and return one score per candidate, in input order.
//! Sorting is stable: equal scores keep the order the candidates came in.

pub mod hybrid;
pub mod semantic;
pub mod structural;
pub mod text;

use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;
use crate::error::Result;
use crate::types::Entity;

pub use hybrid::{HybridStrategy, RerankWeights};
pub use semantic::SemanticStrategy;
pub use structural::StructuralStrategy;
pub use text::{Bm25Params, TextStrategy};

/// What the candidates are ranked against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankQuery {
    /// Query text.
    pub text: String,
    /// Query embedding, if available.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl RerankQuery {
    /// Text-only query.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            embedding: None,
        }
    }

    /// Attach an embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Query embedded with `embedder`.
    pub async fn embedded(text: impl Into<String>, embedder: &dyn Embedder) -> Result<Self> {
        let text = text.into();
        let embedding = embedder.embed(&text).await?;
        Ok(Self {
            text,
            embedding: Some(embedding),
        })
    }
}

/// A scoring signal.
pub trait RerankStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// One score per entity, in input order. Higher is better.
    fn score(&self, query: &RerankQuery, entities: &[Entity]) -> Vec<f32>;
}

/// Reranker settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    /// Component weights.
    pub weights: RerankWeights,
    /// BM25 parameters of the text component.
    pub bm25: Bm25Params,
}

/// Normalized component scores of one candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Text component.
    pub text: f32,
    /// Semantic component.
    pub semantic: f32,
    /// Structural component.
    pub structural: f32,
    /// Weighted total.
    pub total: f32,
}

/// A reranked candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankedEntity {
    /// The entity.
    pub entity: Entity,
    /// Final score.
    pub score: f32,
    /// Component scores.
    pub breakdown: ScoreBreakdown,
}

/// Hybrid reranker.
#[derive(Debug, Clone, Default)]
pub struct Reranker {
    strategy: HybridStrategy,
}

impl Reranker {
    /// Reranker over a configured hybrid strategy.
    pub fn new(strategy: HybridStrategy) -> Self {
        Self { strategy }
    }

    /// Reranker from configuration, without a structural component.
    pub fn from_config(config: &RerankConfig) -> Self {
        Self::new(HybridStrategy::new(config.weights, config.bm25))
    }

    /// The hybrid strategy.
    pub fn strategy(&self) -> &HybridStrategy {
        &self.strategy
    }

    /// Top `top_k` entities by hybrid score.
    pub fn rerank(&self, query: &RerankQuery, entities: Vec<Entity>, top_k: usize) -> Vec<Entity> {
        self.rerank_scored(query, entities, top_k)
            .into_iter()
            .map(|r| r.entity)
            .collect()
    }

    /// Top `top_k` entities with their score breakdown.
    pub fn rerank_scored(&self, query: &RerankQuery, entities: Vec<Entity>, top_k: usize) -> Vec<RerankedEntity> {
        let breakdown = self.strategy.breakdown(query, &entities);
        let mut ranked: Vec<RerankedEntity> = entities
            .into_iter()
            .zip(breakdown)
            .map(|(entity, breakdown)| RerankedEntity {
                entity,
                score: breakdown.total,
                breakdown,
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(top_k);
        ranked
    }
}

/// Rank `entities` by any single strategy. Stable on ties.
pub fn rank_by(
    strategy: &dyn RerankStrategy,
    query: &RerankQuery,
    entities: Vec<Entity>,
    top_k: usize,
) -> Vec<(Entity, f32)> {
    let scores = strategy.score(query, &entities);
    let mut ranked: Vec<(Entity, f32)> = entities.into_iter().zip(scores).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(top_k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_ties_keep_input_order() {
        let entities: Vec<Entity> = ["c", "a", "b"].iter().map(|id| Entity::new(*id, "T", "same")).collect();
        let reranker = Reranker::default();
        let query = RerankQuery::text("same");
        for _ in 0..3 {
            let out = reranker.rerank(&query, entities.clone(), 10);
            assert_eq!(ids(&out), vec!["c", "a", "b"]);
        }
    }

    #[test]
    fn test_rerank_truncates_and_orders() {
        let entities = vec![
            Entity::new("a", "T", "banana"),
            Entity::new("b", "T", "apple pie"),
            Entity::new("c", "T", "apple"),
        ];
        let out = Reranker::default().rerank_scored(&RerankQuery::text("apple"), entities, 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].entity.id.as_str(), "c");
        assert_eq!(out[1].entity.id.as_str(), "b");
        assert!(out[0].score >= out[1].score);
    }

    #[test]
    fn test_rank_by_single_strategy() {
        let entities = vec![Entity::new("a", "T", "x"), Entity::new("b", "T", "kernel")];
        let ranked = rank_by(&TextStrategy::default(), &RerankQuery::text("kernel"), entities, 1);
        assert_eq!(ranked[0].0.id.as_str(), "b");
    }

    #[tokio::test]
    async fn test_embedded_query() {
        let embedder = HashingEmbedder::new(16);
        let query = RerankQuery::embedded("graph kernel", &embedder).await.unwrap();
        assert_eq!(query.embedding.as_ref().map(Vec::len), Some(16));
    }
}
