//! Weighted composition of the text, semantic and structural strategies.

use serde::{Deserialize, Serialize};

use crate::types::Entity;

use super::semantic::SemanticStrategy;
use super::structural::StructuralStrategy;
use super::text::{Bm25Params, TextStrategy};
use super::{RerankQuery, RerankStrategy, ScoreBreakdown};

/// Weights of the hybrid score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankWeights {
    /// BM25 weight.
    pub text: f32,
    /// Embedding similarity weight.
    pub semantic: f32,
    /// Degree centrality weight.
    pub structural: f32,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            text: 0.4,
            semantic: 0.4,
            structural: 0.2,
        }
    }
}

impl RerankWeights {
    /// Text-only ranking.
    pub fn keyword_focused() -> Self {
        Self {
            text: 1.0,
            semantic: 0.0,
            structural: 0.0,
        }
    }

    /// Mostly embedding similarity.
    pub fn semantic_focused() -> Self {
        Self {
            text: 0.2,
            semantic: 0.7,
            structural: 0.1,
        }
    }
}

/// `text * w_text + semantic * w_semantic + structural * w_structural`.
///
/// Component scores are divided by their maximum over the candidate list
/// before weighting, so every component lies in [0, 1]. Without a
/// structural strategy the structural component is zero.
#[derive(Debug, Clone, Default)]
pub struct HybridStrategy {
    weights: RerankWeights,
    text: TextStrategy,
    semantic: SemanticStrategy,
    structural: Option<StructuralStrategy>,
}

impl HybridStrategy {
    /// Hybrid strategy with the given weights and BM25 parameters.
    pub fn new(weights: RerankWeights, bm25: Bm25Params) -> Self {
        Self {
            weights,
            text: TextStrategy::new(bm25),
            semantic: SemanticStrategy,
            structural: None,
        }
    }

    /// Add a structural component.
    pub fn with_structural(mut self, structural: StructuralStrategy) -> Self {
        self.structural = Some(structural);
        self
    }

    /// Weights.
    pub fn weights(&self) -> &RerankWeights {
        &self.weights
    }

    /// Per-component normalized scores and their weighted total.
    pub fn breakdown(&self, query: &RerankQuery, entities: &[Entity]) -> Vec<ScoreBreakdown> {
        let text = normalized(self.text.score(query, entities));
        let semantic = normalized(self.semantic.score(query, entities));
        let structural = match &self.structural {
            Some(s) => normalized(s.score(query, entities)),
            None => vec![0.0; entities.len()],
        };
        text.into_iter()
            .zip(semantic)
            .zip(structural)
            .map(|((text, semantic), structural)| ScoreBreakdown {
                text,
                semantic,
                structural,
                total: text * self.weights.text
                    + semantic * self.weights.semantic
                    + structural * self.weights.structural,
            })
            .collect()
    }
}

impl RerankStrategy for HybridStrategy {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn score(&self, query: &RerankQuery, entities: &[Entity]) -> Vec<f32> {
        self.breakdown(query, entities).into_iter().map(|b| b.total).collect()
    }
}

fn normalized(mut scores: Vec<f32>) -> Vec<f32> {
    let max = scores.iter().copied().fold(0.0f32, f32::max);
    if max > 0.0 {
        for s in &mut scores {
            *s /= max;
        }
    }
    scores
}
