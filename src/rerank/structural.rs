//! Degree centrality.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::store::{degrees, GraphStore};
use crate::types::{Entity, EntityId, Relation};

use super::{RerankQuery, RerankStrategy};

/// Degree of each entity divided by the highest degree seen.
///
/// Entities absent from the degree table score zero.
#[derive(Debug, Clone, Default)]
pub struct StructuralStrategy {
    degrees: BTreeMap<EntityId, usize>,
}

impl StructuralStrategy {
    /// Degrees counted from a relation list (a self-loop counts once).
    pub fn from_relations<'a>(relations: impl IntoIterator<Item = &'a Relation>) -> Self {
        let mut degrees: BTreeMap<EntityId, usize> = BTreeMap::new();
        for relation in relations {
            *degrees.entry(relation.source_id.clone()).or_default() += 1;
            if relation.target_id != relation.source_id {
                *degrees.entry(relation.target_id.clone()).or_default() += 1;
            }
        }
        Self { degrees }
    }

    /// Degrees of `entities` as stored in `store`.
    pub async fn from_store<S: GraphStore + ?Sized>(store: &S, entities: &[Entity]) -> Result<Self> {
        let ids: Vec<EntityId> = entities.iter().map(|e| e.id.clone()).collect();
        Ok(Self {
            degrees: degrees(store, &ids).await?,
        })
    }

    /// Degree of one entity.
    pub fn degree(&self, id: &EntityId) -> usize {
        self.degrees.get(id).copied().unwrap_or(0)
    }
}

impl RerankStrategy for StructuralStrategy {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn score(&self, _query: &RerankQuery, entities: &[Entity]) -> Vec<f32> {
        let max = self.degrees.values().copied().max().unwrap_or(0);
        if max == 0 {
            return vec![0.0; entities.len()];
        }
        entities
            .iter()
            .map(|e| self.degree(&e.id) as f32 / max as f32)
            .collect()
    }
}
