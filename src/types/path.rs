//! Paths through the knowledge graph.

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

use super::entity::{Entity, EntityId};
use super::relation::Relation;

/// Ordered sequence of entities interleaved with the relations linking them.
///
/// Invariant: `relations.len() == entities.len() - 1` for non-empty paths, and
/// `relations[i]` connects `entities[i]` and `entities[i + 1]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Path {
    /// Entities in traversal order.
    pub entities: Vec<Entity>,
    /// Relations between consecutive entities.
    pub relations: Vec<Relation>,
    /// Optional ranking score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Path {
    /// A zero-hop path holding a single entity.
    pub fn single(entity: Entity) -> Self {
        Self {
            entities: vec![entity],
            relations: Vec::new(),
            score: None,
        }
    }

    /// Return a copy extended by one hop.
    pub fn extended(&self, relation: Relation, entity: Entity) -> Self {
        let mut next = self.clone();
        next.relations.push(relation);
        next.entities.push(entity);
        next
    }

    /// Number of hops.
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    /// Whether the path holds no entity.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// First entity.
    pub fn start(&self) -> Option<&Entity> {
        self.entities.first()
    }

    /// Last entity.
    pub fn end(&self) -> Option<&Entity> {
        self.entities.last()
    }

    /// Entity ids in order.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id.clone()).collect()
    }

    /// Whether the path visits `id`.
    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.iter().any(|e| &e.id == id)
    }

    /// Product of relation confidences (1.0 for zero-hop paths).
    pub fn confidence(&self) -> f32 {
        self.relations.iter().map(|r| r.confidence).product()
    }

    /// Attach a score.
    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }

    /// Check the structural invariant.
    pub fn validate(&self) -> Result<()> {
        if self.entities.is_empty() {
            return if self.relations.is_empty() {
                Ok(())
            } else {
                Err(GraphError::validation("relations", "relations present on an empty path"))
            };
        }
        if self.relations.len() != self.entities.len() - 1 {
            return Err(GraphError::validation(
                "relations",
                format!(
                    "expected {} relations for {} entities, found {}",
                    self.entities.len() - 1,
                    self.entities.len(),
                    self.relations.len()
                ),
            ));
        }
        for (i, relation) in self.relations.iter().enumerate() {
            let (a, b) = (&self.entities[i].id, &self.entities[i + 1].id);
            if !relation.connects(a, b) {
                return Err(GraphError::validation(
                    format!("relations.{}", i),
                    format!("relation {} does not connect {} and {}", relation.id, a, b),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_keeps_invariant() {
        let a = Entity::new("a", "Person", "A");
        let c = Entity::new("c", "Company", "C");
        let path = Path::single(a).extended(Relation::new("r1", "WORKS_FOR", "a", "c"), c);

        assert_eq!(path.len(), 1);
        assert_eq!(path.entity_ids(), vec![EntityId::from("a"), EntityId::from("c")]);
        assert!(path.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_disconnected_relation() {
        let path = Path {
            entities: vec![Entity::new("a", "T", "A"), Entity::new("b", "T", "B")],
            relations: vec![Relation::new("r1", "R", "a", "z")],
            score: None,
        };
        match path.validate() {
            Err(GraphError::Validation { path, .. }) => assert_eq!(path, "relations.0"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_confidence_is_product() {
        let path = Path::single(Entity::new("a", "T", "A"))
            .extended(Relation::new("r1", "R", "a", "b").with_confidence(0.5), Entity::new("b", "T", "B"))
            .extended(Relation::new("r2", "R", "b", "c").with_confidence(0.5), Entity::new("c", "T", "C"));
        assert!((path.confidence() - 0.25).abs() < 1e-6);
    }
}
