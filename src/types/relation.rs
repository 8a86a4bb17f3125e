//! Relation (edge) types for the knowledge graph.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{Entity, EntityId, DEFAULT_TENANT};
use super::value::{Properties, PropertyValue};

/// Unique identifier for a relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationId(String);

impl RelationId {
    /// Create an id from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Direction of neighbor expansion relative to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Follow relations where the entity is the source.
    #[default]
    Outgoing,
    /// Follow relations where the entity is the target.
    Incoming,
    /// Follow both.
    Both,
}

impl Direction {
    /// Opposite direction (`Both` stays `Both`).
    pub fn reverse(self) -> Self {
        match self {
            Self::Outgoing => Self::Incoming,
            Self::Incoming => Self::Outgoing,
            Self::Both => Self::Both,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outgoing => write!(f, "outgoing"),
            Self::Incoming => write!(f, "incoming"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// Provenance metadata of a relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationMetadata {
    /// Tenant / partition key.
    pub tenant: String,
    /// Source document or system.
    pub source: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Inference rule that produced this relation, if any.
    pub inferred_by: Option<String>,
    /// Relation this one was projected from during fusion.
    pub projected_from: Option<RelationId>,
}

impl Default for RelationMetadata {
    fn default() -> Self {
        Self {
            tenant: DEFAULT_TENANT.to_string(),
            source: None,
            created_at: Utc::now(),
            inferred_by: None,
            projected_from: None,
        }
    }
}

/// A typed, directed relation between two entities.
///
/// Canonical ordering: (source, target, relation_type, id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    /// Unique identifier.
    pub id: RelationId,
    /// Type tag resolved against the schema registry.
    pub relation_type: String,
    /// Source entity.
    pub source_id: EntityId,
    /// Target entity.
    pub target_id: EntityId,
    /// Properties.
    #[serde(default)]
    pub properties: Properties,
    /// Confidence [0, 1].
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    /// Provenance metadata.
    #[serde(default)]
    pub metadata: RelationMetadata,
}

fn default_confidence() -> f32 {
    1.0
}

impl Relation {
    /// Create a new relation.
    pub fn new(
        id: impl Into<RelationId>,
        relation_type: impl Into<String>,
        source_id: impl Into<EntityId>,
        target_id: impl Into<EntityId>,
    ) -> Self {
        Self {
            id: id.into(),
            relation_type: relation_type.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            properties: Properties::new(),
            confidence: 1.0,
            metadata: RelationMetadata::default(),
        }
    }

    /// Create a relation with a generated id.
    pub fn generated(
        relation_type: impl Into<String>,
        source_id: impl Into<EntityId>,
        target_id: impl Into<EntityId>,
    ) -> Self {
        Self::new(RelationId::generate(), relation_type, source_id, target_id)
    }

    /// Set a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the confidence.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Given one endpoint, return the other.
    pub fn other_end(&self, id: &EntityId) -> Option<&EntityId> {
        if &self.source_id == id {
            Some(&self.target_id)
        } else if &self.target_id == id {
            Some(&self.source_id)
        } else {
            None
        }
    }

    /// Whether the relation links `a` and `b` in either orientation.
    pub fn connects(&self, a: &EntityId, b: &EntityId) -> bool {
        (&self.source_id == a && &self.target_id == b) || (&self.source_id == b && &self.target_id == a)
    }

    /// Whether the relation touches `id` in the given direction.
    pub fn touches(&self, id: &EntityId, direction: Direction) -> bool {
        match direction {
            Direction::Outgoing => &self.source_id == id,
            Direction::Incoming => &self.target_id == id,
            Direction::Both => &self.source_id == id || &self.target_id == id,
        }
    }
}

impl PartialEq for Relation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Relation {}

impl PartialOrd for Relation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Relation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.source_id
            .cmp(&other.source_id)
            .then_with(|| self.target_id.cmp(&other.target_id))
            .then_with(|| self.relation_type.cmp(&other.relation_type))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A neighbor reached through a relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    /// Relation that was followed.
    pub relation: Relation,
    /// Entity at the other end.
    pub entity: Entity,
}

impl Neighbor {
    /// Create a neighbor.
    pub fn new(relation: Relation, entity: Entity) -> Self {
        Self { relation, entity }
    }
}

/// Sort neighbors by (entity id, relation id) so every backend yields the same order.
pub fn sort_neighbors(neighbors: &mut [Neighbor]) {
    neighbors.sort_by(|a, b| {
        a.entity
            .id
            .cmp(&b.entity.id)
            .then_with(|| a.relation.id.cmp(&b.relation.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_ordering() {
        let r1 = Relation::new("r1", "KNOWS", "a", "b");
        let r2 = Relation::new("r2", "KNOWS", "a", "c");
        let r3 = Relation::new("r3", "KNOWS", "b", "a");
        assert!(r1 < r2);
        assert!(r2 < r3);
    }

    #[test]
    fn test_other_end_and_touches() {
        let rel = Relation::new("r1", "WORKS_FOR", "a", "c");
        let a = EntityId::from("a");
        let c = EntityId::from("c");
        assert_eq!(rel.other_end(&a), Some(&c));
        assert_eq!(rel.other_end(&EntityId::from("z")), None);
        assert!(rel.touches(&a, Direction::Outgoing));
        assert!(!rel.touches(&a, Direction::Incoming));
        assert!(rel.touches(&c, Direction::Both));
        assert!(rel.connects(&c, &a));
    }

    #[test]
    fn test_direction_reverse() {
        assert_eq!(Direction::Outgoing.reverse(), Direction::Incoming);
        assert_eq!(Direction::Both.reverse(), Direction::Both);
    }
}
