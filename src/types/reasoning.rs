//! Evidence, reasoning results and inference rules.

use serde::{Deserialize, Serialize};

use super::entity::Entity;
use super::path::Path;
use super::relation::{Direction, Relation};

/// The piece of the graph that supports a conclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EvidenceSupport {
    /// A connecting path.
    Path(Path),
    /// A single entity.
    Entity(Entity),
    /// A single relation.
    Relation(Relation),
}

/// Support wrapped with a confidence score and its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Supporting graph fragment.
    pub support: EvidenceSupport,
    /// Confidence [0, 1].
    pub confidence: f32,
    /// Provenance source, if known.
    pub source: Option<String>,
}

impl Evidence {
    /// Evidence from a path; confidence is the product of relation confidences.
    pub fn from_path(path: Path) -> Self {
        let confidence = path.confidence();
        let source = path.relations.iter().find_map(|r| r.metadata.source.clone());
        Self {
            support: EvidenceSupport::Path(path),
            confidence,
            source,
        }
    }

    /// Evidence from a relation.
    pub fn from_relation(relation: Relation) -> Self {
        Self {
            confidence: relation.confidence,
            source: relation.metadata.source.clone(),
            support: EvidenceSupport::Relation(relation),
        }
    }

    /// Evidence from an entity.
    pub fn from_entity(entity: Entity) -> Self {
        Self {
            confidence: entity.metadata.confidence,
            source: entity.metadata.source.clone(),
            support: EvidenceSupport::Entity(entity),
        }
    }
}

/// Outcome of a reasoning call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningResult {
    /// Human-readable conclusion.
    pub conclusion: String,
    /// Overall confidence (max over evidence).
    pub confidence: f32,
    /// Supporting evidence, strongest first.
    pub evidence: Vec<Evidence>,
    /// Relations inferred by rules.
    pub inferred: Vec<Relation>,
    /// One line per reasoning step.
    pub steps: Vec<String>,
}

impl ReasoningResult {
    /// Whether any evidence was found.
    pub fn is_supported(&self) -> bool {
        !self.evidence.is_empty()
    }
}

/// One hop of a rule body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Relation type to follow.
    pub relation_type: String,
    /// Direction to follow it in.
    #[serde(default)]
    pub direction: Direction,
    /// Required type of the entity reached, if any.
    #[serde(default)]
    pub entity_type: Option<String>,
}

impl RuleCondition {
    /// Outgoing hop over `relation_type`.
    pub fn follow(relation_type: impl Into<String>) -> Self {
        Self {
            relation_type: relation_type.into(),
            direction: Direction::Outgoing,
            entity_type: None,
        }
    }

    /// Require the reached entity to have a type.
    pub fn reaching(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }
}

/// Chain-shaped rule: the conditions, applied hop by hop from a seed entity,
/// conclude a relation of type `conclusion` from the seed to the last entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRule {
    /// Rule name, recorded on inferred relations.
    pub name: String,
    /// Hops of the body.
    pub conditions: Vec<RuleCondition>,
    /// Relation type of the conclusion.
    pub conclusion: String,
    /// Rule confidence, multiplied into the inferred relation's confidence.
    pub confidence: f32,
}

impl InferenceRule {
    /// Create a rule.
    pub fn new(name: impl Into<String>, conditions: Vec<RuleCondition>, conclusion: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions,
            conclusion: conclusion.into(),
            confidence: 1.0,
        }
    }

    /// Set the rule confidence.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}
