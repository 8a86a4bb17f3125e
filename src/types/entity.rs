//! Entity types for the knowledge graph.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value::{Properties, PropertyValue};

/// Default tenant / partition key.
pub const DEFAULT_TENANT: &str = "default";

/// Unique identifier for an entity within a tenant scope.
///
/// Implements `Ord` so every result set can be ordered deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
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

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Provenance and lifecycle metadata of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityMetadata {
    /// Tenant / partition key.
    pub tenant: String,
    /// Source document or system the entity was extracted from.
    pub source: Option<String>,
    /// Declared quality of the source [0, 1], used for weighted voting.
    pub source_quality: Option<f32>,
    /// Extraction confidence [0, 1].
    pub confidence: f32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp (drives the `most_recent` strategy).
    pub updated_at: DateTime<Utc>,
    /// Canonical entity this one was merged into.
    pub merged_into: Option<EntityId>,
    /// Entities merged into this canonical entity.
    pub merged_from: Vec<EntityId>,
    /// Source ids accumulated through fusion.
    pub sources: Vec<String>,
    /// Logical deletion timestamp.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Properties whose values failed to reach consensus.
    pub unresolved_conflicts: Vec<String>,
    /// Candidate values of each unresolved property, strongest first.
    /// Kept out of `properties` so typed slots never hold a multi-value list.
    pub conflicting_values: BTreeMap<String, Vec<PropertyValue>>,
}

impl Default for EntityMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            tenant: DEFAULT_TENANT.to_string(),
            source: None,
            source_quality: None,
            confidence: 1.0,
            created_at: now,
            updated_at: now,
            merged_into: None,
            merged_from: Vec::new(),
            sources: Vec::new(),
            deleted_at: None,
            unresolved_conflicts: Vec::new(),
            conflicting_values: BTreeMap::new(),
        }
    }
}

/// A typed node of the knowledge graph.
///
/// Equality and ordering are by `id` only, mirroring how stores key entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique identifier.
    pub id: EntityId,
    /// Type tag resolved against the schema registry.
    pub entity_type: String,
    /// Representative name used for matching and ranking.
    pub name: String,
    /// Typed, possibly nested properties.
    #[serde(default)]
    pub properties: Properties,
    /// Optional embedding vector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Provenance metadata.
    #[serde(default)]
    pub metadata: EntityMetadata,
}

impl Entity {
    /// Create a new entity with empty properties.
    pub fn new(id: impl Into<EntityId>, entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            name: name.into(),
            properties: Properties::new(),
            embedding: None,
            metadata: EntityMetadata::default(),
        }
    }

    /// Set a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Replace all properties.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Attach an embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Record the source and its extraction confidence.
    pub fn with_source(mut self, source: impl Into<String>, confidence: f32) -> Self {
        let source = source.into();
        self.metadata.sources = vec![source.clone()];
        self.metadata.source = Some(source);
        self.metadata.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Declare the quality of the source.
    pub fn with_source_quality(mut self, quality: f32) -> Self {
        self.metadata.source_quality = Some(quality.clamp(0.0, 1.0));
        self
    }

    /// Set the tenant / partition key.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.metadata.tenant = tenant.into();
        self
    }

    /// Set the last-updated timestamp.
    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.metadata.updated_at = updated_at;
        self
    }

    /// Get a top-level property.
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Whether the entity was merged into a canonical entity.
    pub fn is_merged(&self) -> bool {
        self.metadata.merged_into.is_some()
    }

    /// Whether the entity was logically deleted.
    pub fn is_deleted(&self) -> bool {
        self.metadata.deleted_at.is_some()
    }

    /// Neither merged nor deleted.
    pub fn is_active(&self) -> bool {
        !self.is_merged() && !self.is_deleted()
    }

    /// Name followed by every string property, for text scoring.
    pub fn representative_text(&self) -> String {
        let mut text = self.name.clone();
        for value in self.properties.values() {
            collect_strings(value, &mut text);
        }
        text
    }
}

fn collect_strings(value: &PropertyValue, out: &mut String) {
    match value {
        PropertyValue::String(s) => {
            out.push(' ');
            out.push_str(s);
        }
        PropertyValue::List(items) => items.iter().for_each(|v| collect_strings(v, out)),
        PropertyValue::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entity {}

impl PartialOrd for Entity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}
