//! Ingestion boundary types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a source row maps to an entity (and the relations it implies).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMapping {
    /// Entity type produced by each row.
    pub entity_type: String,
    /// Field holding the entity id. A random id is generated when absent.
    #[serde(default)]
    pub id_field: Option<String>,
    /// Field holding the entity name.
    pub name_field: String,
    /// Source field -> property key. Unmapped fields are dropped.
    #[serde(default)]
    pub property_map: BTreeMap<String, String>,
    /// Relations derived from row fields.
    #[serde(default)]
    pub relations: Vec<RelationMapping>,
    /// Provenance source recorded on every entity.
    #[serde(default)]
    pub source: Option<String>,
    /// Extraction confidence recorded on every entity.
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    1.0
}

impl SchemaMapping {
    /// Mapping for a type with a name field.
    pub fn new(entity_type: impl Into<String>, name_field: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id_field: None,
            name_field: name_field.into(),
            property_map: BTreeMap::new(),
            relations: Vec::new(),
            source: None,
            confidence: 1.0,
        }
    }

    /// Take ids from a field.
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    /// Map a source field onto a property.
    pub fn map_property(mut self, field: impl Into<String>, property: impl Into<String>) -> Self {
        self.property_map.insert(field.into(), property.into());
        self
    }

    /// Add a derived relation.
    pub fn with_relation(mut self, relation: RelationMapping) -> Self {
        self.relations.push(relation);
        self
    }

    /// Record a provenance source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// A relation from the row's entity to the entity whose id is in `target_field`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationMapping {
    /// Relation type.
    pub relation_type: String,
    /// Field holding the target entity id.
    pub target_field: String,
    /// Point the relation at the row entity instead.
    #[serde(default)]
    pub reverse: bool,
}

impl RelationMapping {
    /// Create a relation mapping.
    pub fn new(relation_type: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            relation_type: relation_type.into(),
            target_field: target_field.into(),
            reverse: false,
        }
    }
}

/// A failed row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportError {
    /// Zero-based row index (`None` for batch items).
    pub row: Option<usize>,
    /// Error code.
    pub code: String,
    /// Message.
    pub message: String,
}

/// Throughput figures of an import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportMetrics {
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Rows per second.
    pub rows_per_sec: f64,
}

/// Outcome of an import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportResult {
    /// Entities written.
    pub entities_added: usize,
    /// Relations written.
    pub relations_added: usize,
    /// Rows seen.
    pub rows_processed: usize,
    /// Rows rejected.
    pub rows_failed: usize,
    /// Per-row errors.
    pub errors: Vec<ImportError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
    /// Performance metrics.
    pub metrics: ImportMetrics,
}

impl ImportResult {
    /// Whether every row succeeded.
    pub fn is_clean(&self) -> bool {
        self.rows_failed == 0 && self.errors.is_empty()
    }
}
