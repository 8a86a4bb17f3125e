//! Core types for the graph kernel.

pub mod value;
pub mod entity;
pub mod relation;
pub mod path;
pub mod query;
pub mod reasoning;
pub mod import;

pub use value::{Properties, PropertyValue};
pub use entity::{Entity, EntityId, EntityMetadata, DEFAULT_TENANT};
pub use relation::{sort_neighbors, Direction, Neighbor, Relation, RelationId, RelationMetadata};
pub use path::Path;
pub use query::{
    EntityFilter, ExecutionStats, GraphQuery, GraphResult, Page, QueryParameters, QueryType,
    ScoredEntity,
};
pub use reasoning::{Evidence, EvidenceSupport, InferenceRule, ReasoningResult, RuleCondition};
pub use import::{ImportError, ImportMetrics, ImportResult, RelationMapping, SchemaMapping};
