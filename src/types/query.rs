//! Query and result types.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityId};
use super::path::Path;
use super::relation::{Direction, Relation, RelationId};
use super::value::Properties;

/// Kind of graph query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Nearest neighbors by embedding.
    Vector,
    /// Breadth-first expansion from a start entity.
    Traverse,
    /// Vector (or text) hits expanded by one hop.
    Hybrid,
    /// Undirected neighborhood around a center entity.
    Subgraph,
}

/// Free-form query parameters. Unused fields are ignored by the query type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParameters {
    /// Start entity (traverse / subgraph center).
    pub start_id: Option<EntityId>,
    /// End entity (path queries).
    pub end_id: Option<EntityId>,
    /// Query embedding.
    pub embedding: Option<Vec<f32>>,
    /// Query text (hybrid / text fallback).
    pub text: Option<String>,
    /// Maximum number of ranked hits.
    pub top_k: usize,
    /// Maximum hops (traverse) or radius (subgraph).
    pub max_depth: usize,
    /// Relation types to follow (empty = all).
    pub relation_types: Vec<String>,
    /// Expansion direction.
    pub direction: Direction,
}

impl Default for QueryParameters {
    fn default() -> Self {
        Self {
            start_id: None,
            end_id: None,
            embedding: None,
            text: None,
            top_k: 10,
            max_depth: 2,
            relation_types: Vec::new(),
            direction: Direction::Outgoing,
        }
    }
}

/// Entity filter shared by enumeration, vector search and queries.
///
/// Merged and deleted entities are excluded unless asked for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityFilter {
    /// Accepted entity types (empty = any).
    pub entity_types: Vec<String>,
    /// Tenant / partition key.
    pub tenant: Option<String>,
    /// Property equality constraints on top-level keys.
    pub properties: Properties,
    /// Minimum extraction confidence.
    pub min_confidence: Option<f32>,
    /// Include entities merged into a canonical entity.
    pub include_merged: bool,
    /// Include logically deleted entities.
    pub include_deleted: bool,
}

impl EntityFilter {
    /// Filter accepting any active entity.
    pub fn any() -> Self {
        Self::default()
    }

    /// Filter on a single type.
    pub fn of_type(entity_type: impl Into<String>) -> Self {
        Self {
            entity_types: vec![entity_type.into()],
            ..Self::default()
        }
    }

    /// Restrict to a tenant.
    pub fn in_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Include merged entities.
    pub fn with_merged(mut self) -> Self {
        self.include_merged = true;
        self
    }

    /// Whether the entity passes the filter.
    pub fn matches(&self, entity: &Entity) -> bool {
        if !self.include_merged && entity.is_merged() {
            return false;
        }
        if !self.include_deleted && entity.is_deleted() {
            return false;
        }
        if !self.entity_types.is_empty() && !self.entity_types.iter().any(|t| t == &entity.entity_type) {
            return false;
        }
        if let Some(tenant) = &self.tenant {
            if &entity.metadata.tenant != tenant {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if entity.metadata.confidence < min {
                return false;
            }
        }
        self.properties
            .iter()
            .all(|(k, v)| entity.properties.get(k) == Some(v))
    }
}

/// Offset pagination over an id-ordered enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Number of matching entities to skip.
    pub offset: usize,
    /// Maximum number of entities to return.
    pub limit: usize,
}

impl Page {
    /// Default page size for enumeration loops.
    pub const DEFAULT_LIMIT: usize = 256;

    /// First page.
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    /// The page following this one.
    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::first(Self::DEFAULT_LIMIT)
    }
}

/// A graph query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQuery {
    /// Query kind.
    pub query_type: QueryType,
    /// Parameters.
    #[serde(default)]
    pub parameters: QueryParameters,
    /// Entity filters.
    #[serde(default)]
    pub filters: EntityFilter,
}

impl GraphQuery {
    /// Traversal query.
    pub fn traverse(start: impl Into<EntityId>, max_depth: usize) -> Self {
        Self {
            query_type: QueryType::Traverse,
            parameters: QueryParameters {
                start_id: Some(start.into()),
                max_depth,
                ..QueryParameters::default()
            },
            filters: EntityFilter::default(),
        }
    }

    /// Vector query.
    pub fn vector(embedding: Vec<f32>, top_k: usize) -> Self {
        Self {
            query_type: QueryType::Vector,
            parameters: QueryParameters {
                embedding: Some(embedding),
                top_k,
                ..QueryParameters::default()
            },
            filters: EntityFilter::default(),
        }
    }

    /// Hybrid query over text and, when given, an embedding.
    pub fn hybrid(text: impl Into<String>, embedding: Option<Vec<f32>>, top_k: usize) -> Self {
        Self {
            query_type: QueryType::Hybrid,
            parameters: QueryParameters {
                text: Some(text.into()),
                embedding,
                top_k,
                ..QueryParameters::default()
            },
            filters: EntityFilter::default(),
        }
    }

    /// Subgraph query.
    pub fn subgraph(center: impl Into<EntityId>, radius: usize) -> Self {
        Self {
            query_type: QueryType::Subgraph,
            parameters: QueryParameters {
                start_id: Some(center.into()),
                max_depth: radius,
                ..QueryParameters::default()
            },
            filters: EntityFilter::default(),
        }
    }

    /// Replace the filters.
    pub fn with_filters(mut self, filters: EntityFilter) -> Self {
        self.filters = filters;
        self
    }
}

/// An entity with a ranking score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredEntity {
    /// The entity.
    pub entity: Entity,
    /// Score (higher is better).
    pub score: f32,
}

impl ScoredEntity {
    /// Create a scored entity.
    pub fn new(entity: Entity, score: f32) -> Self {
        Self { entity, score }
    }
}

/// Execution metadata attached to every result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Entities examined.
    pub entities_scanned: usize,
    /// Backend calls issued.
    pub backend_calls: usize,
    /// Entities returned.
    pub entities_returned: usize,
    /// Relations returned.
    pub relations_returned: usize,
    /// Paths returned.
    pub paths_returned: usize,
    /// Whether a text fallback replaced vector scoring.
    pub text_fallback: bool,
}

/// Result of a graph query.
///
/// Entity and relation lists are de-duplicated and kept in id order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphResult {
    /// Matched entities.
    pub entities: Vec<Entity>,
    /// Matched relations.
    pub relations: Vec<Relation>,
    /// Paths (traversal queries).
    pub paths: Vec<Path>,
    /// Scores of ranked entities.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<EntityId, f32>,
    /// Execution metadata.
    pub stats: ExecutionStats,
}

impl GraphResult {
    /// Materialize paths into a result with de-duplicated entity and relation sets.
    pub fn from_paths(paths: Vec<Path>) -> Self {
        let mut entities: BTreeMap<EntityId, Entity> = BTreeMap::new();
        let mut relations: BTreeMap<RelationId, Relation> = BTreeMap::new();
        for path in &paths {
            for entity in &path.entities {
                entities.entry(entity.id.clone()).or_insert_with(|| entity.clone());
            }
            for relation in &path.relations {
                relations.entry(relation.id.clone()).or_insert_with(|| relation.clone());
            }
        }
        let mut result = Self {
            entities: entities.into_values().collect(),
            relations: relations.into_values().collect(),
            paths,
            ..Self::default()
        };
        result.refresh_counts();
        result
    }

    /// Ranked entities in score order.
    pub fn from_scored(scored: Vec<ScoredEntity>) -> Self {
        let mut result = Self::default();
        for hit in scored {
            result.scores.insert(hit.entity.id.clone(), hit.score);
            result.entities.push(hit.entity);
        }
        result.refresh_counts();
        result
    }

    /// Add relations not already present.
    pub fn extend_relations(&mut self, relations: impl IntoIterator<Item = Relation>) {
        let mut seen: BTreeSet<RelationId> = self.relations.iter().map(|r| r.id.clone()).collect();
        for relation in relations {
            if seen.insert(relation.id.clone()) {
                self.relations.push(relation);
            }
        }
        self.refresh_counts();
    }

    /// Add entities not already present.
    pub fn extend_entities(&mut self, entities: impl IntoIterator<Item = Entity>) {
        let mut seen: BTreeSet<EntityId> = self.entities.iter().map(|e| e.id.clone()).collect();
        for entity in entities {
            if seen.insert(entity.id.clone()) {
                self.entities.push(entity);
            }
        }
        self.refresh_counts();
    }

    /// Ids of the result entities.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id.clone()).collect()
    }

    /// Sync the returned counts with the collections.
    pub fn refresh_counts(&mut self) {
        self.stats.entities_returned = self.entities.len();
        self.stats.relations_returned = self.relations.len();
        self.stats.paths_returned = self.paths.len();
    }
}
