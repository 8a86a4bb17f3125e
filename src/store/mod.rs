//! Graph storage backends.
//!
//! ## Two-tier interface
//!
//! A backend implements the eight Tier-1 primitives:
//!
//! | Method | Contract |
//! |--------|----------|
//! | `initialize` / `close` | resource lifecycle |
//! | `add_entity` | upsert by id |
//! | `get_entity` | `NotFound` when absent |
//! | `add_relation` | upsert by id; `NotFound` when an endpoint is absent |
//! | `get_relation` | `NotFound` when absent |
//! | `get_neighbors` | relations touching an entity in a direction, with the entity at the other end |
//! | `get_all_entities` | id-ordered, filtered, paginated enumeration |
//!
//! Everything else (traversal, path finding, subgraphs, vector search,
//! hybrid queries, updates and logical deletes) has a default implementation
//! written purely against Tier 1. Backends may override any Tier-2 method for
//! performance, but must keep its observable behavior.

pub mod memory;
pub mod traversal;
pub mod rate_limit;
pub mod resilient;
pub mod validated;

#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::embedding::{cosine_with_norm, norm};
use crate::error::{GraphError, Result};
use crate::text::{token_overlap, token_set};
use crate::types::{
    Direction, Entity, EntityFilter, EntityId, GraphQuery, GraphResult, Neighbor, Page, Path,
    Properties, QueryType, Relation, RelationId, ScoredEntity,
};

pub use traversal::{bidirectional_search, Traversal};

/// Trait for graph storage backends.
///
/// Implementations must guarantee deterministic ordering of enumeration
/// results (entity id ascending).
#[async_trait]
pub trait GraphStore: Send + Sync {
    // ── Tier 1 ──────────────────────────────────────────────────────────

    /// Acquire backend resources (connections, tables).
    async fn initialize(&self) -> Result<()>;

    /// Release backend resources.
    async fn close(&self) -> Result<()>;

    /// Insert or replace an entity.
    async fn add_entity(&self, entity: Entity) -> Result<EntityId>;

    /// Fetch an entity.
    async fn get_entity(&self, id: &EntityId) -> Result<Entity>;

    /// Insert or replace a relation. Both endpoints must exist.
    async fn add_relation(&self, relation: Relation) -> Result<RelationId>;

    /// Fetch a relation.
    async fn get_relation(&self, id: &RelationId) -> Result<Relation>;

    /// Relations touching `entity_id` in `direction`, each with the entity at
    /// the other end. An empty `relation_types` accepts every type.
    async fn get_neighbors(
        &self,
        entity_id: &EntityId,
        direction: Direction,
        relation_types: &[String],
    ) -> Result<Vec<Neighbor>>;

    /// Entities passing `filter`, ordered by id, windowed by `page`.
    async fn get_all_entities(&self, filter: &EntityFilter, page: Page) -> Result<Vec<Entity>>;

    // ── Tier 2 ──────────────────────────────────────────────────────────

    /// Fetch many entities, skipping absent ids. Order follows `ids`.
    async fn get_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_entity(id).await {
                Ok(entity) => out.push(entity),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Merge `patch` into an entity's properties (null values remove keys).
    async fn update_entity(&self, id: &EntityId, patch: Properties) -> Result<Entity> {
        let mut entity = self.get_entity(id).await?;
        for (key, value) in patch {
            if matches!(value, crate::types::PropertyValue::Null) {
                entity.properties.remove(&key);
            } else {
                entity.properties.insert(key, value);
            }
        }
        entity.metadata.updated_at = Utc::now();
        self.add_entity(entity.clone()).await?;
        Ok(entity)
    }

    /// Logically delete an entity. It stays retrievable by id but is hidden
    /// from enumeration, search and traversal.
    async fn delete_entity(&self, id: &EntityId) -> Result<()> {
        let mut entity = self.get_entity(id).await?;
        if entity.metadata.deleted_at.is_none() {
            let now = Utc::now();
            entity.metadata.deleted_at = Some(now);
            entity.metadata.updated_at = now;
            self.add_entity(entity).await?;
        }
        Ok(())
    }

    /// Lazy breadth-first traversal in an explicit direction.
    fn traversal(
        &self,
        start: &EntityId,
        max_depth: usize,
        relation_types: &[String],
        direction: Direction,
    ) -> Traversal<'_, Self>
    where
        Self: Sized,
    {
        Traversal::new(self, start.clone(), max_depth, relation_types.to_vec(), direction)
    }

    /// Breadth-first traversal over outgoing relations.
    ///
    /// One path per reachable entity within `max_depth` hops, shortest first.
    async fn traverse(
        &self,
        start: &EntityId,
        max_depth: usize,
        relation_types: &[String],
    ) -> Result<Vec<Path>> {
        self.traverse_directed(start, max_depth, relation_types, Direction::Outgoing)
            .await
    }

    /// Breadth-first traversal in an explicit direction.
    async fn traverse_directed(
        &self,
        start: &EntityId,
        max_depth: usize,
        relation_types: &[String],
        direction: Direction,
    ) -> Result<Vec<Path>> {
        Traversal::new(self, start.clone(), max_depth, relation_types.to_vec(), direction)
            .collect()
            .await
    }

    /// Shortest path from `start` to `end` within `max_depth` hops.
    ///
    /// Returns at most one path; empty when none exists.
    async fn find_paths(&self, start: &EntityId, end: &EntityId, max_depth: usize) -> Result<Vec<Path>> {
        Ok(bidirectional_search(self, start, end, max_depth)
            .await?
            .into_iter()
            .collect())
    }

    /// Everything within `radius` undirected hops of `center`.
    ///
    /// Entities and relations are de-duplicated; relations between reached
    /// entities that are not on a traversal path are included too.
    async fn subgraph_query(&self, center: &EntityId, radius: usize) -> Result<GraphResult> {
        let started = Instant::now();
        let mut walk = Traversal::new(self, center.clone(), radius, Vec::new(), Direction::Both);
        let mut paths = Vec::new();
        while let Some(path) = walk.next_path().await? {
            paths.push(path);
        }
        let calls = walk.neighbor_calls();

        let mut result = GraphResult::from_paths(paths);
        if result.entities.is_empty() {
            result.entities.push(self.get_entity(center).await?);
        }

        let reached: BTreeSet<EntityId> = result.entity_ids().into_iter().collect();
        let ids: Vec<EntityId> = reached.iter().cloned().collect();
        let outgoing = traversal::neighbors_of(self, &ids, Direction::Outgoing).await?;
        let induced: Vec<Relation> = outgoing
            .into_values()
            .flatten()
            .filter(|n| reached.contains(&n.relation.target_id))
            .map(|n| n.relation)
            .collect();
        result.extend_relations(induced);
        result.relations.sort_by(|a, b| a.id.cmp(&b.id));
        result.entities.sort_by(|a, b| a.id.cmp(&b.id));

        result.stats.backend_calls = calls + ids.len();
        result.stats.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Top-k entities by cosine similarity to `embedding`.
    ///
    /// Entities without an embedding of the same dimension are skipped.
    /// Ties are broken by entity id ascending.
    async fn vector_search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &EntityFilter,
    ) -> Result<Vec<ScoredEntity>> {
        let query_norm = norm(embedding);
        let mut scored = Vec::new();
        let mut page = Page::default();
        loop {
            let batch = self.get_all_entities(filter, page).await?;
            let exhausted = batch.len() < page.limit;
            for entity in batch {
                let score = entity
                    .embedding
                    .as_deref()
                    .and_then(|v| cosine_with_norm(embedding, query_norm, v, norm(v)));
                if let Some(score) = score {
                    scored.push(ScoredEntity::new(entity, score));
                }
            }
            if exhausted {
                break;
            }
            page = page.next();
        }
        rank_scored(&mut scored, top_k);
        Ok(scored)
    }

    /// Top-k entities by token overlap with `text` (name and string properties).
    async fn text_search(&self, text: &str, top_k: usize, filter: &EntityFilter) -> Result<Vec<ScoredEntity>> {
        let query = token_set(text);
        let mut scored = Vec::new();
        let mut page = Page::default();
        loop {
            let batch = self.get_all_entities(filter, page).await?;
            let exhausted = batch.len() < page.limit;
            for entity in batch {
                let score = token_overlap(&query, &token_set(&entity.representative_text())) as f32;
                if score > 0.0 {
                    scored.push(ScoredEntity::new(entity, score));
                }
            }
            if exhausted {
                break;
            }
            page = page.next();
        }
        rank_scored(&mut scored, top_k);
        Ok(scored)
    }

    /// Execute a [`GraphQuery`].
    async fn query(&self, query: &GraphQuery) -> Result<GraphResult> {
        let started = Instant::now();
        let params = &query.parameters;
        let mut result = match query.query_type {
            QueryType::Vector => {
                let embedding = params
                    .embedding
                    .as_deref()
                    .ok_or_else(|| GraphError::validation("parameters.embedding", "vector query needs an embedding"))?;
                GraphResult::from_scored(self.vector_search(embedding, params.top_k, &query.filters).await?)
            }
            QueryType::Traverse => {
                let start = required_start(query)?;
                let paths = self
                    .traverse_directed(start, params.max_depth, &params.relation_types, params.direction)
                    .await?;
                let paths = paths
                    .into_iter()
                    .filter(|p| p.end().map(|e| query.filters.matches(e)).unwrap_or(false))
                    .collect();
                GraphResult::from_paths(paths)
            }
            QueryType::Subgraph => {
                let start = required_start(query)?;
                self.subgraph_query(start, params.max_depth).await?
            }
            QueryType::Hybrid => self.hybrid_query(query).await?,
        };
        result.stats.duration_ms = started.elapsed().as_millis() as u64;
        result.refresh_counts();
        debug!(
            query_type = ?query.query_type,
            entities = result.entities.len(),
            relations = result.relations.len(),
            duration_ms = result.stats.duration_ms,
            "Query executed"
        );
        Ok(result)
    }

    /// Vector hits (or text hits without an embedding) expanded by one hop.
    async fn hybrid_query(&self, query: &GraphQuery) -> Result<GraphResult> {
        let params = &query.parameters;
        let (hits, text_fallback) = match params.embedding.as_deref() {
            Some(embedding) => (self.vector_search(embedding, params.top_k, &query.filters).await?, false),
            None => {
                let text = params
                    .text
                    .as_deref()
                    .ok_or_else(|| GraphError::validation("parameters.text", "hybrid query needs text or an embedding"))?;
                (self.text_search(text, params.top_k, &query.filters).await?, true)
            }
        };
        let scanned = hits.len();
        let hit_ids: Vec<EntityId> = hits.iter().map(|h| h.entity.id.clone()).collect();

        let mut result = GraphResult::from_scored(hits);
        let expansion = traversal::neighbors_of(self, &hit_ids, Direction::Both).await?;
        let mut relations = Vec::new();
        let mut neighbors = Vec::new();
        for neighbor in expansion.into_values().flatten() {
            if !neighbor.entity.is_active() {
                continue;
            }
            relations.push(neighbor.relation);
            neighbors.push(neighbor.entity);
        }
        result.extend_entities(neighbors);
        result.extend_relations(relations);
        result.stats.entities_scanned = scanned;
        result.stats.backend_calls = hit_ids.len();
        result.stats.text_fallback = text_fallback;
        Ok(result)
    }
}

fn required_start(query: &GraphQuery) -> Result<&EntityId> {
    query
        .parameters
        .start_id
        .as_ref()
        .ok_or_else(|| GraphError::validation("parameters.start_id", "query needs a start entity"))
}

/// Sort by score descending, then id ascending, and keep `top_k`.
pub fn rank_scored(scored: &mut Vec<ScoredEntity>, top_k: usize) {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.entity.id.cmp(&b.entity.id))
    });
    scored.truncate(top_k);
}

/// Degree of each entity in `ids` (relations in both directions).
pub async fn degrees<S: GraphStore + ?Sized>(store: &S, ids: &[EntityId]) -> Result<BTreeMap<EntityId, usize>> {
    let neighbors = traversal::neighbors_of(store, ids, Direction::Both).await?;
    Ok(neighbors.into_iter().map(|(id, n)| (id, n.len())).collect())
}

/// Shared handles forward every call, Tier-2 overrides included.
#[async_trait]
impl<T: GraphStore + ?Sized> GraphStore for std::sync::Arc<T> {
    async fn initialize(&self) -> Result<()> {
        (**self).initialize().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    async fn add_entity(&self, entity: Entity) -> Result<EntityId> {
        (**self).add_entity(entity).await
    }

    async fn get_entity(&self, id: &EntityId) -> Result<Entity> {
        (**self).get_entity(id).await
    }

    async fn add_relation(&self, relation: Relation) -> Result<RelationId> {
        (**self).add_relation(relation).await
    }

    async fn get_relation(&self, id: &RelationId) -> Result<Relation> {
        (**self).get_relation(id).await
    }

    async fn get_neighbors(
        &self,
        entity_id: &EntityId,
        direction: Direction,
        relation_types: &[String],
    ) -> Result<Vec<Neighbor>> {
        (**self).get_neighbors(entity_id, direction, relation_types).await
    }

    async fn get_all_entities(&self, filter: &EntityFilter, page: Page) -> Result<Vec<Entity>> {
        (**self).get_all_entities(filter, page).await
    }

    async fn get_entities(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        (**self).get_entities(ids).await
    }

    async fn update_entity(&self, id: &EntityId, patch: Properties) -> Result<Entity> {
        (**self).update_entity(id, patch).await
    }

    async fn delete_entity(&self, id: &EntityId) -> Result<()> {
        (**self).delete_entity(id).await
    }

    async fn traverse_directed(
        &self,
        start: &EntityId,
        max_depth: usize,
        relation_types: &[String],
        direction: Direction,
    ) -> Result<Vec<Path>> {
        (**self).traverse_directed(start, max_depth, relation_types, direction).await
    }

    async fn find_paths(&self, start: &EntityId, end: &EntityId, max_depth: usize) -> Result<Vec<Path>> {
        (**self).find_paths(start, end, max_depth).await
    }

    async fn subgraph_query(&self, center: &EntityId, radius: usize) -> Result<GraphResult> {
        (**self).subgraph_query(center, radius).await
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &EntityFilter,
    ) -> Result<Vec<ScoredEntity>> {
        (**self).vector_search(embedding, top_k, filter).await
    }

    async fn text_search(&self, text: &str, top_k: usize, filter: &EntityFilter) -> Result<Vec<ScoredEntity>> {
        (**self).text_search(text, top_k, filter).await
    }

    async fn query(&self, query: &GraphQuery) -> Result<GraphResult> {
        (**self).query(query).await
    }

    async fn hybrid_query(&self, query: &GraphQuery) -> Result<GraphResult> {
        (**self).hybrid_query(query).await
    }
}

pub use memory::InMemoryGraphStore;
pub use rate_limit::{RateLimitConfig, TokenBucket};
pub use resilient::ResilientStore;
pub use validated::ValidatedStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresGraphStore;
