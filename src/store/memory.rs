//! In-memory graph store.
//!
//! Entities live in an id-keyed arena with adjacency sets of relation ids, so
//! cyclic graphs never form reference cycles. `vector_search` is overridden
//! with a precomputed-norm index that ranks exactly like the default.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::embedding::{cosine_with_norm, norm};
use crate::error::{GraphError, ResourceKind, Result};
use crate::types::{
    Direction, Entity, EntityFilter, EntityId, Neighbor, Page, Relation, RelationId, ScoredEntity,
};

use super::{rank_scored, GraphStore};

/// Error type for in-memory store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InMemoryError {
    /// Entity not found.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),
    /// Relation not found.
    #[error("Relation not found: {0}")]
    RelationNotFound(RelationId),
    /// Relation endpoint missing.
    #[error("Relation {relation} references missing entity {entity}")]
    DanglingEndpoint {
        /// Relation being written.
        relation: RelationId,
        /// Missing endpoint.
        entity: EntityId,
    },
    /// Store was closed.
    #[error("Store is closed")]
    Closed,
}

impl From<InMemoryError> for GraphError {
    fn from(err: InMemoryError) -> Self {
        match err {
            InMemoryError::EntityNotFound(id) => GraphError::not_found(ResourceKind::Entity, id),
            InMemoryError::RelationNotFound(id) => GraphError::not_found(ResourceKind::Relation, id),
            InMemoryError::DanglingEndpoint { entity, .. } => GraphError::not_found(ResourceKind::Entity, entity),
            InMemoryError::Closed => GraphError::backend("in_memory", err, false),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    closed: bool,
    /// Entities by ID.
    entities: BTreeMap<EntityId, Entity>,
    /// Relations by ID.
    relations: BTreeMap<RelationId, Relation>,
    /// Source -> outgoing relation ids.
    outgoing: BTreeMap<EntityId, BTreeSet<RelationId>>,
    /// Target -> incoming relation ids.
    incoming: BTreeMap<EntityId, BTreeSet<RelationId>>,
    /// Entity type -> entity ids.
    by_type: BTreeMap<String, BTreeSet<EntityId>>,
    /// Entity id -> precomputed embedding norm.
    norms: BTreeMap<EntityId, f32>,
}

impl MemoryInner {
    fn check_open(&self) -> std::result::Result<(), InMemoryError> {
        if self.closed {
            Err(InMemoryError::Closed)
        } else {
            Ok(())
        }
    }

    fn unindex_entity(&mut self, entity: &Entity) {
        if let Some(ids) = self.by_type.get_mut(&entity.entity_type) {
            ids.remove(&entity.id);
            if ids.is_empty() {
                self.by_type.remove(&entity.entity_type);
            }
        }
        self.norms.remove(&entity.id);
    }

    fn index_entity(&mut self, entity: &Entity) {
        self.by_type
            .entry(entity.entity_type.clone())
            .or_default()
            .insert(entity.id.clone());
        if let Some(embedding) = &entity.embedding {
            self.norms.insert(entity.id.clone(), norm(embedding));
        }
    }

    fn unlink_relation(&mut self, relation: &Relation) {
        if let Some(ids) = self.outgoing.get_mut(&relation.source_id) {
            ids.remove(&relation.id);
        }
        if let Some(ids) = self.incoming.get_mut(&relation.target_id) {
            ids.remove(&relation.id);
        }
    }

    /// Ids of entities passing the type part of the filter, in id order.
    fn candidate_ids(&self, filter: &EntityFilter) -> Vec<EntityId> {
        if filter.entity_types.is_empty() {
            return self.entities.keys().cloned().collect();
        }
        let mut ids = BTreeSet::new();
        for entity_type in &filter.entity_types {
            if let Some(set) = self.by_type.get(entity_type) {
                ids.extend(set.iter().cloned());
            }
        }
        ids.into_iter().collect()
    }

    fn neighbors_via(
        &self,
        relation_ids: Option<&BTreeSet<RelationId>>,
        entity_id: &EntityId,
        relation_types: &[String],
        out: &mut BTreeMap<RelationId, Neighbor>,
    ) {
        let Some(relation_ids) = relation_ids else {
            return;
        };
        for rid in relation_ids {
            let Some(relation) = self.relations.get(rid) else {
                continue;
            };
            if !relation_types.is_empty() && !relation_types.iter().any(|t| t == &relation.relation_type) {
                continue;
            }
            let Some(other) = relation.other_end(entity_id) else {
                continue;
            };
            if let Some(entity) = self.entities.get(other) {
                out.entry(rid.clone())
                    .or_insert_with(|| Neighbor::new(relation.clone(), entity.clone()));
            }
        }
    }
}

/// In-memory graph store.
///
/// Uses BTreeMap/BTreeSet for deterministic iteration order and a
/// `parking_lot::RwLock` for many concurrent readers.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    inner: RwLock<MemoryInner>,
}

impl InMemoryGraphStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get number of entities (including merged and deleted ones).
    pub fn num_entities(&self) -> usize {
        self.inner.read().entities.len()
    }

    /// Get number of relations.
    pub fn num_relations(&self) -> usize {
        self.inner.read().relations.len()
    }

    /// All relations, ordered by (source, target, type, id).
    pub fn all_relations(&self) -> Vec<Relation> {
        let mut relations: Vec<Relation> = self.inner.read().relations.values().cloned().collect();
        relations.sort();
        relations
    }

    /// Entity types with at least one entity.
    pub fn entity_types(&self) -> Vec<String> {
        self.inner.read().by_type.keys().cloned().collect()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn initialize(&self) -> Result<()> {
        self.inner.write().closed = false;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.write().closed = true;
        Ok(())
    }

    async fn add_entity(&self, entity: Entity) -> Result<EntityId> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        let id = entity.id.clone();
        if let Some(previous) = inner.entities.remove(&id) {
            inner.unindex_entity(&previous);
        }
        inner.index_entity(&entity);
        inner.entities.insert(id.clone(), entity);
        Ok(id)
    }

    async fn get_entity(&self, id: &EntityId) -> Result<Entity> {
        let inner = self.inner.read();
        inner.check_open()?;
        inner
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| InMemoryError::EntityNotFound(id.clone()).into())
    }

    async fn add_relation(&self, relation: Relation) -> Result<RelationId> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        for endpoint in [&relation.source_id, &relation.target_id] {
            if !inner.entities.contains_key(endpoint) {
                return Err(InMemoryError::DanglingEndpoint {
                    relation: relation.id.clone(),
                    entity: endpoint.clone(),
                }
                .into());
            }
        }
        let id = relation.id.clone();
        if let Some(previous) = inner.relations.remove(&id) {
            inner.unlink_relation(&previous);
        }
        inner
            .outgoing
            .entry(relation.source_id.clone())
            .or_default()
            .insert(id.clone());
        inner
            .incoming
            .entry(relation.target_id.clone())
            .or_default()
            .insert(id.clone());
        inner.relations.insert(id.clone(), relation);
        Ok(id)
    }

    async fn get_relation(&self, id: &RelationId) -> Result<Relation> {
        let inner = self.inner.read();
        inner.check_open()?;
        inner
            .relations
            .get(id)
            .cloned()
            .ok_or_else(|| InMemoryError::RelationNotFound(id.clone()).into())
    }

    async fn get_neighbors(
        &self,
        entity_id: &EntityId,
        direction: Direction,
        relation_types: &[String],
    ) -> Result<Vec<Neighbor>> {
        let inner = self.inner.read();
        inner.check_open()?;
        if !inner.entities.contains_key(entity_id) {
            return Err(InMemoryError::EntityNotFound(entity_id.clone()).into());
        }

        // Keyed by relation id so self-loops under `Both` appear once.
        let mut found = BTreeMap::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            inner.neighbors_via(inner.outgoing.get(entity_id), entity_id, relation_types, &mut found);
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            inner.neighbors_via(inner.incoming.get(entity_id), entity_id, relation_types, &mut found);
        }
        Ok(found.into_values().collect())
    }

    async fn get_all_entities(&self, filter: &EntityFilter, page: Page) -> Result<Vec<Entity>> {
        let inner = self.inner.read();
        inner.check_open()?;
        Ok(inner
            .candidate_ids(filter)
            .iter()
            .filter_map(|id| inner.entities.get(id))
            .filter(|e| filter.matches(e))
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &EntityFilter,
    ) -> Result<Vec<ScoredEntity>> {
        let inner = self.inner.read();
        inner.check_open()?;
        let query_norm = norm(embedding);
        let mut scored: Vec<ScoredEntity> = inner
            .norms
            .iter()
            .filter_map(|(id, entity_norm)| {
                let entity = inner.entities.get(id)?;
                if !filter.matches(entity) {
                    return None;
                }
                let vector = entity.embedding.as_deref()?;
                let score = cosine_with_norm(embedding, query_norm, vector, *entity_norm)?;
                Some(ScoredEntity::new(entity.clone(), score))
            })
            .collect();
        rank_scored(&mut scored, top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entity(id: &str, entity_type: &str) -> Entity {
        Entity::new(id, entity_type, id.to_uppercase())
    }

    async fn store_with(entities: &[(&str, &str)], relations: &[(&str, &str, &str, &str)]) -> InMemoryGraphStore {
        let store = InMemoryGraphStore::new();
        for (id, t) in entities {
            store.add_entity(make_entity(id, t)).await.unwrap();
        }
        for (id, t, s, d) in relations {
            store.add_relation(Relation::new(*id, *t, *s, *d)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_add_and_get_entity() {
        let store = InMemoryGraphStore::new();
        store.add_entity(make_entity("a", "Person")).await.unwrap();

        let retrieved = store.get_entity(&EntityId::from("a")).await.unwrap();
        assert_eq!(retrieved.name, "A");

        let missing = store.get_entity(&EntityId::from("zz")).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_upsert_reindexes_type() {
        let store = InMemoryGraphStore::new();
        store.add_entity(make_entity("a", "Person")).await.unwrap();
        store.add_entity(make_entity("a", "Company")).await.unwrap();

        assert_eq!(store.num_entities(), 1);
        assert_eq!(store.entity_types(), vec!["Company".to_string()]);
    }

    #[tokio::test]
    async fn test_relation_requires_endpoints() {
        let store = store_with(&[("a", "Person")], &[]).await;
        let err = store
            .add_relation(Relation::new("r1", "KNOWS", "a", "ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.num_relations(), 0);
    }

    #[tokio::test]
    async fn test_neighbors_by_direction_and_type() {
        let store = store_with(
            &[("a", "Person"), ("b", "Person"), ("c", "Company")],
            &[("r1", "WORKS_FOR", "a", "c"), ("r2", "KNOWS", "b", "a"), ("r3", "SELF", "a", "a")],
        )
        .await;
        let a = EntityId::from("a");

        let out = store.get_neighbors(&a, Direction::Outgoing, &[]).await.unwrap();
        assert_eq!(out.len(), 2);

        let incoming = store.get_neighbors(&a, Direction::Incoming, &[]).await.unwrap();
        let ids: Vec<_> = incoming.iter().map(|n| n.entity.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let both = store.get_neighbors(&a, Direction::Both, &[]).await.unwrap();
        assert_eq!(both.len(), 3);

        let typed = store
            .get_neighbors(&a, Direction::Both, &["WORKS_FOR".to_string()])
            .await
            .unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].entity.id, EntityId::from("c"));
    }

    #[tokio::test]
    async fn test_enumeration_is_paginated_and_filtered() {
        let store = store_with(
            &[("a", "Person"), ("b", "Person"), ("c", "Company"), ("d", "Person")],
            &[],
        )
        .await;
        let filter = EntityFilter::of_type("Person");

        let first = store.get_all_entities(&filter, Page::first(2)).await.unwrap();
        let second = store.get_all_entities(&filter, Page::first(2).next()).await.unwrap();
        let ids: Vec<_> = first.iter().chain(second.iter()).map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "d"]);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = store_with(&[("a", "Person")], &[]).await;
        store.close().await.unwrap();
        let err = store.get_entity(&EntityId::from("a")).await.unwrap_err();
        assert_eq!(err.code(), "BACKEND_ERROR");

        store.initialize().await.unwrap();
        assert!(store.get_entity(&EntityId::from("a")).await.is_ok());
    }
}
