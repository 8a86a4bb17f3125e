//! Store wrapper that checks writes against the schema registry.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::schema::SchemaLookup;
use crate::types::{Direction, Entity, EntityFilter, EntityId, Neighbor, Page, Relation, RelationId, ScoredEntity};

use super::GraphStore;

/// Validates entity properties and relation endpoint types before writing.
///
/// Entities of a type the registry does not know are rejected with
/// `NotFound`. Reads pass straight through.
pub struct ValidatedStore<S, L> {
    inner: S,
    schema: L,
}

impl<S: GraphStore, L: SchemaLookup> ValidatedStore<S, L> {
    /// Wrap `inner`, validating against `schema`.
    pub fn new(inner: S, schema: L) -> Self {
        Self { inner, schema }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The schema lookup.
    pub fn schema(&self) -> &L {
        &self.schema
    }
}

#[async_trait]
impl<S: GraphStore, L: SchemaLookup> GraphStore for ValidatedStore<S, L> {
    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn add_entity(&self, entity: Entity) -> Result<EntityId> {
        self.schema.validate_entity(&entity.entity_type, &entity.properties)?;
        self.inner.add_entity(entity).await
    }

    async fn get_entity(&self, id: &EntityId) -> Result<Entity> {
        self.inner.get_entity(id).await
    }

    async fn add_relation(&self, relation: Relation) -> Result<RelationId> {
        let source = self.inner.get_entity(&relation.source_id).await?;
        let target = self.inner.get_entity(&relation.target_id).await?;
        self.schema
            .validate_relation(&relation.relation_type, &source.entity_type, &target.entity_type)?;
        self.schema
            .validate_relation_properties(&relation.relation_type, &relation.properties)?;
        debug!(
            relation_id = %relation.id,
            relation_type = %relation.relation_type,
            "Relation passed schema checks"
        );
        self.inner.add_relation(relation).await
    }

    async fn get_relation(&self, id: &RelationId) -> Result<Relation> {
        self.inner.get_relation(id).await
    }

    async fn get_neighbors(
        &self,
        entity_id: &EntityId,
        direction: Direction,
        relation_types: &[String],
    ) -> Result<Vec<Neighbor>> {
        self.inner.get_neighbors(entity_id, direction, relation_types).await
    }

    async fn get_all_entities(&self, filter: &EntityFilter, page: Page) -> Result<Vec<Entity>> {
        self.inner.get_all_entities(filter, page).await
    }

    async fn vector_search(&self, embedding: &[f32], top_k: usize, filter: &EntityFilter) -> Result<Vec<ScoredEntity>> {
        self.inner.vector_search(embedding, top_k, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::schema::{EntityType, PropertySchema, RelationType, SchemaRegistry};
    use crate::store::InMemoryGraphStore;
    use std::sync::Arc;

    fn registry() -> Arc<SchemaRegistry> {
        let registry = Arc::new(SchemaRegistry::new());
        registry
            .create_entity_type(
                EntityType::new("Person")
                    .with_property("age", PropertySchema::integer().bounded(Some(0.0), Some(150.0))),
            )
            .unwrap();
        registry.create_entity_type(EntityType::new("Company")).unwrap();
        registry
            .create_relation_type(RelationType::new("WORKS_FOR").between(["Person"], ["Company"]))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_rejects_invalid_entity() {
        let store = ValidatedStore::new(InMemoryGraphStore::new(), registry());
        let err = store
            .add_entity(Entity::new("a", "Person", "Alice").with_property("age", "old"))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation { ref path, .. } if path == "age"));

        let err = store.add_entity(Entity::new("x", "Planet", "Mars")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_checks_relation_endpoint_types() {
        let store = ValidatedStore::new(InMemoryGraphStore::new(), registry());
        store.add_entity(Entity::new("a", "Person", "A").with_property("age", 30i64)).await.unwrap();
        store.add_entity(Entity::new("b", "Person", "B")).await.unwrap();
        store.add_entity(Entity::new("c", "Company", "C")).await.unwrap();

        store.add_relation(Relation::new("r1", "WORKS_FOR", "a", "c")).await.unwrap();
        let err = store
            .add_relation(Relation::new("r2", "WORKS_FOR", "a", "b"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(store.inner().num_relations(), 1);
    }
}
