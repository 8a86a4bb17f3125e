//! Ingestion boundary: mapped rows and pre-built batches into the store.
//!
//! Rows are validated against the schema before anything is written. A bad
//! row is recorded in the result and skipped; it never aborts the import.
//! Relations are written after every entity of the import, so a row may
//! point at an entity defined further down.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, warn};

use crate::canonical::canonical_hash_hex;
use crate::error::{GraphError, Result};
use crate::runnable::{OperationContext, Runner};
use crate::schema::SchemaLookup;
use crate::store::GraphStore;
use crate::types::{
    Entity, EntityId, ImportError, ImportMetrics, ImportResult, Properties, Relation, RelationId, SchemaMapping,
};

/// Writes mapped data through the runner.
pub struct Importer<S: GraphStore + ?Sized> {
    store: Arc<S>,
    schema: Option<Arc<dyn SchemaLookup>>,
    runner: Runner,
}

impl<S: GraphStore + ?Sized> Importer<S> {
    /// Importer without schema checks, writing directly.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            schema: None,
            runner: Runner::direct(),
        }
    }

    /// Validate rows against `schema`.
    pub fn with_schema(mut self, schema: Arc<dyn SchemaLookup>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Route writes through `runner`.
    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runner = runner;
        self
    }

    /// Import JSON object rows through `mapping`.
    pub async fn import_rows(&self, rows: &[Value], mapping: &SchemaMapping) -> Result<ImportResult> {
        let started = Instant::now();
        let mut result = ImportResult {
            rows_processed: rows.len(),
            ..ImportResult::default()
        };
        let mut failed: BTreeSet<usize> = BTreeSet::new();
        let mut unmapped: BTreeSet<String> = BTreeSet::new();
        let mut pending: Vec<(usize, Relation)> = Vec::new();

        for (i, row) in rows.iter().enumerate() {
            let entity = match map_row(row, mapping, &mut unmapped) {
                Ok(entity) => entity,
                Err(e) => {
                    record(&mut result, &mut failed, Some(i), &e);
                    continue;
                }
            };
            for relation_mapping in &mapping.relations {
                let Some(target) = row.get(&relation_mapping.target_field).and_then(json_id) else {
                    result.warnings.push(format!(
                        "row {}: `{}` is empty, no {} relation",
                        i, relation_mapping.target_field, relation_mapping.relation_type
                    ));
                    continue;
                };
                let (source, target) = if relation_mapping.reverse {
                    (target, entity.id.clone())
                } else {
                    (entity.id.clone(), target)
                };
                pending.push((i, derived_relation(&relation_mapping.relation_type, source, target)?));
            }
            match self.write_entity(entity).await {
                Ok(()) => result.entities_added += 1,
                Err(e) => record(&mut result, &mut failed, Some(i), &e),
            }
        }

        for (i, relation) in pending {
            if failed.contains(&i) {
                continue;
            }
            match self.write_relation(relation).await {
                Ok(()) => result.relations_added += 1,
                Err(e) => record(&mut result, &mut failed, Some(i), &e),
            }
        }

        result
            .warnings
            .extend(unmapped.into_iter().map(|field| format!("field `{}` is not mapped and was dropped", field)));
        result.rows_failed = failed.len();
        finish(&mut result, started);
        info!(
            entity_type = %mapping.entity_type,
            rows = result.rows_processed,
            failed = result.rows_failed,
            entities = result.entities_added,
            relations = result.relations_added,
            duration_ms = result.metrics.duration_ms,
            "Row import complete"
        );
        Ok(result)
    }

    /// Import pre-built entities, then relations.
    pub async fn import_batch(&self, entities: Vec<Entity>, relations: Vec<Relation>) -> Result<ImportResult> {
        let started = Instant::now();
        let mut result = ImportResult {
            rows_processed: entities.len() + relations.len(),
            ..ImportResult::default()
        };
        let mut failed = BTreeSet::new();
        for entity in entities {
            match self.write_entity(entity).await {
                Ok(()) => result.entities_added += 1,
                Err(e) => record(&mut result, &mut failed, None, &e),
            }
        }
        for relation in relations {
            match self.write_relation(relation).await {
                Ok(()) => result.relations_added += 1,
                Err(e) => record(&mut result, &mut failed, None, &e),
            }
        }
        result.rows_failed = result.errors.len();
        finish(&mut result, started);
        Ok(result)
    }

    async fn write_entity(&self, entity: Entity) -> Result<()> {
        if let Some(schema) = &self.schema {
            schema.validate_entity(&entity.entity_type, &entity.properties)?;
        }
        let op = OperationContext::new("import.add_entity", &entity.id);
        self.runner.call(&op, || self.store.add_entity(entity.clone())).await?;
        Ok(())
    }

    async fn write_relation(&self, relation: Relation) -> Result<()> {
        if let Some(schema) = &self.schema {
            let source = self.store.get_entity(&relation.source_id).await?;
            let target = self.store.get_entity(&relation.target_id).await?;
            schema.validate_relation(&relation.relation_type, &source.entity_type, &target.entity_type)?;
            schema.validate_relation_properties(&relation.relation_type, &relation.properties)?;
        }
        let op = OperationContext::new("import.add_relation", &relation.id);
        self.runner.call(&op, || self.store.add_relation(relation.clone())).await?;
        Ok(())
    }
}

fn map_row(row: &Value, mapping: &SchemaMapping, unmapped: &mut BTreeSet<String>) -> Result<Entity> {
    let fields = row
        .as_object()
        .ok_or_else(|| GraphError::validation("", "row is not a JSON object"))?;

    let id = match &mapping.id_field {
        Some(field) => fields
            .get(field)
            .and_then(json_id)
            .ok_or_else(|| GraphError::validation(field.as_str(), "id field is missing"))?,
        None => EntityId::generate(),
    };
    let name = fields
        .get(&mapping.name_field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| GraphError::validation(mapping.name_field.as_str(), "name field is missing"))?;

    let mut properties = Properties::new();
    for (field, value) in fields {
        match mapping.property_map.get(field) {
            Some(property) => {
                properties.insert(property.clone(), value.clone().into());
            }
            None => {
                let structural = Some(field) == mapping.id_field.as_ref()
                    || field == &mapping.name_field
                    || mapping.relations.iter().any(|r| &r.target_field == field);
                if !structural {
                    unmapped.insert(field.clone());
                }
            }
        }
    }

    let mut entity = Entity::new(id, mapping.entity_type.clone(), name).with_properties(properties);
    match &mapping.source {
        Some(source) => entity = entity.with_source(source.clone(), mapping.confidence),
        None => entity.metadata.confidence = mapping.confidence.clamp(0.0, 1.0),
    }
    Ok(entity)
}

/// String ids as-is, numeric ids rendered.
fn json_id(value: &Value) -> Option<EntityId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(EntityId::new(s.clone())),
        Value::Number(n) => Some(EntityId::new(n.to_string())),
        _ => None,
    }
}

/// Relation with an id derived from its content, so re-imports upsert.
fn derived_relation(relation_type: &str, source: EntityId, target: EntityId) -> Result<Relation> {
    let id = RelationId::new(format!(
        "rel-{}",
        canonical_hash_hex(&(relation_type, source.as_str(), target.as_str()))?
    ));
    Ok(Relation::new(id, relation_type, source, target))
}

fn record(result: &mut ImportResult, failed: &mut BTreeSet<usize>, row: Option<usize>, error: &GraphError) {
    warn!(row = ?row, code = error.code(), error = %error, "Import item rejected");
    if let Some(row) = row {
        failed.insert(row);
    }
    result.errors.push(ImportError {
        row,
        code: error.code().to_string(),
        message: error.to_string(),
    });
}

fn finish(result: &mut ImportResult, started: Instant) {
    let elapsed = started.elapsed();
    let secs = elapsed.as_secs_f64();
    result.metrics = ImportMetrics {
        duration_ms: elapsed.as_millis() as u64,
        rows_per_sec: if secs > 0.0 { result.rows_processed as f64 / secs } else { 0.0 },
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityType, PropertySchema, RelationType, SchemaRegistry};
    use crate::store::InMemoryGraphStore;
    use crate::types::{Direction, RelationMapping};
    use serde_json::json;

    fn schema() -> Arc<SchemaRegistry> {
        let registry = Arc::new(SchemaRegistry::new());
        registry
            .create_entity_type(
                EntityType::new("Person").with_property("age", PropertySchema::integer().bounded(Some(0.0), Some(150.0))),
            )
            .unwrap();
        registry
            .create_relation_type(RelationType::new("MANAGES").between(["Person"], ["Person"]))
            .unwrap();
        registry
    }

    fn mapping() -> SchemaMapping {
        SchemaMapping::new("Person", "full_name")
            .with_id_field("id")
            .map_property("years", "age")
            .with_relation(RelationMapping::new("MANAGES", "reports"))
            .with_source("hr.csv")
    }

    #[tokio::test]
    async fn test_rows_are_mapped_validated_and_linked() {
        let store = Arc::new(InMemoryGraphStore::new());
        let importer = Importer::new(Arc::clone(&store)).with_schema(schema());
        let rows = vec![
            json!({"id": "p1", "full_name": "Ada", "years": 36, "reports": "p2", "shoe": 38}),
            json!({"id": "p2", "full_name": "Alan", "years": 41}),
            json!({"id": "p3", "full_name": "Bad", "years": 400}),
            json!({"id": "p4", "years": 20}),
            json!("not an object"),
        ];
        let result = importer.import_rows(&rows, &mapping()).await.unwrap();

        assert_eq!(result.rows_processed, 5);
        assert_eq!(result.entities_added, 2);
        assert_eq!(result.relations_added, 1);
        assert_eq!(result.rows_failed, 3);
        let rows_with_errors: Vec<Option<usize>> = result.errors.iter().map(|e| e.row).collect();
        assert_eq!(rows_with_errors, vec![Some(2), Some(3), Some(4)]);
        assert_eq!(result.errors[0].code, "VALIDATION_ERROR");
        assert!(result.warnings.iter().any(|w| w.contains("`shoe`")));

        let ada = store.get_entity(&"p1".into()).await.unwrap();
        assert_eq!(ada.property("age"), Some(&36i64.into()));
        assert_eq!(ada.metadata.source.as_deref(), Some("hr.csv"));
        let managed = store.get_neighbors(&"p1".into(), Direction::Outgoing, &[]).await.unwrap();
        assert_eq!(managed[0].entity.id.as_str(), "p2");
    }

    #[tokio::test]
    async fn test_reimport_upserts() {
        let store = Arc::new(InMemoryGraphStore::new());
        let importer = Importer::new(Arc::clone(&store));
        let rows = vec![
            json!({"id": "p1", "full_name": "Ada", "reports": "p2"}),
            json!({"id": "p2", "full_name": "Alan"}),
        ];
        importer.import_rows(&rows, &mapping()).await.unwrap();
        importer.import_rows(&rows, &mapping()).await.unwrap();
        assert_eq!(store.num_entities(), 2);
        assert_eq!(store.num_relations(), 1);
    }

    #[tokio::test]
    async fn test_dangling_relation_fails_its_row() {
        let store = Arc::new(InMemoryGraphStore::new());
        let importer = Importer::new(Arc::clone(&store));
        let rows = vec![json!({"id": "p1", "full_name": "Ada", "reports": "ghost"})];
        let result = importer.import_rows(&rows, &mapping()).await.unwrap();
        assert_eq!(result.entities_added, 1);
        assert_eq!(result.relations_added, 0);
        assert_eq!(result.rows_failed, 1);
        assert_eq!(result.errors[0].code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_batch_import() {
        let store = Arc::new(InMemoryGraphStore::new());
        let importer = Importer::new(Arc::clone(&store)).with_schema(schema());
        let result = importer
            .import_batch(
                vec![
                    Entity::new("a", "Person", "Ada"),
                    Entity::new("b", "Person", "Alan"),
                    Entity::new("x", "Robot", "R2"),
                ],
                vec![Relation::new("r1", "MANAGES", "a", "b"), Relation::new("r2", "MANAGES", "a", "x")],
            )
            .await
            .unwrap();
        assert_eq!(result.entities_added, 2);
        assert_eq!(result.relations_added, 1);
        assert_eq!(result.rows_failed, 2);
        assert!(!result.is_clean());
        assert!(result.errors.iter().all(|e| e.row.is_none()));
    }
}
