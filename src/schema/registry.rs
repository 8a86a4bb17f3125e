//! Append-only schema registry.
//!
//! Definitions are created once and looked up many times. Creating a name
//! that already exists is accepted only when the definition is identical;
//! anything else must go through the explicit, versioned `redefine_*` calls,
//! which keep the full history.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GraphError, ResourceKind, Result};
use crate::types::Properties;

use super::definition::{EntityType, RelationType};
use super::property::validate_properties;

/// Read access to type definitions plus the validation built on top of it.
///
/// Implemented by [`SchemaRegistry`] and by the caching front
/// [`CachedSchemaRegistry`](super::CachedSchemaRegistry).
pub trait SchemaLookup: Send + Sync {
    /// Current definition of an entity type.
    fn entity_type(&self, name: &str) -> Result<Arc<EntityType>>;

    /// Current definition of a relation type.
    fn relation_type(&self, name: &str) -> Result<Arc<RelationType>>;

    /// Every violation of `properties` against the type, in path order.
    ///
    /// Fails with `NotFound` when the type is unknown.
    fn check_entity(&self, entity_type: &str, properties: &Properties) -> Result<Vec<GraphError>> {
        let def = self.entity_type(entity_type)?;
        let mut issues = Vec::new();
        validate_properties(&def.properties, properties, "", &mut issues);
        Ok(issues)
    }

    /// Validate entity properties, returning the first violation.
    fn validate_entity(&self, entity_type: &str, properties: &Properties) -> Result<()> {
        match self.check_entity(entity_type, properties)?.into_iter().next() {
            Some(issue) => Err(issue),
            None => Ok(()),
        }
    }

    /// Boolean form of [`validate_entity`](Self::validate_entity).
    fn is_valid_entity(&self, entity_type: &str, properties: &Properties) -> bool {
        self.validate_entity(entity_type, properties).is_ok()
    }

    /// Validate relation endpoint types against the relation type's constraints.
    fn validate_relation(&self, relation_type: &str, source_type: &str, target_type: &str) -> Result<()> {
        let def = self.relation_type(relation_type)?;
        if !def.allows(source_type, target_type) {
            return Err(GraphError::validation(
                "",
                format!(
                    "{} does not allow {} -> {} (allowed: [{}] -> [{}])",
                    def.name,
                    source_type,
                    target_type,
                    def.source_types.join(", "),
                    def.target_types.join(", ")
                ),
            ));
        }
        Ok(())
    }

    /// Boolean form of [`validate_relation`](Self::validate_relation).
    fn is_valid_relation(&self, relation_type: &str, source_type: &str, target_type: &str) -> bool {
        self.validate_relation(relation_type, source_type, target_type).is_ok()
    }

    /// Validate relation properties, returning the first violation.
    fn validate_relation_properties(&self, relation_type: &str, properties: &Properties) -> Result<()> {
        let def = self.relation_type(relation_type)?;
        let mut issues = Vec::new();
        validate_properties(&def.properties, properties, "", &mut issues);
        match issues.into_iter().next() {
            Some(issue) => Err(issue),
            None => Ok(()),
        }
    }
}

/// Serializable dump of every definition version, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Entity type versions.
    pub entity_types: Vec<EntityType>,
    /// Relation type versions.
    pub relation_types: Vec<RelationType>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Name -> versions (last is current).
    entity_types: BTreeMap<String, Vec<Arc<EntityType>>>,
    relation_types: BTreeMap<String, Vec<Arc<RelationType>>>,
}

/// Registry of entity and relation types.
///
/// Many readers, single writer (`parking_lot::RwLock`).
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    inner: RwLock<RegistryInner>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from a snapshot.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let mut inner = RegistryInner::default();
        for def in snapshot.entity_types {
            inner.entity_types.entry(def.name.clone()).or_default().push(Arc::new(def));
        }
        for def in snapshot.relation_types {
            inner.relation_types.entry(def.name.clone()).or_default().push(Arc::new(def));
        }
        for versions in inner.entity_types.values_mut() {
            versions.sort_by_key(|d| d.version);
        }
        for versions in inner.relation_types.values_mut() {
            versions.sort_by_key(|d| d.version);
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Dump every version of every definition.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        RegistrySnapshot {
            entity_types: inner
                .entity_types
                .values()
                .flat_map(|v| v.iter().map(|d| (**d).clone()))
                .collect(),
            relation_types: inner
                .relation_types
                .values()
                .flat_map(|v| v.iter().map(|d| (**d).clone()))
                .collect(),
        }
    }

    /// Register a new entity type.
    ///
    /// Re-creating an identical definition returns the existing one; a
    /// different definition under the same name fails with `SchemaConflict`.
    pub fn create_entity_type(&self, mut def: EntityType) -> Result<Arc<EntityType>> {
        check_name(&def.name)?;
        let fingerprint = def.fingerprint()?;
        let mut inner = self.inner.write();
        if let Some(current) = inner.entity_types.get(&def.name).and_then(|v| v.last()) {
            if current.fingerprint()? == fingerprint {
                return Ok(Arc::clone(current));
            }
            return Err(GraphError::SchemaConflict {
                name: def.name,
                reason: format!(
                    "already defined at version {}; use redefine_entity_type",
                    current.version
                ),
            });
        }
        def.version = 1;
        let def = Arc::new(def);
        inner.entity_types.insert(def.name.clone(), vec![Arc::clone(&def)]);
        info!(entity_type = %def.name, "Entity type created");
        Ok(def)
    }

    /// Replace an entity type with a new version.
    ///
    /// `expected_version` must match the current version.
    pub fn redefine_entity_type(&self, mut def: EntityType, expected_version: u32) -> Result<Arc<EntityType>> {
        let mut inner = self.inner.write();
        let versions = inner
            .entity_types
            .get_mut(&def.name)
            .ok_or_else(|| GraphError::not_found(ResourceKind::EntityType, &def.name))?;
        let current_version = versions.last().map(|d| d.version).unwrap_or(0);
        if current_version != expected_version {
            return Err(GraphError::SchemaConflict {
                name: def.name,
                reason: format!("expected version {}, current is {}", expected_version, current_version),
            });
        }
        def.version = current_version + 1;
        let def = Arc::new(def);
        versions.push(Arc::clone(&def));
        info!(entity_type = %def.name, version = def.version, "Entity type redefined");
        Ok(def)
    }

    /// Current definition of an entity type.
    pub fn get_entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        debug!(entity_type = name, "Registry lookup");
        self.inner
            .read()
            .entity_types
            .get(name)
            .and_then(|v| v.last())
            .cloned()
            .ok_or_else(|| GraphError::not_found(ResourceKind::EntityType, name))
    }

    /// All versions of an entity type, oldest first.
    pub fn entity_type_history(&self, name: &str) -> Vec<Arc<EntityType>> {
        self.inner.read().entity_types.get(name).cloned().unwrap_or_default()
    }

    /// Names of all entity types.
    pub fn entity_type_names(&self) -> Vec<String> {
        self.inner.read().entity_types.keys().cloned().collect()
    }

    /// Register a new relation type (same rules as entity types).
    pub fn create_relation_type(&self, mut def: RelationType) -> Result<Arc<RelationType>> {
        check_name(&def.name)?;
        let fingerprint = def.fingerprint()?;
        let mut inner = self.inner.write();
        if let Some(current) = inner.relation_types.get(&def.name).and_then(|v| v.last()) {
            if current.fingerprint()? == fingerprint {
                return Ok(Arc::clone(current));
            }
            return Err(GraphError::SchemaConflict {
                name: def.name,
                reason: format!(
                    "already defined at version {}; use redefine_relation_type",
                    current.version
                ),
            });
        }
        def.version = 1;
        let def = Arc::new(def);
        inner.relation_types.insert(def.name.clone(), vec![Arc::clone(&def)]);
        info!(relation_type = %def.name, "Relation type created");
        Ok(def)
    }

    /// Replace a relation type with a new version.
    pub fn redefine_relation_type(&self, mut def: RelationType, expected_version: u32) -> Result<Arc<RelationType>> {
        let mut inner = self.inner.write();
        let versions = inner
            .relation_types
            .get_mut(&def.name)
            .ok_or_else(|| GraphError::not_found(ResourceKind::RelationType, &def.name))?;
        let current_version = versions.last().map(|d| d.version).unwrap_or(0);
        if current_version != expected_version {
            return Err(GraphError::SchemaConflict {
                name: def.name,
                reason: format!("expected version {}, current is {}", expected_version, current_version),
            });
        }
        def.version = current_version + 1;
        let def = Arc::new(def);
        versions.push(Arc::clone(&def));
        info!(relation_type = %def.name, version = def.version, "Relation type redefined");
        Ok(def)
    }

    /// Current definition of a relation type.
    pub fn get_relation_type(&self, name: &str) -> Result<Arc<RelationType>> {
        debug!(relation_type = name, "Registry lookup");
        self.inner
            .read()
            .relation_types
            .get(name)
            .and_then(|v| v.last())
            .cloned()
            .ok_or_else(|| GraphError::not_found(ResourceKind::RelationType, name))
    }

    /// All versions of a relation type, oldest first.
    pub fn relation_type_history(&self, name: &str) -> Vec<Arc<RelationType>> {
        self.inner.read().relation_types.get(name).cloned().unwrap_or_default()
    }

    /// Names of all relation types.
    pub fn relation_type_names(&self) -> Vec<String> {
        self.inner.read().relation_types.keys().cloned().collect()
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GraphError::validation("name", "type name must not be empty"));
    }
    Ok(())
}

impl SchemaLookup for SchemaRegistry {
    fn entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        self.get_entity_type(name)
    }

    fn relation_type(&self, name: &str) -> Result<Arc<RelationType>> {
        self.get_relation_type(name)
    }
}

impl<T: SchemaLookup + ?Sized> SchemaLookup for Arc<T> {
    fn entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        (**self).entity_type(name)
    }

    fn relation_type(&self, name: &str) -> Result<Arc<RelationType>> {
        (**self).relation_type(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertySchema;

    fn person() -> EntityType {
        EntityType::new("Person")
            .with_property("name", PropertySchema::string().required())
            .with_property("age", PropertySchema::integer())
    }

    #[test]
    fn test_create_is_idempotent_for_identical_definition() {
        let registry = SchemaRegistry::new();
        let first = registry.create_entity_type(person()).unwrap();
        let second = registry.create_entity_type(person()).unwrap();
        assert_eq!(first.version, 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_implicit_redefinition_is_refused() {
        let registry = SchemaRegistry::new();
        registry.create_entity_type(person()).unwrap();

        let changed = person().with_property("email", PropertySchema::string().required());
        let err = registry.create_entity_type(changed).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_CONFLICT");
        assert!(registry.get_entity_type("Person").unwrap().properties.get("email").is_none());
    }

    #[test]
    fn test_versioned_redefinition_keeps_history() {
        let registry = SchemaRegistry::new();
        registry.create_entity_type(person()).unwrap();

        let changed = person().with_property("email", PropertySchema::string());
        assert!(registry.redefine_entity_type(changed.clone(), 2).is_err());

        let v2 = registry.redefine_entity_type(changed, 1).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(registry.entity_type_history("Person").len(), 2);
        assert_eq!(registry.get_entity_type("Person").unwrap().version, 2);
    }

    #[test]
    fn test_validate_entity_and_relation() {
        let registry = SchemaRegistry::new();
        registry.create_entity_type(person()).unwrap();
        registry
            .create_relation_type(RelationType::new("WORKS_FOR").between(["Person"], ["Company"]))
            .unwrap();

        let mut props = Properties::new();
        assert!(!registry.is_valid_entity("Person", &props));
        props.insert("name".to_string(), "Ada".into());
        assert!(registry.is_valid_entity("Person", &props));

        assert!(registry.is_valid_relation("WORKS_FOR", "Person", "Company"));
        assert!(!registry.is_valid_relation("WORKS_FOR", "Company", "Person"));
        assert!(registry.validate_relation("UNKNOWN", "A", "B").unwrap_err().is_not_found());
    }

    #[test]
    fn test_snapshot_round_trip_keeps_versions() {
        let registry = SchemaRegistry::new();
        registry.create_entity_type(person()).unwrap();
        registry
            .redefine_entity_type(person().with_description("v2"), 1)
            .unwrap();

        let restored = SchemaRegistry::from_snapshot(registry.snapshot());
        assert_eq!(restored.entity_type_history("Person").len(), 2);
        assert_eq!(restored.get_entity_type("Person").unwrap().description.as_deref(), Some("v2"));
    }
}
