//! Versioned entity and relation type definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_hash;
use crate::error::Result;

use super::property::PropertySchema;

fn initial_version() -> u32 {
    1
}

/// Definition of an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    /// Type name.
    pub name: String,
    /// Version, assigned by the registry (1 on creation).
    #[serde(default = "initial_version")]
    pub version: u32,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Property schemas by key.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
}

impl EntityType {
    /// Create a type with no properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            description: None,
            properties: BTreeMap::new(),
        }
    }

    /// Add a property schema.
    pub fn with_property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Content fingerprint, independent of the version number.
    pub fn fingerprint(&self) -> Result<u64> {
        canonical_hash(&(&self.name, &self.description, &self.properties))
    }
}

/// Definition of a relation type with endpoint constraints.
///
/// Empty `source_types` / `target_types` accept any entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationType {
    /// Type name.
    pub name: String,
    /// Version, assigned by the registry (1 on creation).
    #[serde(default = "initial_version")]
    pub version: u32,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Allowed source entity types.
    #[serde(default)]
    pub source_types: Vec<String>,
    /// Allowed target entity types.
    #[serde(default)]
    pub target_types: Vec<String>,
    /// Property schemas by key.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
}

impl RelationType {
    /// Create an unconstrained relation type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            description: None,
            source_types: Vec::new(),
            target_types: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Constrain the endpoints.
    pub fn between<S, T>(mut self, source_types: S, target_types: T) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        self.source_types = source_types.into_iter().map(Into::into).collect();
        self.target_types = target_types.into_iter().map(Into::into).collect();
        self
    }

    /// Add a property schema.
    pub fn with_property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Whether the endpoint types satisfy the constraints.
    pub fn allows(&self, source_type: &str, target_type: &str) -> bool {
        let source_ok = self.source_types.is_empty() || self.source_types.iter().any(|t| t == source_type);
        let target_ok = self.target_types.is_empty() || self.target_types.iter().any(|t| t == target_type);
        source_ok && target_ok
    }

    /// Content fingerprint, independent of the version number.
    pub fn fingerprint(&self) -> Result<u64> {
        canonical_hash(&(
            &self.name,
            &self.description,
            &self.source_types,
            &self.target_types,
            &self.properties,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_version() {
        let mut a = EntityType::new("Person").with_property("age", PropertySchema::integer());
        let fp = a.fingerprint().unwrap();
        a.version = 7;
        assert_eq!(a.fingerprint().unwrap(), fp);

        let b = EntityType::new("Person").with_property("age", PropertySchema::float());
        assert_ne!(b.fingerprint().unwrap(), fp);
    }

    #[test]
    fn test_relation_endpoint_constraints() {
        let works_for = RelationType::new("WORKS_FOR").between(["Person"], ["Company"]);
        assert!(works_for.allows("Person", "Company"));
        assert!(!works_for.allows("Company", "Person"));
        assert!(RelationType::new("RELATED").allows("X", "Y"));
    }
}
