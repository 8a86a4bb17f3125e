//! Property schemas and recursive validation.
//!
//! A violation at nesting depth *d* is reported with a dotted path of exactly
//! *d* segments: `address.coordinates.lat` for an object three levels deep,
//! `tags.2` for the third item of a top-level list.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::types::{Properties, PropertyValue};

/// Value kind accepted by a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    /// UTF-8 string; `min`/`max` bound its length in characters.
    String,
    /// Integer; `min`/`max` bound its value.
    Integer,
    /// Float (integers are accepted and widened); `min`/`max` bound its value.
    Float,
    /// Boolean.
    Boolean,
    /// String restricted to `enum_values`.
    Enum,
    /// Nested object described by `properties`.
    Object,
    /// List whose items are described by `items`; `min`/`max` bound its length.
    List,
    /// Anything.
    Any,
}

/// Schema of a single property, recursive through `properties` and `items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    /// Accepted kind.
    pub kind: PropertyKind,
    /// Whether the property must be present and non-null.
    #[serde(default)]
    pub required: bool,
    /// Lower bound (value or length, depending on kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound (value or length, depending on kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Allowed values for `Enum`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    /// Nested schemas for `Object`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertySchema>,
    /// Item schema for `List`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<PropertySchema>>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertySchema {
    /// Optional property of the given kind.
    pub fn of(kind: PropertyKind) -> Self {
        Self {
            kind,
            required: false,
            min: None,
            max: None,
            enum_values: Vec::new(),
            properties: BTreeMap::new(),
            items: None,
            description: None,
        }
    }

    /// Optional string.
    pub fn string() -> Self {
        Self::of(PropertyKind::String)
    }

    /// Optional integer.
    pub fn integer() -> Self {
        Self::of(PropertyKind::Integer)
    }

    /// Optional float.
    pub fn float() -> Self {
        Self::of(PropertyKind::Float)
    }

    /// Optional boolean.
    pub fn boolean() -> Self {
        Self::of(PropertyKind::Boolean)
    }

    /// Optional enumeration.
    pub fn enumeration<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut schema = Self::of(PropertyKind::Enum);
        schema.enum_values = values.into_iter().map(Into::into).collect();
        schema
    }

    /// Optional nested object.
    pub fn object(properties: BTreeMap<String, PropertySchema>) -> Self {
        let mut schema = Self::of(PropertyKind::Object);
        schema.properties = properties;
        schema
    }

    /// Optional list of items.
    pub fn list(items: PropertySchema) -> Self {
        let mut schema = Self::of(PropertyKind::List);
        schema.items = Some(Box::new(items));
        schema
    }

    /// Mark as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the bounds.
    pub fn bounded(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Add a nested property (object schemas).
    pub fn with_property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Validate a value at `path`, pushing every violation into `issues`.
    pub fn validate_value(&self, value: &PropertyValue, path: &str, issues: &mut Vec<GraphError>) {
        match (self.kind, value) {
            (PropertyKind::Any, _) => {}
            (PropertyKind::String, PropertyValue::String(s)) => {
                self.check_bounds(s.chars().count() as f64, "length", path, issues);
            }
            (PropertyKind::Integer, PropertyValue::Int(i)) => {
                self.check_bounds(*i as f64, "value", path, issues);
            }
            (PropertyKind::Float, PropertyValue::Int(_) | PropertyValue::Float(_)) => {
                if let Some(v) = value.as_f64() {
                    if v.is_nan() {
                        issues.push(GraphError::validation(path, "NaN is not allowed"));
                    } else {
                        self.check_bounds(v, "value", path, issues);
                    }
                }
            }
            (PropertyKind::Boolean, PropertyValue::Bool(_)) => {}
            (PropertyKind::Enum, PropertyValue::String(s)) => {
                if !self.enum_values.iter().any(|allowed| allowed == s) {
                    issues.push(GraphError::validation(
                        path,
                        format!("`{}` is not one of [{}]", s, self.enum_values.join(", ")),
                    ));
                }
            }
            (PropertyKind::Object, PropertyValue::Object(map)) => {
                validate_properties(&self.properties, map, path, issues);
            }
            (PropertyKind::List, PropertyValue::List(items)) => {
                self.check_bounds(items.len() as f64, "length", path, issues);
                if let Some(item_schema) = &self.items {
                    for (i, item) in items.iter().enumerate() {
                        let item_path = join_path(path, &i.to_string());
                        if matches!(item, PropertyValue::Null) {
                            if item_schema.required {
                                issues.push(GraphError::validation(item_path, "required item is null"));
                            }
                            continue;
                        }
                        item_schema.validate_value(item, &item_path, issues);
                    }
                }
            }
            (kind, other) => {
                issues.push(GraphError::validation(
                    path,
                    format!("expected {}, found {}", kind_label(kind), other.kind_name()),
                ));
            }
        }
    }

    fn check_bounds(&self, measured: f64, what: &str, path: &str, issues: &mut Vec<GraphError>) {
        if let Some(min) = self.min {
            if measured < min {
                issues.push(GraphError::validation(path, format!("{} {} below minimum {}", what, measured, min)));
            }
        }
        if let Some(max) = self.max {
            if measured > max {
                issues.push(GraphError::validation(path, format!("{} {} above maximum {}", what, measured, max)));
            }
        }
    }
}

fn kind_label(kind: PropertyKind) -> &'static str {
    match kind {
        PropertyKind::String => "string",
        PropertyKind::Integer => "integer",
        PropertyKind::Float => "float",
        PropertyKind::Boolean => "boolean",
        PropertyKind::Enum => "enum string",
        PropertyKind::Object => "object",
        PropertyKind::List => "list",
        PropertyKind::Any => "any",
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Validate a property map against a schema map.
///
/// Unknown keys are allowed. A null value counts as absent.
pub fn validate_properties(
    schema: &BTreeMap<String, PropertySchema>,
    properties: &Properties,
    prefix: &str,
    issues: &mut Vec<GraphError>,
) {
    for (key, property_schema) in schema {
        let path = join_path(prefix, key);
        match properties.get(key) {
            None | Some(PropertyValue::Null) => {
                if property_schema.required {
                    issues.push(GraphError::validation(path, "required property is missing"));
                }
            }
            Some(value) => property_schema.validate_value(value, &path, issues),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address_schema() -> BTreeMap<String, PropertySchema> {
        let coordinates = PropertySchema::object(BTreeMap::new())
            .with_property("lat", PropertySchema::float().required().bounded(Some(-90.0), Some(90.0)))
            .with_property("lon", PropertySchema::float().required());
        let address = PropertySchema::object(BTreeMap::new())
            .with_property("city", PropertySchema::string().required())
            .with_property("coordinates", coordinates);

        let mut schema = BTreeMap::new();
        schema.insert("address".to_string(), address);
        schema.insert("age".to_string(), PropertySchema::integer().bounded(Some(0.0), None));
        schema.insert("tags".to_string(), PropertySchema::list(PropertySchema::string()));
        schema.insert("status".to_string(), PropertySchema::enumeration(["active", "retired"]));
        schema
    }

    fn parse(json: &str) -> Properties {
        serde_json::from_str(json).unwrap()
    }

    fn issues_for(json: &str) -> Vec<GraphError> {
        let mut issues = Vec::new();
        validate_properties(&address_schema(), &parse(json), "", &mut issues);
        issues
    }

    fn paths(issues: &[GraphError]) -> Vec<String> {
        issues
            .iter()
            .map(|e| match e {
                GraphError::Validation { path, .. } => path.clone(),
                other => panic!("unexpected error {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_valid_nested_document() {
        let issues = issues_for(
            r#"{"address": {"city": "Paris", "coordinates": {"lat": 48.8, "lon": 2}}, "age": 3, "tags": ["a"], "extra": 1}"#,
        );
        assert!(issues.is_empty(), "{:?}", issues);
    }

    #[test]
    fn test_depth_three_violation_path() {
        let issues = issues_for(r#"{"address": {"city": "Paris", "coordinates": {"lat": 123.0, "lon": 2.0}}}"#);
        assert_eq!(paths(&issues), vec!["address.coordinates.lat"]);
    }

    #[test]
    fn test_missing_nested_required() {
        let issues = issues_for(r#"{"address": {"coordinates": {"lat": 1.0, "lon": 2.0}}}"#);
        assert_eq!(paths(&issues), vec!["address.city"]);
    }

    #[test]
    fn test_list_item_and_enum_paths() {
        let issues = issues_for(r#"{"tags": ["a", "b", 3], "status": "unknown"}"#);
        assert_eq!(paths(&issues), vec!["status", "tags.2"]);
    }

    #[test]
    fn test_kind_mismatch_and_bounds() {
        let issues = issues_for(r#"{"age": -1}"#);
        assert_eq!(paths(&issues), vec!["age"]);

        let issues = issues_for(r#"{"age": "old"}"#);
        match &issues[0] {
            GraphError::Validation { reason, .. } => assert!(reason.contains("expected integer")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
