//! Schema registry, property validation and the schema lookup cache.

pub mod property;
pub mod definition;
pub mod registry;
pub mod cache;

pub use property::{validate_properties, PropertyKind, PropertySchema};
pub use definition::{EntityType, RelationType};
pub use registry::{RegistrySnapshot, SchemaLookup, SchemaRegistry};
pub use cache::{CacheStats, CachedSchemaRegistry, SchemaCacheConfig, TtlLruCache};
