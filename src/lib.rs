//! # graph-reasoning-kernel
//!
//! Storage and reasoning kernel for typed knowledge graphs.
//!
//! The kernel answers three questions over a graph of entities and relations:
//!
//! > What is connected to what, which records describe the same thing, and
//! > which answers best fit a query?
//!
//! ## Core Contract
//!
//! 1. A backend implements eight Tier-1 primitives; traversal, path finding,
//!    subgraphs, search and hybrid queries derive from them
//! 2. Every backend call runs through the execution substrate (retry with
//!    backoff, per-attempt timeout, circuit breaker)
//! 3. Cross-document duplicates fuse into canonical entities by weighted
//!    consensus, with provenance and projected relations
//! 4. Writes are validated against a versioned, cached schema registry
//!
//! ## Architecture
//!
//! ```text
//! Importer / Service ──► ValidatedStore ──► ResilientStore ──► backend
//!                               │                 │           (memory | postgres)
//!                        SchemaRegistry        Runner
//!
//! FusionEngine · Reasoner · QueryOptimizer · Reranker  (all over GraphStore)
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Enumeration is ordered by entity id
//! - Traversal is breadth-first with neighbors in (entity id, relation id) order
//! - Canonical, projected and inferred ids are content hashes of their inputs
//! - Reranking is a stable sort: equal scores keep input order

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod error;
pub mod canonical;
pub mod text;
pub mod embedding;
pub mod schema;
pub mod runnable;
pub mod store;
pub mod optimizer;
pub mod fusion;
pub mod rerank;
pub mod reasoning;
pub mod ingest;
pub mod config;
pub mod context;

#[cfg(feature = "service")]
pub mod service;

// Re-exports
pub use types::{
    Direction, Entity, EntityFilter, EntityId, Evidence, GraphQuery, GraphResult, ImportResult, InferenceRule, Page,
    Path, Properties, PropertyValue, ReasoningResult, Relation, RelationId, SchemaMapping,
};
pub use error::{GraphError, ResourceKind, Result};
pub use canonical::{canonical_hash, canonical_hash_hex, to_canonical_bytes};
pub use embedding::{Embedder, HashingEmbedder};
pub use schema::{CachedSchemaRegistry, EntityType, PropertySchema, RelationType, SchemaLookup, SchemaRegistry};
pub use runnable::{CircuitBreaker, MetricsSink, OperationContext, RetryPolicy, Runner, RunnerConfig};
pub use store::{GraphStore, InMemoryGraphStore, ResilientStore, ValidatedStore};
#[cfg(feature = "postgres")]
pub use store::PostgresGraphStore;
pub use optimizer::{QueryOptimizer, QueryPlan};
pub use fusion::{FusionConfig, FusionEngine, FusionStats};
pub use rerank::{RerankQuery, Reranker};
pub use reasoning::{LogicalForm, Reasoner};
pub use ingest::Importer;
pub use config::KernelConfig;
pub use context::KernelContext;

// Service re-exports (when service feature is enabled)
#[cfg(feature = "service")]
pub use service::{create_router, ServiceState};

/// Schema version of the persisted entity, relation and registry formats.
/// Increment on breaking changes to any stored type.
pub const GRAPH_KERNEL_SCHEMA_VERSION: &str = "1.0.0";
