//! Graph kernel REST service.
//!
//! ## Endpoints
//!
//! - `POST /api/schema/entity-types` - Register an entity type
//! - `POST /api/schema/relation-types` - Register a relation type
//! - `POST /api/entities` / `GET /api/entities` - Upsert / enumerate entities
//! - `GET /api/entities/:id` / `DELETE /api/entities/:id` - Fetch / logically delete
//! - `GET /api/entities/:id/provenance` - Canonical entity and merge sources
//! - `POST /api/relations` / `GET /api/relations/:id` - Upsert / fetch relations
//! - `POST /api/query` - Graph, logical-form or text search query
//! - `POST /api/fusion` - Run cross-document entity fusion
//! - `POST /api/import` - Import rows through a schema mapping
//! - `GET /health` - Detailed service health check
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe

pub mod middleware;
pub mod routes;
pub mod state;

pub use middleware::{metrics_middleware, record_fusion_metrics, record_query_metrics};
pub use routes::{create_router, ApiError, ErrorResponse, QueryRequest, QueryResponse};
pub use state::ServiceState;
