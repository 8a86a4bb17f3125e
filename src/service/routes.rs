//! Axum routes for the graph kernel service.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::GRAPH_KERNEL_SCHEMA_VERSION;
use crate::fusion::{EntityProvenance, FusionStats};
use crate::reasoning::LogicalForm;
use crate::rerank::{HybridStrategy, RerankQuery, Reranker, ScoreBreakdown, StructuralStrategy};
use crate::schema::{EntityType, RelationType};
use crate::types::{
    Entity, EntityFilter, EntityId, GraphQuery, GraphResult, ImportResult, Page, Relation, RelationId,
    SchemaMapping,
};

use super::middleware::{record_fusion_metrics, record_query_metrics};
use super::state::ServiceState;

/// Handler result.
pub type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Structured error response with correlation ID for tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
    /// Correlation ID for matching the response to server logs.
    pub correlation_id: String,
    /// Offending field, for validation errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A [`GraphError`] on its way to the client.
#[derive(Debug)]
pub struct ApiError(pub GraphError);

impl From<GraphError> for ApiError {
    fn from(err: GraphError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            GraphError::Validation { .. } | GraphError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
            GraphError::NotFound { .. } => StatusCode::NOT_FOUND,
            GraphError::ConflictUnresolved { .. }
            | GraphError::SchemaConflict { .. }
            | GraphError::InvalidTransition { .. } => StatusCode::CONFLICT,
            GraphError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GraphError::CircuitOpen { .. } | GraphError::RetryExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GraphError::Backend { .. } => StatusCode::BAD_GATEWAY,
            GraphError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let path = match &self.0 {
            GraphError::Validation { path, .. } => Some(path.clone()),
            _ => None,
        };
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, correlation_id = %correlation_id, "Request failed");
        } else {
            tracing::warn!(code = self.0.code(), error = %self.0, correlation_id = %correlation_id, "Request rejected");
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
            correlation_id,
            path,
        };
        (status, Json(body)).into_response()
    }
}

/// Service health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`.
    pub status: String,
    /// Crate version.
    pub version: String,
    /// Persisted format version.
    pub schema_version: String,
    /// Configured storage backend.
    pub backend: String,
    /// Registered entity types.
    pub entity_types: usize,
    /// Registered relation types.
    pub relation_types: usize,
    /// Seconds since start.
    pub uptime_secs: u64,
}

/// Readiness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Whether the store answers.
    pub ready: bool,
}

/// Id of a written record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedResponse {
    /// The id.
    pub id: String,
}

/// Schema version of a registered type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeRegistered {
    /// Type name.
    pub name: String,
    /// Assigned version.
    pub version: u32,
}

/// `GET /api/entities` parameters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    /// Entity type.
    #[serde(rename = "type")]
    pub entity_type: Option<String>,
    /// Tenant.
    pub tenant: Option<String>,
    /// Entities to skip.
    pub offset: usize,
    /// Page size (defaults to the enumeration page size).
    pub limit: Option<usize>,
}

/// `POST /api/query` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryRequest {
    /// Structured graph query (vector, traverse, hybrid, subgraph).
    Graph {
        /// The query.
        query: GraphQuery,
    },
    /// Logical form such as `Person(x) & WORKS_FOR(x, y) & Company(y)`.
    Logical {
        /// Form text.
        form: String,
    },
    /// Free-text search, embedded when an embedder is configured.
    Search {
        /// Query text.
        text: String,
        /// Hits to return.
        #[serde(default = "default_top_k")]
        top_k: usize,
        /// Entity filter.
        #[serde(default)]
        filters: EntityFilter,
        /// Rerank hits with the hybrid reranker.
        #[serde(default)]
        rerank: bool,
    },
}

fn default_top_k() -> usize {
    10
}

impl QueryRequest {
    fn kind(&self) -> &'static str {
        match self {
            Self::Graph { .. } => "graph",
            Self::Logical { .. } => "logical",
            Self::Search { .. } => "search",
        }
    }
}

/// One ranked search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedHit {
    /// Entity id.
    pub id: EntityId,
    /// Final score.
    pub score: f32,
    /// Reranker components, when reranked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,
}

/// `POST /api/query` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Request kind.
    pub kind: String,
    /// Matched entities, relations and paths.
    pub result: GraphResult,
    /// Search hits in rank order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranking: Vec<RankedHit>,
}

/// `POST /api/fusion` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FusionRequest {
    /// Restrict fusion to one entity type.
    pub entity_type: Option<String>,
}

/// `POST /api/import` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportRequest {
    /// Source rows.
    pub rows: Vec<serde_json::Value>,
    /// Row-to-entity mapping.
    pub mapping: SchemaMapping,
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health_handler(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let ready = state.is_ready().await;
    let registry = state.kernel.schema().registry();
    Json(HealthResponse {
        status: if ready { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: GRAPH_KERNEL_SCHEMA_VERSION.to_string(),
        backend: format!("{:?}", state.kernel.config().storage.backend).to_lowercase(),
        entity_types: registry.entity_type_names().len(),
        relation_types: registry.relation_type_names().len(),
        uptime_secs: state.uptime_secs(),
    })
}

async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

async fn readiness_handler(
    State(state): State<ServiceState>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    if state.is_ready().await {
        Ok(Json(ReadinessResponse { ready: true }))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(ReadinessResponse { ready: false })))
    }
}

async fn register_entity_type_handler(
    State(state): State<ServiceState>,
    Json(def): Json<EntityType>,
) -> Result<(StatusCode, Json<TypeRegistered>), ApiError> {
    let def = state.kernel.schema().create_entity_type(def)?;
    Ok((
        StatusCode::CREATED,
        Json(TypeRegistered {
            name: def.name.clone(),
            version: def.version,
        }),
    ))
}

async fn register_relation_type_handler(
    State(state): State<ServiceState>,
    Json(def): Json<RelationType>,
) -> Result<(StatusCode, Json<TypeRegistered>), ApiError> {
    let def = state.kernel.schema().create_relation_type(def)?;
    Ok((
        StatusCode::CREATED,
        Json(TypeRegistered {
            name: def.name.clone(),
            version: def.version,
        }),
    ))
}

async fn create_entity_handler(
    State(state): State<ServiceState>,
    Json(entity): Json<Entity>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = state.kernel.store().add_entity(entity).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id: id.to_string() })))
}

async fn list_entities_handler(
    State(state): State<ServiceState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<Entity>> {
    let filter = EntityFilter {
        entity_types: params.entity_type.into_iter().collect(),
        tenant: params.tenant,
        ..EntityFilter::default()
    };
    let page = Page {
        offset: params.offset,
        limit: params.limit.unwrap_or(Page::DEFAULT_LIMIT),
    };
    Ok(Json(state.kernel.store().get_all_entities(&filter, page).await?))
}

async fn get_entity_handler(State(state): State<ServiceState>, Path(id): Path<String>) -> ApiResult<Entity> {
    Ok(Json(state.kernel.store().get_entity(&EntityId::from(id)).await?))
}

async fn delete_entity_handler(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.kernel.store().delete_entity(&EntityId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn provenance_handler(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> ApiResult<EntityProvenance> {
    Ok(Json(state.kernel.fusion().track_entity_provenance(&EntityId::from(id)).await?))
}

async fn create_relation_handler(
    State(state): State<ServiceState>,
    Json(relation): Json<Relation>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = state.kernel.store().add_relation(relation).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id: id.to_string() })))
}

async fn get_relation_handler(State(state): State<ServiceState>, Path(id): Path<String>) -> ApiResult<Relation> {
    Ok(Json(state.kernel.store().get_relation(&RelationId::from(id)).await?))
}

async fn query_handler(State(state): State<ServiceState>, Json(request): Json<QueryRequest>) -> ApiResult<QueryResponse> {
    let start = Instant::now();
    let kind = request.kind();
    let store = state.kernel.store();

    let response = match request {
        QueryRequest::Graph { query } => QueryResponse {
            kind: kind.to_string(),
            result: store.query(&query).await?,
            ranking: Vec::new(),
        },
        QueryRequest::Logical { form } => {
            let form = LogicalForm::parse(&form)?;
            let mut entities = state.kernel.reasoner().answer(&form).await?;
            entities.sort_by(|a, b| a.id.cmp(&b.id));
            let mut result = GraphResult::default();
            result.stats.entities_returned = entities.len();
            result.entities = entities;
            QueryResponse {
                kind: kind.to_string(),
                result,
                ranking: Vec::new(),
            }
        }
        QueryRequest::Search {
            text,
            top_k,
            filters,
            rerank,
        } => search(&state, text, top_k, &filters, rerank).await?,
    };

    record_query_metrics(kind, response.result.entities.len(), start.elapsed().as_millis() as u64);
    Ok(Json(response))
}

async fn search(
    state: &ServiceState,
    text: String,
    top_k: usize,
    filters: &EntityFilter,
    rerank: bool,
) -> Result<QueryResponse, ApiError> {
    let store = state.kernel.store();
    let query = match state.kernel.embedder() {
        Some(embedder) => RerankQuery::embedded(text, embedder.as_ref()).await?,
        None => RerankQuery::text(text),
    };
    let mut text_fallback = false;
    let hits = match &query.embedding {
        Some(embedding) => store.vector_search(embedding, top_k, filters).await?,
        None => {
            text_fallback = true;
            store.text_search(&query.text, top_k, filters).await?
        }
    };

    let ranking: Vec<(Entity, f32, Option<ScoreBreakdown>)> = if rerank {
        let entities: Vec<Entity> = hits.into_iter().map(|hit| hit.entity).collect();
        let structural = StructuralStrategy::from_store(store.as_ref(), &entities).await?;
        let config = &state.kernel.config().rerank;
        let reranker = Reranker::new(HybridStrategy::new(config.weights, config.bm25).with_structural(structural));
        reranker
            .rerank_scored(&query, entities, top_k)
            .into_iter()
            .map(|r| (r.entity, r.score, Some(r.breakdown)))
            .collect()
    } else {
        hits.into_iter().map(|hit| (hit.entity, hit.score, None)).collect()
    };

    let mut scores = BTreeMap::new();
    let mut hits = Vec::with_capacity(ranking.len());
    let mut entities = Vec::with_capacity(ranking.len());
    for (entity, score, breakdown) in ranking {
        scores.insert(entity.id.clone(), score);
        hits.push(RankedHit {
            id: entity.id.clone(),
            score,
            breakdown,
        });
        entities.push(entity);
    }
    entities.sort_by(|a, b| a.id.cmp(&b.id));

    let mut result = GraphResult::default();
    result.stats.entities_returned = entities.len();
    result.stats.text_fallback = text_fallback;
    result.entities = entities;
    result.scores = scores;
    Ok(QueryResponse {
        kind: "search".to_string(),
        result,
        ranking: hits,
    })
}

async fn fusion_handler(
    State(state): State<ServiceState>,
    body: Option<Json<FusionRequest>>,
) -> ApiResult<FusionStats> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let stats = state
        .kernel
        .fusion()
        .fuse_cross_document_entities(request.entity_type.as_deref())
        .await?;
    record_fusion_metrics(&stats);
    Ok(Json(stats))
}

async fn import_handler(State(state): State<ServiceState>, Json(request): Json<ImportRequest>) -> ApiResult<ImportResult> {
    Ok(Json(state.kernel.importer().import_rows(&request.rows, &request.mapping).await?))
}

// ============================================================================
// Router Construction
// ============================================================================

/// Create the Axum router for the graph kernel service.
pub fn create_router(state: ServiceState) -> Router {
    Router::new()
        // Schema
        .route("/api/schema/entity-types", post(register_entity_type_handler))
        .route("/api/schema/relation-types", post(register_relation_type_handler))
        // Entities and relations
        .route("/api/entities", post(create_entity_handler).get(list_entities_handler))
        .route("/api/entities/:id", get(get_entity_handler).delete(delete_entity_handler))
        .route("/api/entities/:id/provenance", get(provenance_handler))
        .route("/api/relations", post(create_relation_handler))
        .route("/api/relations/:id", get(get_relation_handler))
        // Reasoning, fusion, ingestion
        .route("/api/query", post(query_handler))
        .route("/api/fusion", post(fusion_handler))
        .route("/api/import", post(import_handler))
        // Health checks
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .layer(axum::middleware::from_fn(super::middleware::metrics_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::context::KernelContext;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        let kernel = KernelContext::start(KernelConfig::default()).await.unwrap();
        kernel.schema().create_entity_type(EntityType::new("Person")).unwrap();
        kernel.schema().create_entity_type(EntityType::new("Company")).unwrap();
        kernel
            .schema()
            .create_relation_type(RelationType::new("WORKS_FOR").between(["Person"], ["Company"]))
            .unwrap();
        create_router(ServiceState::new(kernel))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_entity_lifecycle_and_logical_query() {
        let app = app().await;
        for entity in [
            serde_json::json!({"id": "a", "entity_type": "Person", "name": "Ada"}),
            serde_json::json!({"id": "c", "entity_type": "Company", "name": "Acme"}),
        ] {
            let response = app.clone().oneshot(post_json("/api/entities", entity)).await.unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        let relation = serde_json::json!({
            "id": "r", "relation_type": "WORKS_FOR", "source_id": "a", "target_id": "c"
        });
        let response = app.clone().oneshot(post_json("/api/relations", relation)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let query = serde_json::json!({"kind": "logical", "form": "Person(x) & WORKS_FOR(x, y) & Company(y)"});
        let response = app.clone().oneshot(post_json("/api/query", query)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"]["entities"][0]["id"], "c");
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let app = app().await;
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/entities/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], "NOT_FOUND");

        let query = serde_json::json!({"kind": "logical", "form": "WORKS_FOR(x"});
        let response = app.oneshot(post_json("/api/query", query)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_search_and_fusion() {
        let app = app().await;
        for (id, name) in [("p1", "Grace Hopper"), ("p2", "grace hopper"), ("p3", "Alan Turing")] {
            let entity = serde_json::json!({"id": id, "entity_type": "Person", "name": name});
            app.clone().oneshot(post_json("/api/entities", entity)).await.unwrap();
        }

        let search = serde_json::json!({"kind": "search", "text": "turing", "top_k": 2, "rerank": true});
        let body = body_json(app.clone().oneshot(post_json("/api/query", search)).await.unwrap()).await;
        assert_eq!(body["ranking"][0]["id"], "p3");
        assert!(body["ranking"][0]["breakdown"].is_object());

        let response = app.clone().oneshot(post_json("/api/fusion", serde_json::json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["groups_merged"], 1);

        let response = app
            .oneshot(Request::builder().uri("/api/entities/p2/provenance").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["entity_id"], "p2");
        assert!(body["canonical_id"].as_str().unwrap().starts_with("merged-"));
    }
}
