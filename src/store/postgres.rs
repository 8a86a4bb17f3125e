//! PostgreSQL graph store for production use.
//!
//! ## Persisted layout
//!
//! | Table | Key | Columns |
//! |-------|-----|---------|
//! | `kg_entities` | `id` | `tenant`, `entity_type`, `name`, `properties` (jsonb), `embedding` (real[]), `metadata` (jsonb) |
//! | `kg_relations` | `id` | `relation_type`, `source_id`, `target_id`, `properties` (jsonb), `confidence`, `metadata` (jsonb) |
//! | `kg_type_registry` | `(kind, name, version)` | `definition` (jsonb) |
//!
//! Entities are indexed by `entity_type` and `tenant`; relations by both
//! endpoints.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;

use crate::error::{GraphError, ResourceKind, Result};
use crate::schema::{EntityType, RegistrySnapshot, RelationType};
use crate::types::{
    Direction, Entity, EntityFilter, EntityId, EntityMetadata, Neighbor, Page, Properties, Relation,
    RelationId, RelationMetadata,
};

use super::GraphStore;

/// Rows fetched per keyset batch while enumerating.
const SCAN_BATCH: i64 = 512;

const SCHEMA_DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS kg_entities (
        id TEXT PRIMARY KEY,
        tenant TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        name TEXT NOT NULL,
        properties JSONB NOT NULL DEFAULT '{}'::jsonb,
        embedding REAL[],
        metadata JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS kg_entities_type_idx ON kg_entities (entity_type, id)",
    "CREATE INDEX IF NOT EXISTS kg_entities_tenant_idx ON kg_entities (tenant, id)",
    r#"
    CREATE TABLE IF NOT EXISTS kg_relations (
        id TEXT PRIMARY KEY,
        relation_type TEXT NOT NULL,
        source_id TEXT NOT NULL REFERENCES kg_entities (id),
        target_id TEXT NOT NULL REFERENCES kg_entities (id),
        properties JSONB NOT NULL DEFAULT '{}'::jsonb,
        confidence REAL NOT NULL,
        metadata JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS kg_relations_source_idx ON kg_relations (source_id, relation_type)",
    "CREATE INDEX IF NOT EXISTS kg_relations_target_idx ON kg_relations (target_id, relation_type)",
    r#"
    CREATE TABLE IF NOT EXISTS kg_type_registry (
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        version INTEGER NOT NULL,
        definition JSONB NOT NULL,
        PRIMARY KEY (kind, name, version)
    )
    "#,
];

/// Configuration for PostgreSQL connection pool.
///
/// Production defaults:
/// - Pool size balances concurrency with connection limits
/// - Timeouts are aggressive to fail fast
/// - Idle timeout releases unused connections
/// - Max lifetime forces periodic reconnection for health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 10).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 2).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
}

impl PostgresConfig {
    /// Load configuration from environment variables with production defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", defaults.max_lifetime_secs),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/knowledge_graph".to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 10,
            idle_timeout_secs: 300,
            max_lifetime_secs: 1800,
        }
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Current pool size.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum pool size.
    pub max: u32,
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored JSON column could not be decoded.
    #[error("Corrupt row {id}: {message}")]
    CorruptRow {
        /// Row id.
        id: String,
        /// Decoder message.
        message: String,
    },
}

impl PostgresError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
            ),
            Self::CorruptRow { .. } => false,
        }
    }
}

fn backend(operation: &str, err: impl Into<PostgresError>) -> GraphError {
    let err = err.into();
    let transient = err.is_transient();
    GraphError::backend(operation, err, transient)
}

/// PostgreSQL graph store.
///
/// Uses connection pooling with production-tuned settings.
pub struct PostgresGraphStore {
    pool: PgPool,
}

impl PostgresGraphStore {
    /// Create a new store with the given configuration.
    pub async fn new(config: PostgresConfig) -> std::result::Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            "Initializing PostgreSQL connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Store over an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store from environment variables.
    pub async fn from_env() -> std::result::Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Get the connection pool for health checks.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    /// Get pool statistics for monitoring.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }

    /// Persist every version of every type definition.
    pub async fn save_registry(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| backend("save_registry", e))?;
        let entity_rows = snapshot
            .entity_types
            .iter()
            .map(|t| ("entity", t.name.as_str(), t.version, serde_json::to_value(t)));
        let relation_rows = snapshot
            .relation_types
            .iter()
            .map(|t| ("relation", t.name.as_str(), t.version, serde_json::to_value(t)));
        for (kind, name, version, definition) in entity_rows.chain(relation_rows) {
            let definition = definition.map_err(|e| GraphError::backend("save_registry", e, false))?;
            sqlx::query(
                r#"
                INSERT INTO kg_type_registry (kind, name, version, definition)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (kind, name, version) DO UPDATE SET definition = EXCLUDED.definition
                "#,
            )
            .bind(kind)
            .bind(name)
            .bind(version as i32)
            .bind(Json(definition))
            .execute(&mut *tx)
            .await
            .map_err(|e| backend("save_registry", e))?;
        }
        tx.commit().await.map_err(|e| backend("save_registry", e))?;
        Ok(())
    }

    /// Load the persisted registry, versions in ascending order.
    pub async fn load_registry(&self) -> Result<RegistrySnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT kind, name, definition
            FROM kg_type_registry
            ORDER BY kind, name, version
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("load_registry", e))?;

        let mut snapshot = RegistrySnapshot::default();
        for row in &rows {
            let kind: String = row.try_get("kind").map_err(|e| backend("load_registry", e))?;
            let name: String = row.try_get("name").map_err(|e| backend("load_registry", e))?;
            let Json(definition): Json<serde_json::Value> =
                row.try_get("definition").map_err(|e| backend("load_registry", e))?;
            match kind.as_str() {
                "entity" => snapshot
                    .entity_types
                    .push(decode_json::<EntityType>(&name, definition, "load_registry")?),
                _ => snapshot
                    .relation_types
                    .push(decode_json::<RelationType>(&name, definition, "load_registry")?),
            }
        }
        Ok(snapshot)
    }

    fn parse_entity_row(row: &PgRow) -> Result<Entity> {
        let op = "parse_entity";
        let id: String = row.try_get("id").map_err(|e| backend(op, e))?;
        let Json(properties): Json<Properties> = row.try_get("properties").map_err(|e| backend(op, e))?;
        let Json(metadata): Json<EntityMetadata> = row.try_get("metadata").map_err(|e| backend(op, e))?;
        Ok(Entity {
            entity_type: row.try_get("entity_type").map_err(|e| backend(op, e))?,
            name: row.try_get("name").map_err(|e| backend(op, e))?,
            embedding: row.try_get("embedding").map_err(|e| backend(op, e))?,
            id: EntityId::new(id),
            properties,
            metadata,
        })
    }

    fn parse_relation_row(row: &PgRow) -> Result<Relation> {
        let op = "parse_relation";
        let id: String = row.try_get("id").map_err(|e| backend(op, e))?;
        let source_id: String = row.try_get("source_id").map_err(|e| backend(op, e))?;
        let target_id: String = row.try_get("target_id").map_err(|e| backend(op, e))?;
        let Json(properties): Json<Properties> = row.try_get("properties").map_err(|e| backend(op, e))?;
        let Json(metadata): Json<RelationMetadata> = row.try_get("metadata").map_err(|e| backend(op, e))?;
        Ok(Relation {
            id: RelationId::new(id),
            relation_type: row.try_get("relation_type").map_err(|e| backend(op, e))?,
            source_id: EntityId::new(source_id),
            target_id: EntityId::new(target_id),
            confidence: row.try_get("confidence").map_err(|e| backend(op, e))?,
            properties,
            metadata,
        })
    }

    /// One neighbor direction: relations whose `anchor` column equals `id`,
    /// joined with the entity at the other end.
    async fn neighbors_via(
        &self,
        id: &EntityId,
        anchor: &str,
        other: &str,
        relation_types: &[String],
    ) -> Result<Vec<Neighbor>> {
        let sql = format!(
            r#"
            SELECT r.id, r.relation_type, r.source_id, r.target_id, r.properties,
                   r.confidence, r.metadata,
                   e.id AS e_id, e.entity_type AS e_entity_type, e.name AS e_name,
                   e.properties AS e_properties, e.embedding AS e_embedding,
                   e.metadata AS e_metadata
            FROM kg_relations r
            JOIN kg_entities e ON e.id = r.{other}
            WHERE r.{anchor} = $1
              AND (cardinality($2::text[]) = 0 OR r.relation_type = ANY($2))
            ORDER BY r.id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(relation_types)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("get_neighbors", e))?;

        rows.iter()
            .map(|row| {
                let relation = Self::parse_relation_row(row)?;
                let op = "get_neighbors";
                let Json(properties): Json<Properties> = row.try_get("e_properties").map_err(|e| backend(op, e))?;
                let Json(metadata): Json<EntityMetadata> = row.try_get("e_metadata").map_err(|e| backend(op, e))?;
                let entity_id: String = row.try_get("e_id").map_err(|e| backend(op, e))?;
                let entity = Entity {
                    id: EntityId::new(entity_id),
                    entity_type: row.try_get("e_entity_type").map_err(|e| backend(op, e))?,
                    name: row.try_get("e_name").map_err(|e| backend(op, e))?,
                    embedding: row.try_get("e_embedding").map_err(|e| backend(op, e))?,
                    properties,
                    metadata,
                };
                Ok(Neighbor::new(relation, entity))
            })
            .collect()
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(id: &str, value: serde_json::Value, operation: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        backend(
            operation,
            PostgresError::CorruptRow {
                id: id.to_string(),
                message: e.to_string(),
            },
        )
    })
}

#[async_trait]
impl GraphStore for PostgresGraphStore {
    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA_DDL {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| backend("initialize", e))?;
        }
        tracing::info!("Graph tables ready");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn add_entity(&self, entity: Entity) -> Result<EntityId> {
        sqlx::query(
            r#"
            INSERT INTO kg_entities (id, tenant, entity_type, name, properties, embedding, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                tenant = EXCLUDED.tenant,
                entity_type = EXCLUDED.entity_type,
                name = EXCLUDED.name,
                properties = EXCLUDED.properties,
                embedding = EXCLUDED.embedding,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(entity.id.as_str())
        .bind(&entity.metadata.tenant)
        .bind(&entity.entity_type)
        .bind(&entity.name)
        .bind(Json(&entity.properties))
        .bind(&entity.embedding)
        .bind(Json(&entity.metadata))
        .execute(&self.pool)
        .await
        .map_err(|e| backend("add_entity", e))?;
        Ok(entity.id)
    }

    async fn get_entity(&self, id: &EntityId) -> Result<Entity> {
        let row = sqlx::query(
            r#"
            SELECT id, entity_type, name, properties, embedding, metadata
            FROM kg_entities
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("get_entity", e))?;

        match row {
            Some(ref r) => Self::parse_entity_row(r),
            None => Err(GraphError::not_found(ResourceKind::Entity, id)),
        }
    }

    async fn add_relation(&self, relation: Relation) -> Result<RelationId> {
        let existing: Vec<String> = sqlx::query_scalar("SELECT id FROM kg_entities WHERE id = ANY($1)")
            .bind(vec![relation.source_id.as_str(), relation.target_id.as_str()])
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("add_relation", e))?;
        for endpoint in [&relation.source_id, &relation.target_id] {
            if !existing.iter().any(|id| id == endpoint.as_str()) {
                return Err(GraphError::not_found(ResourceKind::Entity, endpoint));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO kg_relations (id, relation_type, source_id, target_id, properties, confidence, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                relation_type = EXCLUDED.relation_type,
                source_id = EXCLUDED.source_id,
                target_id = EXCLUDED.target_id,
                properties = EXCLUDED.properties,
                confidence = EXCLUDED.confidence,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(relation.id.as_str())
        .bind(&relation.relation_type)
        .bind(relation.source_id.as_str())
        .bind(relation.target_id.as_str())
        .bind(Json(&relation.properties))
        .bind(relation.confidence)
        .bind(Json(&relation.metadata))
        .execute(&self.pool)
        .await
        .map_err(|e| backend("add_relation", e))?;
        Ok(relation.id)
    }

    async fn get_relation(&self, id: &RelationId) -> Result<Relation> {
        let row = sqlx::query(
            r#"
            SELECT id, relation_type, source_id, target_id, properties, confidence, metadata
            FROM kg_relations
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("get_relation", e))?;

        match row {
            Some(ref r) => Self::parse_relation_row(r),
            None => Err(GraphError::not_found(ResourceKind::Relation, id)),
        }
    }

    async fn get_neighbors(
        &self,
        entity_id: &EntityId,
        direction: Direction,
        relation_types: &[String],
    ) -> Result<Vec<Neighbor>> {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM kg_entities WHERE id = $1")
            .bind(entity_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("get_neighbors", e))?;
        if exists.is_none() {
            return Err(GraphError::not_found(ResourceKind::Entity, entity_id));
        }

        let mut neighbors = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            neighbors.extend(self.neighbors_via(entity_id, "source_id", "target_id", relation_types).await?);
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            for neighbor in self.neighbors_via(entity_id, "target_id", "source_id", relation_types).await? {
                // Self-loops already came back through the outgoing side.
                if !neighbors.iter().any(|n| n.relation.id == neighbor.relation.id) {
                    neighbors.push(neighbor);
                }
            }
        }
        Ok(neighbors)
    }

    async fn get_all_entities(&self, filter: &EntityFilter, page: Page) -> Result<Vec<Entity>> {
        // Type and tenant are pushed down; the rest of the filter is applied
        // while walking id-ordered keyset batches.
        let mut out = Vec::new();
        if page.limit == 0 {
            return Ok(out);
        }
        let mut skipped = 0usize;
        let mut after = String::new();
        loop {
            let rows = sqlx::query(
                r#"
                SELECT id, entity_type, name, properties, embedding, metadata
                FROM kg_entities
                WHERE id > $1
                  AND (cardinality($2::text[]) = 0 OR entity_type = ANY($2))
                  AND ($3::text IS NULL OR tenant = $3)
                ORDER BY id
                LIMIT $4
                "#,
            )
            .bind(&after)
            .bind(&filter.entity_types)
            .bind(&filter.tenant)
            .bind(SCAN_BATCH)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("get_all_entities", e))?;

            let exhausted = (rows.len() as i64) < SCAN_BATCH;
            for row in &rows {
                let entity = Self::parse_entity_row(row)?;
                after = entity.id.as_str().to_string();
                if !filter.matches(&entity) {
                    continue;
                }
                if skipped < page.offset {
                    skipped += 1;
                    continue;
                }
                out.push(entity);
                if out.len() >= page.limit {
                    return Ok(out);
                }
            }
            if exhausted {
                return Ok(out);
            }
        }
    }
}
