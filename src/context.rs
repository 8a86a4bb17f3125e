//! Process-scoped kernel context.
//!
//! [`KernelContext`] owns everything a process shares: configuration, the
//! cached schema registry, the runner and its metrics sink, the optional
//! embedder and the layered store. It is built explicitly with
//! [`KernelBuilder::start`] and torn down with [`KernelContext::shutdown`].
//!
//! ## Store layering
//!
//! ```text
//! ValidatedStore (schema checks on writes)
//!   └── ResilientStore (retry, timeout, breaker, rate limit)
//!         └── backend (memory | postgres)
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::{KernelConfig, StorageBackend};
use crate::embedding::Embedder;
use crate::error::{GraphError, Result};
use crate::fusion::FusionEngine;
use crate::ingest::Importer;
use crate::optimizer::QueryOptimizer;
use crate::reasoning::Reasoner;
use crate::rerank::Reranker;
use crate::runnable::{MetricsSink, Runner, TracingMetrics};
use crate::schema::{CachedSchemaRegistry, SchemaLookup, SchemaRegistry};
use crate::store::{GraphStore, InMemoryGraphStore, ResilientStore, ValidatedStore};

#[cfg(feature = "postgres")]
use crate::store::PostgresGraphStore;

/// Store handle shared across components.
pub type SharedStore = Arc<dyn GraphStore>;

/// Collects the injectable parts of a [`KernelContext`].
pub struct KernelBuilder {
    config: KernelConfig,
    registry: Option<Arc<SchemaRegistry>>,
    metrics: Arc<dyn MetricsSink>,
    embedder: Option<Arc<dyn Embedder>>,
    backend: Option<SharedStore>,
}

impl KernelBuilder {
    /// Use an existing registry instead of an empty (or persisted) one.
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Metrics destination. Defaults to `tracing` events.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Embedder used for vector queries and semantic reranking.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Custom backend in place of the configured one. It is still wrapped
    /// with resilience and validation.
    pub fn with_backend(mut self, backend: SharedStore) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Connect and initialize the backend, load the persisted schema (for
    /// PostgreSQL) and assemble the context.
    pub async fn start(self) -> Result<KernelContext> {
        self.config.validate()?;
        let Self {
            config,
            registry,
            metrics,
            embedder,
            backend,
        } = self;

        let runner = Runner::with_metrics(config.runner.clone(), Arc::clone(&metrics));

        #[cfg(feature = "postgres")]
        let mut registry_store = None;

        let (backend, registry): (SharedStore, Arc<SchemaRegistry>) = match (backend, config.storage.backend) {
            (Some(custom), _) => {
                custom.initialize().await?;
                (custom, registry.unwrap_or_default())
            }
            (None, StorageBackend::Memory) => {
                let store = InMemoryGraphStore::new();
                store.initialize().await?;
                (Arc::new(store), registry.unwrap_or_default())
            }
            #[cfg(feature = "postgres")]
            (None, StorageBackend::Postgres) => {
                let store = PostgresGraphStore::new(config.storage.postgres.clone())
                    .await
                    .map_err(|e| GraphError::backend("connect", e, true))?;
                store.initialize().await?;
                let registry = match registry {
                    Some(registry) => registry,
                    None => Arc::new(SchemaRegistry::from_snapshot(store.load_registry().await?)),
                };
                registry_store = Some(PostgresGraphStore::from_pool(store.pool().clone()));
                (Arc::new(store), registry)
            }
            #[cfg(not(feature = "postgres"))]
            (None, StorageBackend::Postgres) => {
                return Err(GraphError::Unsupported(
                    "postgres backend requires the `postgres` feature".to_string(),
                ))
            }
        };

        let schema = Arc::new(CachedSchemaRegistry::new(registry, &config.schema_cache));
        let mut resilient = ResilientStore::new(backend, runner.clone());
        if let Some(limit) = &config.storage.rate_limit {
            resilient = resilient.with_rate_limit(limit);
        }
        let store: SharedStore = Arc::new(ValidatedStore::new(resilient, Arc::clone(&schema)));

        info!(
            backend = ?config.storage.backend,
            embedder = embedder.is_some(),
            "Kernel context started"
        );

        Ok(KernelContext {
            config,
            schema,
            runner,
            metrics,
            embedder,
            store,
            #[cfg(feature = "postgres")]
            registry_store,
        })
    }
}

/// Shared kernel state.
pub struct KernelContext {
    config: KernelConfig,
    schema: Arc<CachedSchemaRegistry>,
    runner: Runner,
    metrics: Arc<dyn MetricsSink>,
    embedder: Option<Arc<dyn Embedder>>,
    store: SharedStore,
    #[cfg(feature = "postgres")]
    registry_store: Option<PostgresGraphStore>,
}

impl KernelContext {
    /// Builder over `config`.
    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder {
            config,
            registry: None,
            metrics: Arc::new(TracingMetrics),
            embedder: None,
            backend: None,
        }
    }

    /// Start with `config` and no injected parts.
    pub async fn start(config: KernelConfig) -> Result<Self> {
        Self::builder(config).start().await
    }

    /// Configuration.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Cached schema registry.
    pub fn schema(&self) -> &Arc<CachedSchemaRegistry> {
        &self.schema
    }

    /// Runner shared by every component.
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Embedder, if one was injected.
    pub fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    /// Layered store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Fusion engine over the store.
    ///
    /// The store already retries; the engine's own writes go through a
    /// runner sharing the metrics sink so merge counters land in one place.
    /// Planned merges are checked against the cached registry up front.
    pub fn fusion(&self) -> FusionEngine<dyn GraphStore> {
        let schema: Arc<dyn SchemaLookup> = self.schema.clone();
        FusionEngine::new(Arc::clone(&self.store), self.config.fusion.clone())
            .with_runner(Runner::passthrough(Arc::clone(&self.metrics)))
            .with_schema(schema)
    }

    /// Reasoner using the configured optimizer.
    pub fn reasoner(&self) -> Reasoner<dyn GraphStore> {
        Reasoner::new(Arc::clone(&self.store)).with_optimizer(QueryOptimizer::new(self.config.optimizer.clone()))
    }

    /// Importer validating against the cached registry.
    pub fn importer(&self) -> Importer<dyn GraphStore> {
        let schema: Arc<dyn SchemaLookup> = self.schema.clone();
        Importer::new(Arc::clone(&self.store)).with_schema(schema)
    }

    /// Reranker from configuration.
    pub fn reranker(&self) -> Reranker {
        Reranker::from_config(&self.config.rerank)
    }

    /// Persist the schema (PostgreSQL) and release backend resources.
    pub async fn shutdown(self) -> Result<()> {
        #[cfg(feature = "postgres")]
        if let Some(store) = &self.registry_store {
            store.save_registry(&self.schema.registry().snapshot()).await?;
        }
        self.store.close().await?;
        info!("Kernel context shut down");
        Ok(())
    }
}
