//! Store wrapper that runs every Tier-1 call through the execution substrate.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::runnable::{OperationContext, Runner};
use crate::types::{Direction, Entity, EntityFilter, EntityId, Neighbor, Page, Relation, RelationId, ScoredEntity};

use super::{GraphStore, RateLimitConfig, TokenBucket};

/// Wraps a backend with retry, timeout, circuit breaking and optional rate
/// limiting. Tier-2 operations use the defaults, so each of their Tier-1
/// calls is individually protected.
pub struct ResilientStore<S> {
    inner: S,
    runner: Runner,
    limiter: Option<Arc<TokenBucket>>,
}

impl<S: GraphStore> ResilientStore<S> {
    /// Wrap `inner` with `runner`.
    pub fn new(inner: S, runner: Runner) -> Self {
        Self {
            inner,
            runner,
            limiter: None,
        }
    }

    /// Gate every call through a token bucket.
    pub fn with_rate_limit(mut self, config: &RateLimitConfig) -> Self {
        self.limiter = Some(Arc::new(TokenBucket::new(config)));
        self
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The runner.
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    async fn permit(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
    }
}

#[async_trait]
impl<S: GraphStore> GraphStore for ResilientStore<S> {
    async fn initialize(&self) -> Result<()> {
        let op = OperationContext::new("initialize", "store");
        self.runner.call(&op, || self.inner.initialize()).await
    }

    async fn close(&self) -> Result<()> {
        let op = OperationContext::new("close", "store").non_idempotent();
        self.runner.call(&op, || self.inner.close()).await
    }

    async fn add_entity(&self, entity: Entity) -> Result<EntityId> {
        self.permit().await;
        let op = OperationContext::new("add_entity", &entity.id);
        self.runner.call(&op, || self.inner.add_entity(entity.clone())).await
    }

    async fn get_entity(&self, id: &EntityId) -> Result<Entity> {
        self.permit().await;
        let op = OperationContext::new("get_entity", id);
        self.runner.call(&op, || self.inner.get_entity(id)).await
    }

    async fn add_relation(&self, relation: Relation) -> Result<RelationId> {
        self.permit().await;
        let op = OperationContext::new("add_relation", &relation.id);
        self.runner.call(&op, || self.inner.add_relation(relation.clone())).await
    }

    async fn get_relation(&self, id: &RelationId) -> Result<Relation> {
        self.permit().await;
        let op = OperationContext::new("get_relation", id);
        self.runner.call(&op, || self.inner.get_relation(id)).await
    }

    async fn get_neighbors(
        &self,
        entity_id: &EntityId,
        direction: Direction,
        relation_types: &[String],
    ) -> Result<Vec<Neighbor>> {
        self.permit().await;
        let op = OperationContext::new("get_neighbors", entity_id);
        self.runner
            .call(&op, || self.inner.get_neighbors(entity_id, direction, relation_types))
            .await
    }

    async fn get_all_entities(&self, filter: &EntityFilter, page: Page) -> Result<Vec<Entity>> {
        self.permit().await;
        let op = OperationContext::new("get_all_entities", page.offset);
        self.runner.call(&op, || self.inner.get_all_entities(filter, page)).await
    }

    async fn vector_search(&self, embedding: &[f32], top_k: usize, filter: &EntityFilter) -> Result<Vec<ScoredEntity>> {
        self.permit().await;
        let op = OperationContext::new("vector_search", top_k);
        self.runner
            .call(&op, || self.inner.vector_search(embedding, top_k, filter))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::runnable::{BreakerConfig, InMemoryMetrics, RetryPolicy, RunnerConfig};
    use crate::store::InMemoryGraphStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` entity reads with a transient error.
    struct Flaky {
        inner: InMemoryGraphStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl GraphStore for Flaky {
        async fn initialize(&self) -> Result<()> {
            self.inner.initialize().await
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
        async fn add_entity(&self, entity: Entity) -> Result<EntityId> {
            self.inner.add_entity(entity).await
        }
        async fn get_entity(&self, id: &EntityId) -> Result<Entity> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(GraphError::backend("get_entity", "connection reset", true));
            }
            self.inner.get_entity(id).await
        }
        async fn add_relation(&self, relation: Relation) -> Result<RelationId> {
            self.inner.add_relation(relation).await
        }
        async fn get_relation(&self, id: &RelationId) -> Result<Relation> {
            self.inner.get_relation(id).await
        }
        async fn get_neighbors(&self, id: &EntityId, d: Direction, t: &[String]) -> Result<Vec<Neighbor>> {
            self.inner.get_neighbors(id, d, t).await
        }
        async fn get_all_entities(&self, f: &EntityFilter, p: Page) -> Result<Vec<Entity>> {
            self.inner.get_all_entities(f, p).await
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            inner: InMemoryGraphStore::new(),
            failures: AtomicU32::new(failures),
        }
    }

    fn runner(metrics: Arc<InMemoryMetrics>, breaker: Option<BreakerConfig>) -> Runner {
        Runner::with_metrics(
            RunnerConfig {
                retry: RetryPolicy::new(3, Duration::from_millis(10)),
                attempt_timeout_ms: Some(1_000),
                breaker,
            },
            metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_is_retried() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let store = ResilientStore::new(flaky(2), runner(Arc::clone(&metrics), None));
        store.add_entity(Entity::new("a", "Person", "Alice")).await.unwrap();

        let entity = store.get_entity(&EntityId::from("a")).await.unwrap();
        assert_eq!(entity.name, "Alice");

        let runs = metrics.runs_for("get_entity");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].attempts, 3);
        assert_eq!(runs[0].retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let store = ResilientStore::new(flaky(0), runner(Arc::clone(&metrics), None));

        let err = store.get_entity(&EntityId::from("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(metrics.runs_for("get_entity")[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_fails_fast_after_exhaustion() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let breaker = BreakerConfig::new(3, Duration::from_secs(30));
        let store = ResilientStore::new(flaky(100), runner(Arc::clone(&metrics), Some(breaker)));

        let err = store.get_entity(&EntityId::from("a")).await.unwrap_err();
        assert!(matches!(err, GraphError::RetryExhausted { attempts: 3, .. }));

        let err = store.get_entity(&EntityId::from("a")).await.unwrap_err();
        assert!(matches!(err, GraphError::CircuitOpen { .. }));
        assert_eq!(store.inner().failures.load(Ordering::SeqCst), 97);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier2_runs_through_wrapper() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let store = ResilientStore::new(flaky(0), runner(Arc::clone(&metrics), None))
            .with_rate_limit(&RateLimitConfig {
                capacity: 10,
                refill_per_sec: 10,
            });
        store.add_entity(Entity::new("a", "Person", "A")).await.unwrap();
        store.add_entity(Entity::new("b", "Person", "B")).await.unwrap();
        store.add_relation(Relation::new("r1", "KNOWS", "a", "b")).await.unwrap();

        let paths = store.traverse(&EntityId::from("a"), 2, &[]).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert!(!metrics.runs_for("get_neighbors").is_empty());
    }
}
