//! Plan execution against any [`GraphStore`].
//!
//! The working set is an id-keyed map, so execution has set semantics and
//! the result is always in entity id order. Merged and deleted entities never
//! enter the set.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Result;
use crate::store::GraphStore;
use crate::types::{Entity, EntityFilter, EntityId, Page};

use super::plan::{PlanOp, QueryPlan};

/// Executes query plans.
pub struct PlanExecutor<'a, S: GraphStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: GraphStore + ?Sized> PlanExecutor<'a, S> {
    /// Executor over `store`.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Run the plan, returning entities in id order.
    pub async fn execute(&self, plan: &QueryPlan) -> Result<Vec<Entity>> {
        plan.validate()?;
        let mut set: BTreeMap<EntityId, Entity> = BTreeMap::new();

        for stage in plan.stages() {
            let steps = &plan.steps[stage];
            if steps.len() > 1 {
                // Members of a concurrent stage are filters on the same input.
                set.retain(|_, entity| {
                    steps.iter().all(|step| match &step.op {
                        PlanOp::Filter { predicate } => predicate.matches(entity),
                        _ => true,
                    })
                });
                continue;
            }
            set = self.apply(&steps[0].op, set).await?;
            debug!(op = %steps[0].op, rows = set.len(), "Plan step executed");
        }

        Ok(set.into_values().collect())
    }

    async fn apply(&self, op: &PlanOp, mut set: BTreeMap<EntityId, Entity>) -> Result<BTreeMap<EntityId, Entity>> {
        match op {
            PlanOp::LookupEntities { ids } => Ok(self
                .store
                .get_entities(ids)
                .await?
                .into_iter()
                .filter(|e| e.is_active())
                .map(|e| (e.id.clone(), e))
                .collect()),
            PlanOp::ScanType { entity_type } => {
                let filter = EntityFilter::of_type(entity_type.clone());
                let mut out = BTreeMap::new();
                let mut page = Page::default();
                loop {
                    let batch = self.store.get_all_entities(&filter, page).await?;
                    let exhausted = batch.len() < page.limit;
                    out.extend(batch.into_iter().map(|e| (e.id.clone(), e)));
                    if exhausted {
                        return Ok(out);
                    }
                    page = page.next();
                }
            }
            PlanOp::VectorSearch { embedding, top_k } => Ok(self
                .store
                .vector_search(embedding, *top_k, &EntityFilter::any())
                .await?
                .into_iter()
                .map(|s| (s.entity.id.clone(), s.entity))
                .collect()),
            PlanOp::Expand {
                relation_types,
                direction,
            } => {
                let mut out = BTreeMap::new();
                for id in set.keys() {
                    let neighbors = match self.store.get_neighbors(id, *direction, relation_types).await {
                        Ok(neighbors) => neighbors,
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    };
                    for neighbor in neighbors {
                        if neighbor.entity.is_active() {
                            out.entry(neighbor.entity.id.clone()).or_insert(neighbor.entity);
                        }
                    }
                }
                Ok(out)
            }
            PlanOp::Filter { predicate } => {
                set.retain(|_, entity| predicate.matches(entity));
                Ok(set)
            }
            PlanOp::Limit { count } => Ok(set.into_iter().take(*count).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{OptimizationStrategy, OptimizerConfig, PlanStep, Predicate, QueryOptimizer, SelectivityHint};
    use crate::store::InMemoryGraphStore;
    use crate::types::{Direction, Relation};

    async fn store() -> InMemoryGraphStore {
        let store = InMemoryGraphStore::new();
        for (id, t, city) in [
            ("p1", "Person", "Paris"),
            ("p2", "Person", "Berlin"),
            ("p3", "Person", "Paris"),
            ("c1", "Company", "Paris"),
        ] {
            store
                .add_entity(Entity::new(id, t, id).with_property("city", city))
                .await
                .unwrap();
        }
        store.add_relation(Relation::new("r1", "WORKS_FOR", "p1", "c1")).await.unwrap();
        store.add_relation(Relation::new("r2", "WORKS_FOR", "p2", "c1")).await.unwrap();
        store
    }

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_scan_filter_expand() {
        let store = store().await;
        let plan = QueryPlan::from_source(PlanOp::ScanType {
            entity_type: "Person".to_string(),
        })
        .filter(
            Predicate::PropertyEquals {
                key: "city".to_string(),
                value: "Paris".into(),
            },
            SelectivityHint::filter(0.5, 1.0),
        )
        .then_op(PlanOp::Expand {
            relation_types: vec!["WORKS_FOR".to_string()],
            direction: Direction::Outgoing,
        });

        let result = PlanExecutor::new(&store).execute(&plan).await.unwrap();
        assert_eq!(ids(&result), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_optimized_plan_is_equivalent() {
        let store = store().await;
        let plan = QueryPlan::from_source(PlanOp::ScanType {
            entity_type: "Person".to_string(),
        })
        .filter(Predicate::MinConfidence { min: 0.0 }, SelectivityHint::filter(0.9, 1.0))
        .filter(
            Predicate::PropertyEquals {
                key: "city".to_string(),
                value: "Paris".into(),
            },
            SelectivityHint::filter(0.1, 1.0),
        )
        .then(PlanStep::new(PlanOp::Limit { count: 10 }));

        let executor = PlanExecutor::new(&store);
        let expected = executor.execute(&plan).await.unwrap();
        for strategy in [OptimizationStrategy::MinimizeTotalCost, OptimizationStrategy::MinimizeLatency] {
            let optimized = QueryOptimizer::new(OptimizerConfig::default().with_strategy(strategy))
                .optimize(plan.clone())
                .unwrap();
            let actual = executor.execute(&optimized.plan).await.unwrap();
            assert_eq!(ids(&actual), ids(&expected));
        }
        assert_eq!(ids(&expected), vec!["p1", "p3"]);
    }

    #[tokio::test]
    async fn test_limit_keeps_lowest_ids() {
        let store = store().await;
        let plan = QueryPlan::from_source(PlanOp::LookupEntities {
            ids: vec!["p3".into(), "p1".into(), "ghost".into()],
        })
        .then_op(PlanOp::Limit { count: 1 });
        let result = PlanExecutor::new(&store).execute(&plan).await.unwrap();
        assert_eq!(ids(&result), vec!["p1"]);
    }
}
