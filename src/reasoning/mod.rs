//! Multi-hop reasoning over a [`GraphStore`].
//!
//! - [`Reasoner::explain`]: connecting paths as evidence.
//! - [`Reasoner::answer`]: evaluate a [`LogicalForm`] through the optimizer.
//! - [`Reasoner::apply_rules`]: forward-chain [`InferenceRule`] relation chains.

pub mod logical_form;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::canonical::canonical_hash_hex;
use crate::error::Result;
use crate::optimizer::{PlanExecutor, QueryOptimizer};
use crate::runnable::{OperationContext, Runner};
use crate::store::GraphStore;
use crate::types::{Direction, Entity, EntityId, Evidence, InferenceRule, Path, ReasoningResult, Relation, RelationId};

pub use logical_form::{Atom, LogicalForm};

/// Reasoning entry point.
pub struct Reasoner<S: GraphStore + ?Sized> {
    store: Arc<S>,
    optimizer: QueryOptimizer,
    runner: Runner,
}

impl<S: GraphStore + ?Sized> Reasoner<S> {
    /// Reasoner with the default optimizer, writing directly.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            optimizer: QueryOptimizer::default(),
            runner: Runner::direct(),
        }
    }

    /// Use a configured optimizer.
    pub fn with_optimizer(mut self, optimizer: QueryOptimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Route materialized writes through `runner`.
    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runner = runner;
        self
    }

    /// How `start` connects to `end` within `max_depth` hops.
    ///
    /// Each path becomes one piece of evidence whose confidence is the product
    /// of its relation confidences; the result confidence is the best path's.
    pub async fn explain(&self, start: &EntityId, end: &EntityId, max_depth: usize) -> Result<ReasoningResult> {
        let paths = self.store.find_paths(start, end, max_depth).await?;
        let mut steps = vec![format!("searched paths {} -> {} up to depth {}", start, end, max_depth)];
        steps.extend(paths.iter().map(describe_path));

        let mut evidence: Vec<Evidence> = paths.into_iter().map(Evidence::from_path).collect();
        evidence.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let confidence = evidence.first().map(|e| e.confidence).unwrap_or(0.0);
        let conclusion = if evidence.is_empty() {
            format!("{} is not connected to {} within {} hops", start, end, max_depth)
        } else {
            format!("{} is connected to {} by {} path(s)", start, end, evidence.len())
        };
        Ok(ReasoningResult {
            conclusion,
            confidence,
            evidence,
            inferred: Vec::new(),
            steps,
        })
    }

    /// Entities bound to the form's answer variable, in id order.
    pub async fn answer(&self, form: &LogicalForm) -> Result<Vec<Entity>> {
        let plan = form.compile()?;
        let optimized = self.optimizer.optimize(plan)?;
        debug!(form = %form, plan = %optimized.plan.explain(), "Answering logical form");
        PlanExecutor::new(self.store.as_ref()).execute(&optimized.plan).await
    }

    /// Evaluate `rules` from each seed.
    ///
    /// A rule fires for every simple path from the seed matching its
    /// conditions hop by hop, concluding `conclusion(seed, end)`. Conclusions
    /// already present in the graph are skipped. Parallel derivations of the
    /// same conclusion keep the most confident one. With `materialize` the
    /// inferred relations are written back.
    pub async fn apply_rules(
        &self,
        rules: &[InferenceRule],
        seeds: &[EntityId],
        materialize: bool,
    ) -> Result<ReasoningResult> {
        let mut inferred: BTreeMap<RelationId, (Relation, Evidence)> = BTreeMap::new();
        let mut steps = Vec::new();

        for seed in seeds {
            let seed_entity = self.store.get_entity(seed).await?;
            for rule in rules {
                let paths = self.match_rule(rule, &seed_entity).await?;
                steps.push(format!("rule {} from {}: {} match(es)", rule.name, seed, paths.len()));
                for path in paths {
                    let Some(end) = path.end().map(|e| e.id.clone()) else {
                        continue;
                    };
                    if &end == seed || self.already_related(seed, &end, &rule.conclusion).await? {
                        continue;
                    }
                    let confidence = path.confidence() * rule.confidence;
                    let id = RelationId::new(format!(
                        "inf-{}",
                        canonical_hash_hex(&(&rule.name, seed.as_str(), end.as_str()))?
                    ));
                    let better = inferred.get(&id).map_or(true, |(r, _)| confidence > r.confidence);
                    if better {
                        let mut relation = Relation::new(id.clone(), rule.conclusion.clone(), seed.clone(), end)
                            .with_confidence(confidence);
                        relation.metadata.inferred_by = Some(rule.name.clone());
                        relation.metadata.tenant = seed_entity.metadata.tenant.clone();
                        inferred.insert(id, (relation, Evidence::from_path(path)));
                    }
                }
            }
        }

        let (relations, mut evidence): (Vec<Relation>, Vec<Evidence>) = inferred.into_values().unzip();
        if materialize {
            for relation in &relations {
                let op = OperationContext::new("reasoning.materialize", &relation.id);
                self.runner.call(&op, || self.store.add_relation(relation.clone())).await?;
            }
            steps.push(format!("materialized {} relation(s)", relations.len()));
        }
        evidence.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let confidence = relations.iter().map(|r| r.confidence).fold(0.0, f32::max);
        Ok(ReasoningResult {
            conclusion: format!("{} relation(s) inferred from {} seed(s)", relations.len(), seeds.len()),
            confidence,
            evidence,
            inferred: relations,
            steps,
        })
    }

    async fn match_rule(&self, rule: &InferenceRule, seed: &Entity) -> Result<Vec<Path>> {
        let mut frontier = vec![Path::single(seed.clone())];
        for condition in &rule.conditions {
            let mut next = Vec::new();
            for path in &frontier {
                let Some(end) = path.end() else { continue };
                let neighbors = self
                    .store
                    .get_neighbors(&end.id, condition.direction, std::slice::from_ref(&condition.relation_type))
                    .await?;
                for neighbor in neighbors {
                    let entity = &neighbor.entity;
                    if !entity.is_active() || path.contains(&entity.id) {
                        continue;
                    }
                    if condition.entity_type.as_ref().is_some_and(|t| t != &entity.entity_type) {
                        continue;
                    }
                    next.push(path.extended(neighbor.relation, neighbor.entity));
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        Ok(frontier.into_iter().filter(|p| !p.relations.is_empty()).collect())
    }

    async fn already_related(&self, source: &EntityId, target: &EntityId, relation_type: &str) -> Result<bool> {
        let types = [relation_type.to_string()];
        let neighbors = self.store.get_neighbors(source, Direction::Outgoing, &types).await?;
        Ok(neighbors.iter().any(|n| &n.entity.id == target))
    }
}

fn describe_path(path: &Path) -> String {
    let mut out = String::new();
    for (i, entity) in path.entities.iter().enumerate() {
        if i > 0 {
            out.push_str(&format!(" -[{}]-> ", path.relations[i - 1].relation_type));
        }
        out.push_str(entity.id.as_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGraphStore;
    use crate::types::RuleCondition;

    async fn family() -> Arc<InMemoryGraphStore> {
        let store = Arc::new(InMemoryGraphStore::new());
        for (id, t) in [("ann", "Person"), ("bob", "Person"), ("cy", "Person"), ("acme", "Company")] {
            store.add_entity(Entity::new(id, t, id)).await.unwrap();
        }
        store
            .add_relation(Relation::new("r1", "PARENT_OF", "ann", "bob").with_confidence(0.9))
            .await
            .unwrap();
        store
            .add_relation(Relation::new("r2", "PARENT_OF", "bob", "cy").with_confidence(0.8))
            .await
            .unwrap();
        store
            .add_relation(Relation::new("r3", "WORKS_FOR", "bob", "acme"))
            .await
            .unwrap();
        store
    }

    fn grandparent() -> InferenceRule {
        InferenceRule::new(
            "grandparent",
            vec![
                RuleCondition::follow("PARENT_OF").reaching("Person"),
                RuleCondition::follow("PARENT_OF").reaching("Person"),
            ],
            "GRANDPARENT_OF",
        )
        .with_confidence(0.5)
    }

    #[tokio::test]
    async fn test_explain_uses_paths_as_evidence() {
        let store = family().await;
        let reasoner = Reasoner::new(store);
        let result = reasoner.explain(&"ann".into(), &"cy".into(), 3).await.unwrap();
        assert!(result.is_supported());
        assert!((result.confidence - 0.72).abs() < 1e-6);

        let none = reasoner.explain(&"cy".into(), &"acme".into(), 1).await.unwrap();
        assert!(!none.is_supported());
        assert_eq!(none.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_rules_infer_and_materialize() {
        let store = family().await;
        let reasoner = Reasoner::new(Arc::clone(&store));
        let result = reasoner
            .apply_rules(&[grandparent()], &["ann".into(), "bob".into()], true)
            .await
            .unwrap();
        assert_eq!(result.inferred.len(), 1);
        let relation = &result.inferred[0];
        assert_eq!(relation.source_id.as_str(), "ann");
        assert_eq!(relation.target_id.as_str(), "cy");
        assert!((relation.confidence - 0.36).abs() < 1e-6);
        assert_eq!(relation.metadata.inferred_by.as_deref(), Some("grandparent"));

        let stored = store.get_relation(&relation.id).await.unwrap();
        assert_eq!(stored.relation_type, "GRANDPARENT_OF");

        // Materialized conclusions are not inferred again.
        let again = reasoner.apply_rules(&[grandparent()], &["ann".into()], false).await.unwrap();
        assert!(again.inferred.is_empty());
    }

    #[tokio::test]
    async fn test_answer_logical_form() {
        let store = family().await;
        let reasoner = Reasoner::new(store);
        let form = LogicalForm::parse("Person(x) & WORKS_FOR(x, y) & Company(y)").unwrap();
        let answers = reasoner.answer(&form).await.unwrap();
        let ids: Vec<&str> = answers.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["acme"]);

        let form = LogicalForm::parse(r#"Company(c) & WORKS_FOR(p, c) & p.name ~ "BO""#).unwrap();
        let answers = reasoner.answer(&form).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].id.as_str(), "bob");
    }
}
