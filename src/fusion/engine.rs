//! Cross-document entity fusion.
//!
//! A run plans every merge before writing anything, so `fail_on_conflict`
//! and schema violations abort with the store untouched. Unresolved values
//! live in `metadata.conflicting_values`, never in the typed property slot. Merging is a projection: members stay in
//! the store marked `merged_into`, the canonical entity lists them in
//! `merged_from`, and relations are copied onto canonical endpoints.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::canonical::{canonical_hash_hex, hash_key_set};
use crate::error::{GraphError, ResourceKind, Result};
use crate::runnable::{OperationContext, Runner};
use crate::schema::SchemaLookup;
use crate::store::GraphStore;
use crate::types::{
    Direction, Entity, EntityFilter, EntityId, EntityMetadata, Page, Properties, PropertyValue, Relation,
    RelationId, RelationMetadata,
};

use super::config::FusionConfig;
use super::consensus::{resolve, Contribution, Resolution};
use super::index::CandidateIndex;
use super::similarity::name_similarity;

/// Longest `merged_into` chain followed before giving up.
const MAX_CANONICAL_HOPS: usize = 64;

/// A property whose votes fell short of the agreement threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyConflict {
    /// Canonical entity carrying the conflict.
    pub entity_id: EntityId,
    /// Property name.
    pub property: String,
    /// Best weighted agreement.
    pub agreement: f64,
    /// Candidate values, strongest first.
    pub values: Vec<PropertyValue>,
}

/// Outcome of a fusion run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FusionStats {
    /// Active entities examined.
    pub entities_considered: usize,
    /// Candidate pairs scored.
    pub comparisons: usize,
    /// Merge groups formed.
    pub groups_merged: usize,
    /// Active entities folded into a canonical entity.
    pub entities_merged: usize,
    /// Relations copied onto canonical endpoints.
    pub relations_projected: usize,
    /// Canonical entities written, in id order.
    pub canonical_ids: Vec<EntityId>,
    /// Unresolved property conflicts.
    pub conflicts: Vec<PropertyConflict>,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// Where an entity's data came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProvenance {
    /// Entity asked about.
    pub entity_id: EntityId,
    /// Canonical entity it resolves to (itself when not merged).
    pub canonical_id: EntityId,
    /// Whether the entity is itself the active canonical entity.
    pub is_canonical: bool,
    /// Original entities folded into the canonical entity.
    pub members: Vec<EntityId>,
    /// Every source that contributed.
    pub sources: Vec<String>,
    /// Canonical confidence.
    pub confidence: f32,
    /// Properties left unresolved on the canonical entity.
    pub unresolved_conflicts: Vec<String>,
}

struct MergePlan {
    canonical: Entity,
    /// Every entity re-pointed at the canonical one: active members plus the
    /// originals behind members that were canonical themselves.
    absorbed: Vec<Entity>,
    /// Active members, the entities counted as merged in this run.
    active_members: usize,
}

/// Deduplicates entities across documents.
pub struct FusionEngine<S: GraphStore + ?Sized> {
    store: Arc<S>,
    config: FusionConfig,
    runner: Runner,
    schema: Option<Arc<dyn SchemaLookup>>,
}

impl<S: GraphStore + ?Sized> FusionEngine<S> {
    /// Engine writing straight to `store`.
    pub fn new(store: Arc<S>, config: FusionConfig) -> Self {
        Self {
            store,
            config,
            runner: Runner::direct(),
            schema: None,
        }
    }

    /// Check every planned canonical entity against `schema` before the
    /// first write.
    pub fn with_schema(mut self, schema: Arc<dyn SchemaLookup>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Route writes through `runner`.
    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runner = runner;
        self
    }

    /// Configuration.
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Merge duplicate entities, optionally restricted to one type.
    ///
    /// Entities are only compared within the same tenant and type.
    pub async fn fuse_cross_document_entities(&self, entity_type: Option<&str>) -> Result<FusionStats> {
        let started = Instant::now();
        let filter = match entity_type {
            Some(t) => EntityFilter::of_type(t),
            None => EntityFilter::any(),
        };
        let entities = self.load(&filter).await?;
        let mut stats = FusionStats {
            entities_considered: entities.len(),
            ..FusionStats::default()
        };

        let mut blocks: BTreeMap<(&str, &str), Vec<usize>> = BTreeMap::new();
        for (i, entity) in entities.iter().enumerate() {
            blocks
                .entry((entity.metadata.tenant.as_str(), entity.entity_type.as_str()))
                .or_default()
                .push(i);
        }

        let mut sets = UnionFind::new(entities.len());
        for block in blocks.values() {
            let index = CandidateIndex::build(
                block.iter().map(|&i| entities[i].name.as_str()),
                self.config.max_candidates,
            );
            for (pos, &i) in block.iter().enumerate() {
                for candidate in index.candidates(pos) {
                    let j = block[candidate];
                    stats.comparisons += 1;
                    if name_similarity(&entities[i].name, &entities[j].name) >= self.config.similarity_threshold {
                        sets.union(i, j);
                    }
                }
            }
        }

        let mut plans = Vec::new();
        for group in sets.groups() {
            let members: Vec<&Entity> = group.iter().map(|&i| &entities[i]).collect();
            let plan = self.plan_merge(&members, &mut stats.conflicts).await?;
            if self.config.fail_on_conflict {
                if let Some(conflict) = stats.conflicts.first() {
                    return Err(GraphError::ConflictUnresolved {
                        entity_id: conflict.entity_id.to_string(),
                        property: conflict.property.clone(),
                        agreement: conflict.agreement,
                        threshold: self.config.agreement_threshold,
                    });
                }
            }
            plans.push(plan);
        }
        self.check_plans(&plans)?;

        let mapping: BTreeMap<EntityId, EntityId> = plans
            .iter()
            .flat_map(|p| p.absorbed.iter().map(move |e| (e.id.clone(), p.canonical.id.clone())))
            .collect();

        for plan in &plans {
            self.write_merge(plan).await?;
            stats.groups_merged += 1;
            stats.entities_merged += plan.active_members;
            stats.canonical_ids.push(plan.canonical.id.clone());
        }
        stats.relations_projected = self.project_relations(&plans, &mapping).await?;
        stats.canonical_ids.sort();

        if stats.groups_merged > 0 {
            self.runner
                .metrics()
                .increment("fusion_merges", stats.groups_merged as u64);
        }
        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            entities = stats.entities_considered,
            comparisons = stats.comparisons,
            groups = stats.groups_merged,
            relations = stats.relations_projected,
            conflicts = stats.conflicts.len(),
            duration_ms = stats.duration_ms,
            "Fusion run complete"
        );
        Ok(stats)
    }

    /// Follow `merged_into` links to the entity that currently stands for `id`.
    pub async fn resolve_canonical(&self, id: &EntityId) -> Result<EntityId> {
        let mut current = self.store.get_entity(id).await?;
        let mut seen = BTreeSet::from([current.id.clone()]);
        for _ in 0..MAX_CANONICAL_HOPS {
            let Some(next) = current.metadata.merged_into.clone() else {
                return Ok(current.id);
            };
            if !seen.insert(next.clone()) {
                break;
            }
            current = self.store.get_entity(&next).await?;
        }
        Err(GraphError::validation(
            "metadata.merged_into",
            format!("merge chain from {} does not terminate", id),
        ))
    }

    /// Provenance of an entity through its canonical entity.
    pub async fn track_entity_provenance(&self, id: &EntityId) -> Result<EntityProvenance> {
        let canonical_id = self.resolve_canonical(id).await?;
        let canonical = self.store.get_entity(&canonical_id).await?;
        let members = if canonical.metadata.merged_from.is_empty() {
            vec![canonical.id.clone()]
        } else {
            canonical.metadata.merged_from.clone()
        };
        let mut sources: BTreeSet<String> = canonical.metadata.sources.iter().cloned().collect();
        sources.extend(canonical.metadata.source.clone());
        Ok(EntityProvenance {
            entity_id: id.clone(),
            is_canonical: &canonical_id == id,
            canonical_id,
            members,
            sources: sources.into_iter().collect(),
            confidence: canonical.metadata.confidence,
            unresolved_conflicts: canonical.metadata.unresolved_conflicts.clone(),
        })
    }

    fn check_plans(&self, plans: &[MergePlan]) -> Result<()> {
        let Some(schema) = &self.schema else {
            return Ok(());
        };
        for plan in plans {
            let canonical = &plan.canonical;
            if let Some(issue) = schema
                .check_entity(&canonical.entity_type, &canonical.properties)?
                .into_iter()
                .next()
            {
                debug!(canonical = %canonical.id, error = %issue, "Planned merge violates schema");
                return Err(issue);
            }
        }
        Ok(())
    }

    async fn load(&self, filter: &EntityFilter) -> Result<Vec<Entity>> {
        let mut out = Vec::new();
        let mut page = Page::default();
        loop {
            let batch = self.store.get_all_entities(filter, page).await?;
            let exhausted = batch.len() < page.limit;
            out.extend(batch);
            if exhausted {
                return Ok(out);
            }
            page = page.next();
        }
    }

    /// Originals behind a group: members that are canonical contribute the
    /// entities they were built from, the rest contribute themselves. A
    /// canonical member whose originals are all gone stands in for them.
    async fn originals(&self, members: &[&Entity]) -> Result<BTreeMap<EntityId, Entity>> {
        let mut out = BTreeMap::new();
        for member in members {
            if member.metadata.merged_from.is_empty() {
                out.insert(member.id.clone(), (*member).clone());
                continue;
            }
            let found = self.store.get_entities(&member.metadata.merged_from).await?;
            if found.is_empty() {
                debug!(entity = %member.id, "Originals missing, canonical member contributes itself");
                out.insert(member.id.clone(), (*member).clone());
                continue;
            }
            for original in found {
                out.insert(original.id.clone(), original);
            }
        }
        Ok(out)
    }

    async fn plan_merge(&self, members: &[&Entity], conflicts: &mut Vec<PropertyConflict>) -> Result<MergePlan> {
        let originals = self.originals(members).await?;
        let canonical_id = EntityId::new(format!(
            "merged-{:016x}",
            hash_key_set(originals.keys().map(EntityId::as_str))
        ));
        let contributors: Vec<&Entity> = originals.values().collect();

        // Highest (confidence, completeness) names the group; ties go to the lowest id.
        let Some((&first, rest)) = contributors.split_first() else {
            return Err(GraphError::not_found(ResourceKind::Entity, canonical_id.as_str()));
        };
        let mut representative = first;
        for &candidate in rest {
            let better = candidate
                .metadata
                .confidence
                .total_cmp(&representative.metadata.confidence)
                .then(completeness(candidate).cmp(&completeness(representative)));
            if better.is_gt() {
                representative = candidate;
            }
        }

        let keys: BTreeSet<&String> = contributors.iter().flat_map(|e| e.properties.keys()).collect();
        let mut properties = Properties::new();
        let mut unresolved = Vec::new();
        let mut conflicting_values = BTreeMap::new();
        for key in keys {
            let contributions: Vec<Contribution<'_>> = contributors
                .iter()
                .filter_map(|e| Contribution::of(e, key, &self.config))
                .collect();
            match resolve(key, &contributions, &self.config) {
                Some(Resolution::Accepted { value, .. }) => {
                    properties.insert(key.clone(), value);
                }
                Some(Resolution::Conflict { values, agreement }) => {
                    debug!(entity = %canonical_id, property = %key, agreement, "Unresolved property conflict");
                    conflicting_values.insert(key.clone(), values.clone());
                    unresolved.push(key.clone());
                    conflicts.push(PropertyConflict {
                        entity_id: canonical_id.clone(),
                        property: key.clone(),
                        agreement,
                        values,
                    });
                }
                None => {}
            }
        }

        let mut sources: BTreeSet<String> = BTreeSet::new();
        for e in &contributors {
            sources.extend(e.metadata.sources.iter().cloned());
            sources.extend(e.metadata.source.clone());
        }
        let metadata = EntityMetadata {
            tenant: representative.metadata.tenant.clone(),
            source: None,
            source_quality: None,
            confidence: contributors
                .iter()
                .map(|e| e.metadata.confidence)
                .fold(0.0, f32::max),
            created_at: contributors
                .iter()
                .map(|e| e.metadata.created_at)
                .min()
                .unwrap_or(representative.metadata.created_at),
            updated_at: contributors
                .iter()
                .map(|e| e.metadata.updated_at)
                .max()
                .unwrap_or(representative.metadata.updated_at),
            merged_into: None,
            merged_from: originals.keys().cloned().collect(),
            sources: sources.into_iter().collect(),
            deleted_at: None,
            unresolved_conflicts: unresolved,
            conflicting_values,
        };
        let embedding = representative
            .embedding
            .clone()
            .or_else(|| contributors.iter().find_map(|e| e.embedding.clone()));
        let canonical = Entity {
            id: canonical_id,
            entity_type: representative.entity_type.clone(),
            name: representative.name.clone(),
            properties,
            embedding,
            metadata,
        };

        let mut absorbed: BTreeMap<EntityId, Entity> = originals;
        for member in members {
            absorbed.insert(member.id.clone(), (*member).clone());
        }
        Ok(MergePlan {
            canonical,
            absorbed: absorbed.into_values().collect(),
            active_members: members.len(),
        })
    }

    async fn write_merge(&self, plan: &MergePlan) -> Result<()> {
        let canonical = &plan.canonical;
        self.runner
            .call(&OperationContext::new("fusion.write_canonical", &canonical.id), || {
                self.store.add_entity(canonical.clone())
            })
            .await?;
        for member in &plan.absorbed {
            let mut member = member.clone();
            member.metadata.merged_into = Some(canonical.id.clone());
            let op = OperationContext::new("fusion.mark_merged", &member.id);
            self.runner.call(&op, || self.store.add_entity(member.clone())).await?;
        }
        debug!(canonical = %canonical.id, members = plan.absorbed.len(), "Merge written");
        Ok(())
    }

    /// Copy every relation touching an absorbed entity onto canonical
    /// endpoints. Relations internal to a group are dropped, parallel
    /// relations collapse into one.
    async fn project_relations(&self, plans: &[MergePlan], mapping: &BTreeMap<EntityId, EntityId>) -> Result<usize> {
        let mut projected: BTreeMap<(String, EntityId, EntityId), Relation> = BTreeMap::new();
        for plan in plans {
            for member in &plan.absorbed {
                let neighbors = self.store.get_neighbors(&member.id, Direction::Both, &[]).await?;
                for neighbor in neighbors {
                    if neighbor.entity.is_deleted() {
                        continue;
                    }
                    let relation = neighbor.relation;
                    if relation.metadata.projected_from.is_some() {
                        continue;
                    }
                    let source = self.project_endpoint(&relation.source_id, mapping).await?;
                    let target = self.project_endpoint(&relation.target_id, mapping).await?;
                    if source == target && relation.source_id != relation.target_id {
                        continue;
                    }
                    let key = (relation.relation_type.clone(), source, target);
                    match projected.get_mut(&key) {
                        Some(existing) => {
                            existing.confidence = existing.confidence.max(relation.confidence);
                            let earlier = existing
                                .metadata
                                .projected_from
                                .as_ref()
                                .map_or(true, |p| relation.id < *p);
                            if earlier {
                                existing.metadata.projected_from = Some(relation.id.clone());
                            }
                        }
                        None => {
                            let projection = projection_of(&relation, &key)?;
                            projected.insert(key, projection);
                        }
                    }
                }
            }
        }

        let count = projected.len();
        for relation in projected.into_values() {
            let op = OperationContext::new("fusion.project_relation", &relation.id);
            self.runner.call(&op, || self.store.add_relation(relation.clone())).await?;
        }
        Ok(count)
    }

    async fn project_endpoint(&self, id: &EntityId, mapping: &BTreeMap<EntityId, EntityId>) -> Result<EntityId> {
        match mapping.get(id) {
            Some(canonical) => Ok(canonical.clone()),
            None => self.resolve_canonical(id).await,
        }
    }
}

fn completeness(entity: &Entity) -> usize {
    entity.properties.values().map(PropertyValue::completeness).sum()
}

fn projection_of(relation: &Relation, key: &(String, EntityId, EntityId)) -> Result<Relation> {
    let (relation_type, source, target) = key;
    let id = RelationId::new(format!(
        "proj-{}",
        canonical_hash_hex(&(relation_type, source.as_str(), target.as_str()))?
    ));
    Ok(Relation {
        id,
        relation_type: relation_type.clone(),
        source_id: source.clone(),
        target_id: target.clone(),
        properties: relation.properties.clone(),
        confidence: relation.confidence,
        metadata: RelationMetadata {
            tenant: relation.metadata.tenant.clone(),
            source: relation.metadata.source.clone(),
            created_at: relation.metadata.created_at,
            inferred_by: relation.metadata.inferred_by.clone(),
            projected_from: Some(relation.id.clone()),
        },
    })
}

/// Disjoint sets over positions; the lower position always becomes the root.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }

    /// Sets of two or more, each ascending, ordered by smallest member.
    fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..self.parent.len() {
            let root = self.find(i);
            by_root.entry(root).or_default().push(i);
        }
        by_root.into_values().filter(|g| g.len() > 1).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::ConflictStrategy;
    use crate::runnable::{InMemoryMetrics, RunnerConfig};
    use crate::schema::{EntityType, PropertySchema, SchemaRegistry};
    use crate::store::{InMemoryGraphStore, ValidatedStore};

    async fn seeded() -> Arc<InMemoryGraphStore> {
        let store = Arc::new(InMemoryGraphStore::new());
        for entity in [
            Entity::new("d1-acme", "Company", "Acme Corp")
                .with_property("employees", 500i64)
                .with_source("doc1", 0.8),
            Entity::new("d2-acme", "Company", "ACME Corp.")
                .with_property("employees", 500i64)
                .with_property("city", "Springfield")
                .with_source("doc2", 0.9),
            Entity::new("d1-globex", "Company", "Globex").with_source("doc1", 0.9),
            Entity::new("d1-ada", "Person", "Ada Lovelace").with_source("doc1", 0.9),
            Entity::new("d2-ada", "Person", "Lovelace, Ada").with_source("doc2", 0.7),
        ] {
            store.add_entity(entity).await.unwrap();
        }
        store
            .add_relation(Relation::new("r1", "WORKS_FOR", "d1-ada", "d1-acme"))
            .await
            .unwrap();
        store
            .add_relation(Relation::new("r2", "WORKS_FOR", "d2-ada", "d2-acme").with_confidence(0.6))
            .await
            .unwrap();
        store
            .add_relation(Relation::new("r3", "COMPETES_WITH", "d2-acme", "d1-globex"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_merges_duplicates_and_projects_relations() {
        let store = seeded().await;
        let engine = FusionEngine::new(Arc::clone(&store), FusionConfig::default());
        let stats = engine.fuse_cross_document_entities(None).await.unwrap();

        assert_eq!(stats.entities_considered, 5);
        assert_eq!(stats.groups_merged, 2);
        assert_eq!(stats.entities_merged, 4);
        assert!(stats.conflicts.is_empty());

        let acme = engine.resolve_canonical(&"d1-acme".into()).await.unwrap();
        assert_eq!(acme, engine.resolve_canonical(&"d2-acme".into()).await.unwrap());
        let canonical = store.get_entity(&acme).await.unwrap();
        assert_eq!(canonical.name, "ACME Corp.");
        assert_eq!(canonical.property("employees"), Some(&PropertyValue::Int(500)));
        assert_eq!(canonical.property("city"), Some(&PropertyValue::from("Springfield")));
        assert_eq!(canonical.metadata.sources, vec!["doc1".to_string(), "doc2".to_string()]);

        // Both WORKS_FOR edges collapse onto one canonical edge.
        let ada = engine.resolve_canonical(&"d1-ada".into()).await.unwrap();
        let out = store.get_neighbors(&ada, Direction::Outgoing, &[]).await.unwrap();
        let works_for: Vec<_> = out.iter().filter(|n| n.relation.relation_type == "WORKS_FOR").collect();
        assert_eq!(works_for.len(), 1);
        assert_eq!(works_for[0].entity.id, acme);
        assert_eq!(works_for[0].relation.confidence, 1.0);
        assert_eq!(works_for[0].relation.metadata.projected_from, Some(RelationId::from("r1")));
        assert_eq!(stats.relations_projected, 2);

        // Members drop out of enumeration.
        let active = store.get_all_entities(&EntityFilter::any(), Page::default()).await.unwrap();
        let ids: Vec<&str> = active.iter().map(|e| e.id.as_str()).collect();
        assert!(ids.contains(&"d1-globex"));
        assert!(!ids.contains(&"d1-acme"));
        assert_eq!(active.len(), 3);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let store = seeded().await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let runner = Runner::with_metrics(RunnerConfig::default(), metrics.clone());
        let engine = FusionEngine::new(Arc::clone(&store), FusionConfig::default()).with_runner(runner);
        engine.fuse_cross_document_entities(None).await.unwrap();
        let relations_before = store.num_relations();

        let second = engine.fuse_cross_document_entities(None).await.unwrap();
        assert_eq!(second.groups_merged, 0);
        assert_eq!(second.entities_merged, 0);
        assert_eq!(second.relations_projected, 0);
        assert_eq!(store.num_relations(), relations_before);
        assert_eq!(metrics.get_count("fusion_merges"), 2);
    }

    #[tokio::test]
    async fn test_type_filter_limits_the_run() {
        let store = seeded().await;
        let engine = FusionEngine::new(Arc::clone(&store), FusionConfig::default());
        let stats = engine.fuse_cross_document_entities(Some("Person")).await.unwrap();
        assert_eq!(stats.entities_considered, 2);
        assert_eq!(stats.groups_merged, 1);
        assert!(store.get_entity(&"d1-acme".into()).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_conflict_is_flagged_or_fails() {
        let store = Arc::new(InMemoryGraphStore::new());
        store
            .add_entity(Entity::new("a", "Person", "Grace Hopper").with_property("navy", true))
            .await
            .unwrap();
        store
            .add_entity(Entity::new("b", "Person", "Grace Hopper").with_property("navy", false))
            .await
            .unwrap();

        let strict = FusionConfig {
            fail_on_conflict: true,
            ..FusionConfig::default()
        };
        let err = FusionEngine::new(Arc::clone(&store), strict)
            .fuse_cross_document_entities(None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT_UNRESOLVED");
        assert!(store.get_entity(&"a".into()).await.unwrap().is_active());

        let engine = FusionEngine::new(Arc::clone(&store), FusionConfig::default());
        let stats = engine.fuse_cross_document_entities(None).await.unwrap();
        assert_eq!(stats.conflicts.len(), 1);
        assert_eq!(stats.conflicts[0].property, "navy");
        let canonical = store.get_entity(&stats.canonical_ids[0]).await.unwrap();
        assert_eq!(canonical.metadata.unresolved_conflicts, vec!["navy".to_string()]);
        assert_eq!(canonical.property("navy"), None);
        assert_eq!(
            canonical.metadata.conflicting_values.get("navy"),
            Some(&vec![PropertyValue::from(true), PropertyValue::from(false)])
        );
    }

    #[tokio::test]
    async fn test_strategy_override_and_provenance() {
        let store = seeded().await;
        let config = FusionConfig::default().with_property_strategy("employees", ConflictStrategy::KeepAll);
        store
            .add_entity(
                Entity::new("d3-acme", "Company", "Acme Corp")
                    .with_property("employees", 520i64)
                    .with_source("doc3", 0.5),
            )
            .await
            .unwrap();
        let engine = FusionEngine::new(Arc::clone(&store), config);
        engine.fuse_cross_document_entities(Some("Company")).await.unwrap();

        let provenance = engine.track_entity_provenance(&"d3-acme".into()).await.unwrap();
        assert!(!provenance.is_canonical);
        assert_eq!(provenance.members.len(), 3);
        assert_eq!(provenance.sources, vec!["doc1", "doc2", "doc3"]);
        let canonical = store.get_entity(&provenance.canonical_id).await.unwrap();
        assert_eq!(
            canonical.property("employees"),
            Some(&PropertyValue::List(vec![500i64.into(), 520i64.into()]))
        );

        let own = engine.track_entity_provenance(&"d1-globex".into()).await.unwrap();
        assert!(own.is_canonical);
        assert_eq!(own.members, vec![EntityId::from("d1-globex")]);
    }

    #[tokio::test]
    async fn test_new_duplicate_joins_existing_canonical() {
        let store = seeded().await;
        let engine = FusionEngine::new(Arc::clone(&store), FusionConfig::default());
        let first = engine.fuse_cross_document_entities(Some("Person")).await.unwrap();
        let old = first.canonical_ids[0].clone();

        store
            .add_entity(Entity::new("d3-ada", "Person", "Ada Lovelace").with_source("doc3", 0.5))
            .await
            .unwrap();
        let second = engine.fuse_cross_document_entities(Some("Person")).await.unwrap();
        assert_eq!(second.groups_merged, 1);
        let new = second.canonical_ids[0].clone();
        assert_ne!(old, new);

        // Old canonical and its originals all resolve to the new one.
        for id in ["d1-ada", "d2-ada", "d3-ada"] {
            assert_eq!(engine.resolve_canonical(&id.into()).await.unwrap(), new);
        }
        assert_eq!(engine.resolve_canonical(&old).await.unwrap(), new);
        let canonical = store.get_entity(&new).await.unwrap();
        assert_eq!(canonical.metadata.merged_from.len(), 3);
    }

    async fn typed_duplicates() -> (Arc<InMemoryGraphStore>, Arc<SchemaRegistry>) {
        let registry = Arc::new(SchemaRegistry::new());
        registry.create_entity_type(EntityType::new("Person")).unwrap();
        registry
            .create_entity_type(EntityType::new("Company").with_property("employees", PropertySchema::integer()))
            .unwrap();
        let backend = Arc::new(InMemoryGraphStore::new());
        for entity in [
            Entity::new("a1", "Person", "Ada Lovelace").with_source("doc1", 0.9),
            Entity::new("a2", "Person", "Ada Lovelace").with_source("doc2", 0.9),
            Entity::new("b1", "Company", "Acme Corp")
                .with_property("employees", 500i64)
                .with_source("doc1", 0.9),
            Entity::new("b2", "Company", "Acme Corp")
                .with_property("employees", 900i64)
                .with_source("doc2", 0.9),
        ] {
            backend.add_entity(entity).await.unwrap();
        }
        (backend, registry)
    }

    #[tokio::test]
    async fn test_typed_conflict_fuses_through_validated_store() {
        let (backend, registry) = typed_duplicates().await;
        let validated = Arc::new(ValidatedStore::new(Arc::clone(&backend), Arc::clone(&registry)));
        let engine = FusionEngine::new(validated, FusionConfig::default()).with_schema(registry);

        let stats = engine.fuse_cross_document_entities(None).await.unwrap();
        assert_eq!(stats.groups_merged, 2);
        assert_eq!(stats.conflicts.len(), 1);
        assert_eq!(stats.conflicts[0].property, "employees");

        for id in ["a1", "b1"] {
            assert!(backend.get_entity(&id.into()).await.unwrap().metadata.merged_into.is_some());
        }
        let acme = engine.resolve_canonical(&"b1".into()).await.unwrap();
        let canonical = backend.get_entity(&acme).await.unwrap();
        assert_eq!(canonical.property("employees"), None);
        let values = &canonical.metadata.conflicting_values["employees"];
        assert!(values.contains(&PropertyValue::Int(500)));
        assert!(values.contains(&PropertyValue::Int(900)));
    }

    #[tokio::test]
    async fn test_schema_violation_aborts_before_any_write() {
        let (backend, registry) = typed_duplicates().await;
        let validated = Arc::new(ValidatedStore::new(Arc::clone(&backend), Arc::clone(&registry)));
        let config = FusionConfig::default().with_property_strategy("employees", ConflictStrategy::KeepAll);
        let engine = FusionEngine::new(validated, config).with_schema(registry);

        let err = engine.fuse_cross_document_entities(None).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        for id in ["a1", "a2", "b1", "b2"] {
            assert!(backend.get_entity(&id.into()).await.unwrap().is_active());
        }
        assert_eq!(backend.num_entities(), 4);
    }

    #[tokio::test]
    async fn test_canonical_members_with_missing_originals() {
        let store = Arc::new(InMemoryGraphStore::new());
        for (id, gone) in [("m1", "gone-1"), ("m2", "gone-2")] {
            let mut entity = Entity::new(id, "Company", "Initech");
            entity.metadata.merged_from = vec![EntityId::from(gone)];
            store.add_entity(entity).await.unwrap();
        }
        let engine = FusionEngine::new(Arc::clone(&store), FusionConfig::default());
        let stats = engine.fuse_cross_document_entities(None).await.unwrap();
        assert_eq!(stats.groups_merged, 1);

        let canonical = store.get_entity(&stats.canonical_ids[0]).await.unwrap();
        assert_eq!(
            canonical.metadata.merged_from,
            vec![EntityId::from("m1"), EntityId::from("m2")]
        );
    }
}
