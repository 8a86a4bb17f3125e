//! Traversal algorithms derived from the Tier-1 primitives.
//!
//! Both algorithms canonicalize neighbor order (entity id, relation id) before
//! expanding, so any backend that returns the same neighbor *sets* produces
//! identical paths.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::trace;

use crate::error::Result;
use crate::types::{sort_neighbors, Direction, Entity, EntityId, Neighbor, Path, Relation};

use super::GraphStore;

/// Lazy breadth-first traversal.
///
/// Emits one path per newly reached entity, shortest first. Every entity is
/// visited at most once per traversal, so cyclic graphs terminate. A frontier
/// node whose neighbors cannot be fetched because it no longer exists is a
/// dead end; any other backend error is returned.
pub struct Traversal<'a, S: GraphStore + ?Sized> {
    store: &'a S,
    start: EntityId,
    max_depth: usize,
    relation_types: Vec<String>,
    direction: Direction,
    started: bool,
    frontier: VecDeque<Path>,
    pending: VecDeque<Path>,
    visited: BTreeSet<EntityId>,
    neighbor_calls: usize,
}

impl<'a, S: GraphStore + ?Sized> Traversal<'a, S> {
    /// Create a traversal. Nothing is fetched until the first `next_path`.
    pub fn new(
        store: &'a S,
        start: EntityId,
        max_depth: usize,
        relation_types: Vec<String>,
        direction: Direction,
    ) -> Self {
        Self {
            store,
            start,
            max_depth,
            relation_types,
            direction,
            started: false,
            frontier: VecDeque::new(),
            pending: VecDeque::new(),
            visited: BTreeSet::new(),
            neighbor_calls: 0,
        }
    }

    /// Next path, or `None` when exhausted.
    ///
    /// The first call fails with `NotFound` if the start entity is absent.
    pub async fn next_path(&mut self) -> Result<Option<Path>> {
        if !self.started {
            self.started = true;
            let start = self.store.get_entity(&self.start).await?;
            self.visited.insert(start.id.clone());
            if self.max_depth > 0 {
                self.frontier.push_back(Path::single(start));
            }
        }

        loop {
            if let Some(path) = self.pending.pop_front() {
                return Ok(Some(path));
            }
            let Some(path) = self.frontier.pop_front() else {
                return Ok(None);
            };
            let Some(end) = path.end().map(|e| e.id.clone()) else {
                continue;
            };

            self.neighbor_calls += 1;
            let mut neighbors = match self
                .store
                .get_neighbors(&end, self.direction, &self.relation_types)
                .await
            {
                Ok(neighbors) => neighbors,
                Err(e) if e.is_not_found() => {
                    trace!(entity_id = %end, "Frontier node vanished, treating as dead end");
                    continue;
                }
                Err(e) => return Err(e),
            };
            sort_neighbors(&mut neighbors);

            for Neighbor { relation, entity } in neighbors {
                if !entity.is_active() || !self.visited.insert(entity.id.clone()) {
                    continue;
                }
                let next = path.extended(relation, entity);
                if next.len() < self.max_depth {
                    self.frontier.push_back(next.clone());
                }
                self.pending.push_back(next);
            }
        }
    }

    /// Drain the remaining paths.
    pub async fn collect(mut self) -> Result<Vec<Path>> {
        let mut paths = Vec::new();
        while let Some(path) = self.next_path().await? {
            paths.push(path);
        }
        Ok(paths)
    }

    /// Entities visited so far, including the start.
    pub fn visited(&self) -> &BTreeSet<EntityId> {
        &self.visited
    }

    /// `get_neighbors` calls issued so far.
    pub fn neighbor_calls(&self) -> usize {
        self.neighbor_calls
    }
}

/// Parent pointers of one BFS side: reached entity -> (previous entity, relation).
type Parents = BTreeMap<EntityId, Option<(EntityId, Relation)>>;

/// Bidirectional breadth-first search for a shortest path.
///
/// The forward side follows outgoing relations from `start`, the backward side
/// follows incoming relations from `end`; the smaller frontier is expanded
/// first. Returns the first meeting path, or `None` once the combined depth
/// reaches `max_depth`.
pub async fn bidirectional_search<S: GraphStore + ?Sized>(
    store: &S,
    start: &EntityId,
    end: &EntityId,
    max_depth: usize,
) -> Result<Option<Path>> {
    let start_entity = store.get_entity(start).await?;
    let end_entity = store.get_entity(end).await?;
    if start == end {
        return Ok(Some(Path::single(start_entity)));
    }

    let mut entities: BTreeMap<EntityId, Entity> = BTreeMap::new();
    entities.insert(start.clone(), start_entity);
    entities.insert(end.clone(), end_entity);

    let mut forward: Parents = BTreeMap::from([(start.clone(), None)]);
    let mut backward: Parents = BTreeMap::from([(end.clone(), None)]);
    let mut forward_frontier = vec![start.clone()];
    let mut backward_frontier = vec![end.clone()];
    let mut depth = 0;

    while depth < max_depth && !forward_frontier.is_empty() && !backward_frontier.is_empty() {
        let expand_forward = forward_frontier.len() <= backward_frontier.len();
        let (frontier, own, other, direction) = if expand_forward {
            (&mut forward_frontier, &mut forward, &backward, Direction::Outgoing)
        } else {
            (&mut backward_frontier, &mut backward, &forward, Direction::Incoming)
        };

        let mut next_frontier = Vec::new();
        let mut meeting = None;
        'level: for node in frontier.iter() {
            let mut neighbors = match store.get_neighbors(node, direction, &[]).await {
                Ok(neighbors) => neighbors,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            sort_neighbors(&mut neighbors);
            for Neighbor { relation, entity } in neighbors {
                if !entity.is_active() || own.contains_key(&entity.id) {
                    continue;
                }
                let id = entity.id.clone();
                own.insert(id.clone(), Some((node.clone(), relation)));
                entities.entry(id.clone()).or_insert(entity);
                if other.contains_key(&id) {
                    meeting = Some(id);
                    break 'level;
                }
                next_frontier.push(id);
            }
        }
        depth += 1;

        if let Some(meeting) = meeting {
            return Ok(Some(stitch(&meeting, &forward, &backward, &entities)));
        }
        next_frontier.sort();
        *frontier = next_frontier;
    }

    Ok(None)
}

/// Build `start -> ... -> meeting -> ... -> end` from both parent maps.
fn stitch(
    meeting: &EntityId,
    forward: &Parents,
    backward: &Parents,
    entities: &BTreeMap<EntityId, Entity>,
) -> Path {
    let mut hops: Vec<(Relation, EntityId)> = Vec::new();
    let mut cursor = meeting.clone();
    while let Some(Some((prev, relation))) = forward.get(&cursor) {
        hops.push((relation.clone(), cursor.clone()));
        cursor = prev.clone();
    }
    hops.reverse();

    let mut path = Path::default();
    if let Some(first) = entities.get(&cursor) {
        path.entities.push(first.clone());
    }
    for (relation, id) in hops {
        if let Some(entity) = entities.get(&id) {
            path.relations.push(relation);
            path.entities.push(entity.clone());
        }
    }

    let mut cursor = meeting.clone();
    while let Some(Some((next, relation))) = backward.get(&cursor) {
        if let Some(entity) = entities.get(next) {
            path.relations.push(relation.clone());
            path.entities.push(entity.clone());
        }
        cursor = next.clone();
    }
    path
}

/// Neighbors of many entities, keyed by source entity.
pub(crate) async fn neighbors_of<S: GraphStore + ?Sized>(
    store: &S,
    ids: &[EntityId],
    direction: Direction,
) -> Result<BTreeMap<EntityId, Vec<Neighbor>>> {
    let mut out = BTreeMap::new();
    for id in ids {
        match store.get_neighbors(id, direction, &[]).await {
            Ok(mut neighbors) => {
                sort_neighbors(&mut neighbors);
                out.insert(id.clone(), neighbors);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}
