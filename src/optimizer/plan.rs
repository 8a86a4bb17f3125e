//! Query plans: an ordered list of source and transform steps.
//!
//! A plan starts with exactly one source step and then applies transforms to
//! the current entity set. Execution has set semantics, so adjacent `Filter`
//! steps commute; `Expand` and `Limit` are order barriers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_hash_hex;
use crate::error::{GraphError, Result};
use crate::types::{Direction, Entity, EntityId, PropertyValue};

/// Rows assumed for a type scan without a hint.
pub const DEFAULT_SCAN_ROWS: f64 = 1000.0;

/// Neighbors assumed per entity for an expansion without a hint.
pub const DEFAULT_FAN_OUT: f64 = 4.0;

/// Boolean condition on a single entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Entity type is one of the listed types.
    EntityType {
        /// Accepted types.
        types: Vec<String>,
    },
    /// Top-level property equals a value.
    PropertyEquals {
        /// Property key.
        key: String,
        /// Expected value.
        value: PropertyValue,
    },
    /// Name contains a substring, case-insensitively.
    NameContains {
        /// Needle.
        needle: String,
    },
    /// Extraction confidence at least this value.
    MinConfidence {
        /// Lower bound.
        min: f32,
    },
    /// Conjunction.
    All {
        /// Conjuncts.
        predicates: Vec<Predicate>,
    },
}

impl Predicate {
    /// Whether the entity satisfies the predicate.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::EntityType { types } => types.iter().any(|t| t == &entity.entity_type),
            Self::PropertyEquals { key, value } => entity.properties.get(key) == Some(value),
            Self::NameContains { needle } => entity.name.to_lowercase().contains(&needle.to_lowercase()),
            Self::MinConfidence { min } => entity.metadata.confidence >= *min,
            Self::All { predicates } => predicates.iter().all(|p| p.matches(entity)),
        }
    }

    /// Conjunction of two predicates, flattening nested `All`.
    pub fn and(self, other: Predicate) -> Predicate {
        let mut predicates = match self {
            Self::All { predicates } => predicates,
            p => vec![p],
        };
        match other {
            Self::All { predicates: more } => predicates.extend(more),
            p => predicates.push(p),
        }
        Self::All { predicates }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntityType { types } => write!(f, "type in [{}]", types.join(", ")),
            Self::PropertyEquals { key, value } => write!(f, "{} = {}", key, value),
            Self::NameContains { needle } => write!(f, "name ~ {:?}", needle),
            Self::MinConfidence { min } => write!(f, "confidence >= {}", min),
            Self::All { predicates } => {
                let parts: Vec<String> = predicates.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(" AND "))
            }
        }
    }
}

/// A plan operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanOp {
    /// Source: fetch entities by id.
    LookupEntities {
        /// Ids to fetch.
        ids: Vec<EntityId>,
    },
    /// Source: every active entity of a type.
    ScanType {
        /// Entity type.
        entity_type: String,
    },
    /// Source: nearest neighbors of an embedding.
    VectorSearch {
        /// Query vector.
        embedding: Vec<f32>,
        /// Result count.
        top_k: usize,
    },
    /// Replace the set with its neighbors.
    Expand {
        /// Accepted relation types (empty = any).
        relation_types: Vec<String>,
        /// Direction followed.
        direction: Direction,
    },
    /// Keep entities satisfying the predicate.
    Filter {
        /// Condition.
        predicate: Predicate,
    },
    /// Keep the first `count` entities in id order.
    Limit {
        /// Maximum entities kept.
        count: usize,
    },
}

impl PlanOp {
    /// Whether the op produces the initial entity set.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            Self::LookupEntities { .. } | Self::ScanType { .. } | Self::VectorSearch { .. }
        )
    }

    /// Whether the op is a filter.
    pub fn is_filter(&self) -> bool {
        matches!(self, Self::Filter { .. })
    }

    /// Estimate used when the step carries no hint.
    pub fn default_hint(&self) -> SelectivityHint {
        let fan_out = match self {
            Self::LookupEntities { ids } => ids.len() as f64,
            Self::ScanType { .. } => DEFAULT_SCAN_ROWS,
            Self::VectorSearch { top_k, .. } => *top_k as f64,
            Self::Expand { .. } => DEFAULT_FAN_OUT,
            Self::Filter { .. } | Self::Limit { .. } => 1.0,
        };
        SelectivityHint {
            selectivity: 1.0,
            fan_out,
            io_cost: 1.0,
        }
    }
}

impl fmt::Display for PlanOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LookupEntities { ids } => write!(f, "Lookup({} ids)", ids.len()),
            Self::ScanType { entity_type } => write!(f, "Scan({})", entity_type),
            Self::VectorSearch { embedding, top_k } => {
                write!(f, "VectorSearch(dim={}, k={})", embedding.len(), top_k)
            }
            Self::Expand {
                relation_types,
                direction,
            } => write!(f, "Expand({}, [{}])", direction, relation_types.join(", ")),
            Self::Filter { predicate } => write!(f, "Filter({})", predicate),
            Self::Limit { count } => write!(f, "Limit({})", count),
        }
    }
}

/// Cost-model inputs for one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectivityHint {
    /// Fraction of input rows kept, in [0, 1].
    pub selectivity: f64,
    /// Output rows produced per kept input row.
    pub fan_out: f64,
    /// Cost per input row.
    pub io_cost: f64,
}

impl SelectivityHint {
    /// Filter hint.
    pub fn filter(selectivity: f64, io_cost: f64) -> Self {
        Self {
            selectivity,
            fan_out: 1.0,
            io_cost,
        }
    }

    /// Hint with every field given.
    pub fn new(selectivity: f64, fan_out: f64, io_cost: f64) -> Self {
        Self {
            selectivity,
            fan_out,
            io_cost,
        }
    }

    /// Ordering rank for sequential filters: lower runs first.
    ///
    /// `(selectivity - 1) / io_cost`: cheap filters that discard a lot go
    /// early.
    pub fn rank(&self) -> f64 {
        if self.io_cost <= 0.0 {
            return f64::NEG_INFINITY;
        }
        (self.selectivity - 1.0) / self.io_cost
    }
}

/// One plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Operation.
    pub op: PlanOp,
    /// Cost hint; steps without one are never moved.
    #[serde(default)]
    pub hint: Option<SelectivityHint>,
    /// Runs concurrently with the previous step on the same input.
    #[serde(default)]
    pub concurrent: bool,
}

impl PlanStep {
    /// Step without a hint.
    pub fn new(op: PlanOp) -> Self {
        Self {
            op,
            hint: None,
            concurrent: false,
        }
    }

    /// Attach a hint.
    pub fn with_hint(mut self, hint: SelectivityHint) -> Self {
        self.hint = Some(hint);
        self
    }

    /// The hint, or the op's default estimate.
    pub fn effective_hint(&self) -> SelectivityHint {
        self.hint.unwrap_or_else(|| self.op.default_hint())
    }

    /// Whether the step may be reordered among commuting filters.
    pub fn is_movable_filter(&self) -> bool {
        self.op.is_filter() && self.hint.is_some()
    }
}

/// A query plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Steps in execution order.
    pub steps: Vec<PlanStep>,
}

impl QueryPlan {
    /// Plan starting from a source op.
    pub fn from_source(op: PlanOp) -> Self {
        Self {
            steps: vec![PlanStep::new(op)],
        }
    }

    /// Append a step.
    pub fn then(mut self, step: PlanStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Append an unhinted op.
    pub fn then_op(self, op: PlanOp) -> Self {
        self.then(PlanStep::new(op))
    }

    /// Append a hinted filter.
    pub fn filter(self, predicate: Predicate, hint: SelectivityHint) -> Self {
        self.then(PlanStep::new(PlanOp::Filter { predicate }).with_hint(hint))
    }

    /// Check plan shape.
    ///
    /// Exactly one source, first; concurrent steps only inside filter runs.
    pub fn validate(&self) -> Result<()> {
        let Some(first) = self.steps.first() else {
            return Err(GraphError::InvalidPlan("plan has no steps".to_string()));
        };
        if !first.op.is_source() {
            return Err(GraphError::InvalidPlan(format!("first step {} is not a source", first.op)));
        }
        for (i, step) in self.steps.iter().enumerate().skip(1) {
            if step.op.is_source() {
                return Err(GraphError::InvalidPlan(format!("step {} ({}) is a second source", i, step.op)));
            }
            if step.concurrent && !(step.op.is_filter() && self.steps[i - 1].op.is_filter()) {
                return Err(GraphError::InvalidPlan(format!(
                    "step {} ({}) cannot run concurrently with its predecessor",
                    i, step.op
                )));
            }
            if let Some(hint) = step.hint {
                if !(0.0..=1.0).contains(&hint.selectivity) || hint.fan_out < 0.0 || hint.io_cost < 0.0 {
                    return Err(GraphError::InvalidPlan(format!("step {} has an out-of-range hint", i)));
                }
            }
        }
        if self.steps[0].concurrent {
            return Err(GraphError::InvalidPlan("source step cannot be concurrent".to_string()));
        }
        Ok(())
    }

    /// Steps grouped into stages: a stage is a step plus any following
    /// steps marked `concurrent`. Returned as index ranges.
    pub fn stages(&self) -> Vec<std::ops::Range<usize>> {
        let mut stages: Vec<std::ops::Range<usize>> = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            match stages.last_mut() {
                Some(last) if step.concurrent => last.end = i + 1,
                _ => stages.push(i..i + 1),
            }
        }
        stages
    }

    /// Maximal runs of consecutive filter steps, as index ranges.
    pub fn filter_runs(&self) -> Vec<std::ops::Range<usize>> {
        let mut runs = Vec::new();
        let mut start = None;
        for (i, step) in self.steps.iter().enumerate() {
            match (step.op.is_filter(), start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    runs.push(s..i);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push(s..self.steps.len());
        }
        runs
    }

    /// Human-readable plan, one stage per line.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        for (n, stage) in self.stages().into_iter().enumerate() {
            let ops: Vec<String> = self.steps[stage].iter().map(|s| s.op.to_string()).collect();
            let line = if ops.len() > 1 {
                format!("{}: concurrent [{}]\n", n, ops.join(" | "))
            } else {
                format!("{}: {}\n", n, ops.join(""))
            };
            out.push_str(&line);
        }
        out
    }

    /// Canonical fingerprint of the plan.
    pub fn fingerprint(&self) -> Result<String> {
        canonical_hash_hex(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan() -> QueryPlan {
        QueryPlan::from_source(PlanOp::ScanType {
            entity_type: "Person".to_string(),
        })
    }

    #[test]
    fn test_validate_shape() {
        assert!(QueryPlan::default().validate().is_err());
        assert!(scan().validate().is_ok());

        let no_source = QueryPlan::from_source(PlanOp::Limit { count: 1 });
        assert!(matches!(no_source.validate(), Err(GraphError::InvalidPlan(_))));

        let two_sources = scan().then_op(PlanOp::ScanType {
            entity_type: "Company".to_string(),
        });
        assert!(two_sources.validate().is_err());
    }

    #[test]
    fn test_filter_runs_and_stages() {
        let mut plan = scan()
            .filter(Predicate::MinConfidence { min: 0.5 }, SelectivityHint::filter(0.5, 1.0))
            .filter(
                Predicate::NameContains {
                    needle: "a".to_string(),
                },
                SelectivityHint::filter(0.2, 2.0),
            )
            .then_op(PlanOp::Limit { count: 5 })
            .filter(Predicate::MinConfidence { min: 0.9 }, SelectivityHint::filter(0.9, 1.0));
        assert_eq!(plan.filter_runs(), vec![1..3, 4..5]);
        assert_eq!(plan.stages().len(), 5);

        plan.steps[2].concurrent = true;
        assert!(plan.validate().is_ok());
        assert_eq!(plan.stages(), vec![0..1, 1..3, 3..4, 4..5]);
        assert!(plan.explain().contains("concurrent"));

        plan.steps[3].concurrent = true;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_predicate_and_flattens() {
        let p = Predicate::MinConfidence { min: 0.1 }
            .and(Predicate::MinConfidence { min: 0.2 })
            .and(Predicate::MinConfidence { min: 0.3 });
        match p {
            Predicate::All { predicates } => assert_eq!(predicates.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = scan().then_op(PlanOp::Limit { count: 3 });
        let b = scan().then_op(PlanOp::Limit { count: 3 });
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        let c = scan().then_op(PlanOp::Limit { count: 4 });
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }
}
