//! Plan rewrite rules.
//!
//! A rewrite is legal only if it preserves the entity set the plan produces.
//! Under set semantics that allows reordering, merging and grouping filters
//! inside a filter run; nothing moves across `Expand` or `Limit`, and filters
//! without a hint stay where they are.

use serde::Serialize;

use crate::error::Result;

use super::plan::{PlanOp, PlanStep, Predicate, QueryPlan, SelectivityHint};

/// A single rewrite that may transform a plan.
pub trait OptimizationRule: Send + Sync {
    /// Rule name.
    fn name(&self) -> &'static str;

    /// What the rule does.
    fn description(&self) -> &'static str {
        "No description available"
    }

    /// Apply the rule, returning the (possibly unchanged) plan.
    fn apply(&self, plan: QueryPlan) -> Result<Transformed>;
}

/// Result of applying a rule.
#[derive(Debug, Clone)]
pub struct Transformed {
    /// The (potentially transformed) plan.
    pub plan: QueryPlan,
    /// Whether the plan was changed.
    pub changed: bool,
}

impl Transformed {
    /// The plan was changed.
    pub fn yes(plan: QueryPlan) -> Self {
        Self { plan, changed: true }
    }

    /// The plan was left as is.
    pub fn no(plan: QueryPlan) -> Self {
        Self { plan, changed: false }
    }
}

/// One applied rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleTrace {
    /// Rule name.
    pub rule_name: String,
    /// Plan before, as `explain` text.
    pub before: String,
    /// Plan after, as `explain` text.
    pub after: String,
}

impl RuleTrace {
    /// Create a trace entry.
    pub fn new(rule_name: impl Into<String>, before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            rule_name: rule_name.into(),
            before: before.into(),
            after: after.into(),
        }
    }
}

/// Segments of movable (hinted) filters inside each filter run.
fn movable_segments(plan: &QueryPlan) -> Vec<std::ops::Range<usize>> {
    let mut segments = Vec::new();
    for run in plan.filter_runs() {
        let mut start = None;
        for i in run.clone() {
            match (plan.steps[i].is_movable_filter(), start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    segments.push(s..i);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            segments.push(s..run.end);
        }
    }
    segments
}

/// Merges adjacent unhinted filters into one conjunction.
///
/// Unhinted filters are fixed in place, so fusing neighbors saves a pass
/// without moving anything.
pub struct FilterMerge;

impl OptimizationRule for FilterMerge {
    fn name(&self) -> &'static str {
        "FilterMerge"
    }

    fn description(&self) -> &'static str {
        "Fuse adjacent unhinted filters into a single conjunction"
    }

    fn apply(&self, plan: QueryPlan) -> Result<Transformed> {
        let mut steps: Vec<PlanStep> = Vec::with_capacity(plan.steps.len());
        let mut changed = false;
        for step in plan.steps {
            let mergeable = step.op.is_filter() && step.hint.is_none() && !step.concurrent;
            if mergeable {
                if let Some(PlanStep {
                    op: PlanOp::Filter { predicate },
                    hint: None,
                    ..
                }) = steps.last_mut()
                {
                    if let PlanOp::Filter { predicate: next } = step.op {
                        let current = std::mem::replace(predicate, Predicate::All { predicates: Vec::new() });
                        *predicate = current.and(next);
                        changed = true;
                        continue;
                    }
                }
            }
            steps.push(step);
        }
        let plan = QueryPlan { steps };
        Ok(if changed { Transformed::yes(plan) } else { Transformed::no(plan) })
    }
}

/// Orders hinted filters by rank so cheap, selective filters run first.
///
/// The sort is stable, so equal ranks keep their order and a second
/// application is a no-op. Only a segment whose order changes loses its
/// concurrency flags; an already ordered stage is left grouped.
pub struct SelectivityReorder;

impl OptimizationRule for SelectivityReorder {
    fn name(&self) -> &'static str {
        "SelectivityReorder"
    }

    fn description(&self) -> &'static str {
        "Sort commuting hinted filters by (selectivity - 1) / io_cost"
    }

    fn apply(&self, mut plan: QueryPlan) -> Result<Transformed> {
        let mut changed = false;
        for segment in movable_segments(&plan) {
            let slice = &mut plan.steps[segment];
            let before: Vec<(PlanOp, Option<SelectivityHint>)> =
                slice.iter().map(|s| (s.op.clone(), s.hint)).collect();
            slice.sort_by(|a, b| a.effective_hint().rank().total_cmp(&b.effective_hint().rank()));
            let reordered = slice.iter().zip(&before).any(|(s, (op, hint))| s.op != *op || s.hint != *hint);
            if reordered {
                for step in slice.iter_mut() {
                    step.concurrent = false;
                }
                changed = true;
            }
        }
        Ok(if changed { Transformed::yes(plan) } else { Transformed::no(plan) })
    }
}

/// Groups each run of two or more hinted filters into one concurrent stage.
pub struct ConcurrentFilterStage;

impl OptimizationRule for ConcurrentFilterStage {
    fn name(&self) -> &'static str {
        "ConcurrentFilterStage"
    }

    fn description(&self) -> &'static str {
        "Evaluate commuting hinted filters concurrently on the same input"
    }

    fn apply(&self, mut plan: QueryPlan) -> Result<Transformed> {
        let mut changed = false;
        for segment in movable_segments(&plan) {
            if segment.len() < 2 {
                continue;
            }
            let first = segment.start;
            for i in segment {
                let concurrent = i != first;
                if plan.steps[i].concurrent != concurrent {
                    plan.steps[i].concurrent = concurrent;
                    changed = true;
                }
            }
        }
        Ok(if changed { Transformed::yes(plan) } else { Transformed::no(plan) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(min: f32) -> PlanOp {
        PlanOp::Filter {
            predicate: Predicate::MinConfidence { min },
        }
    }

    fn plan() -> QueryPlan {
        QueryPlan::from_source(PlanOp::ScanType {
            entity_type: "Person".to_string(),
        })
    }

    #[test]
    fn test_filter_merge_only_touches_unhinted_neighbors() {
        let plan = plan()
            .then_op(filter(0.1))
            .then_op(filter(0.2))
            .then(PlanStep::new(filter(0.3)).with_hint(SelectivityHint::filter(0.5, 1.0)))
            .then_op(filter(0.4));
        let result = FilterMerge.apply(plan).unwrap();
        assert!(result.changed);
        assert_eq!(result.plan.steps.len(), 4);

        let again = FilterMerge.apply(result.plan).unwrap();
        assert!(!again.changed);
    }

    #[test]
    fn test_reorder_respects_barriers() {
        let plan = plan()
            .then(PlanStep::new(filter(0.1)).with_hint(SelectivityHint::filter(0.9, 1.0)))
            .then(PlanStep::new(filter(0.2)).with_hint(SelectivityHint::filter(0.1, 1.0)))
            .then_op(filter(0.3))
            .then(PlanStep::new(filter(0.4)).with_hint(SelectivityHint::filter(0.9, 1.0)))
            .then(PlanStep::new(filter(0.5)).with_hint(SelectivityHint::filter(0.2, 1.0)));
        let result = SelectivityReorder.apply(plan).unwrap();
        assert!(result.changed);
        let order: Vec<String> = result.plan.steps.iter().map(|s| s.op.to_string()).collect();
        assert_eq!(
            order,
            vec![
                "Scan(Person)",
                "Filter(confidence >= 0.2)",
                "Filter(confidence >= 0.1)",
                "Filter(confidence >= 0.3)",
                "Filter(confidence >= 0.5)",
                "Filter(confidence >= 0.4)",
            ]
        );
        assert!(!SelectivityReorder.apply(result.plan).unwrap().changed);
    }

    #[test]
    fn test_concurrent_stage_grouping() {
        let plan = plan()
            .then(PlanStep::new(filter(0.1)).with_hint(SelectivityHint::filter(0.9, 1.0)))
            .then(PlanStep::new(filter(0.2)).with_hint(SelectivityHint::filter(0.1, 1.0)))
            .then_op(PlanOp::Limit { count: 3 })
            .then(PlanStep::new(filter(0.3)).with_hint(SelectivityHint::filter(0.5, 1.0)));
        let result = ConcurrentFilterStage.apply(plan).unwrap();
        assert!(result.changed);
        assert!(result.plan.validate().is_ok());
        assert_eq!(result.plan.stages().len(), 4);
    }

    #[test]
    fn test_reorder_keeps_an_ordered_stage_grouped() {
        let plan = plan()
            .then(PlanStep::new(filter(0.1)).with_hint(SelectivityHint::filter(0.9, 1.0)))
            .then(PlanStep::new(filter(0.2)).with_hint(SelectivityHint::filter(0.1, 1.0)));
        let ordered = SelectivityReorder.apply(plan).unwrap();
        let grouped = ConcurrentFilterStage.apply(ordered.plan).unwrap();
        assert!(grouped.changed);

        let again = SelectivityReorder.apply(grouped.plan.clone()).unwrap();
        assert!(!again.changed);
        assert_eq!(again.plan, grouped.plan);
    }
}
