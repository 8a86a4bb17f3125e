//! Plan cost model.
//!
//! Each step costs `io_cost x input_cardinality` and emits
//! `input x selectivity x fan_out` rows. Sources see an input of one. A
//! concurrent stage feeds every member the same input: its cost is the sum
//! of member costs, its latency the maximum, and its output the input times
//! the product of member selectivities.

use serde::{Deserialize, Serialize};

use super::plan::{PlanOp, QueryPlan};

/// Estimated cost of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanCost {
    /// Total work across all steps.
    pub total: f64,
    /// Work on the longest sequential chain (latency proxy).
    pub critical_path: f64,
    /// Estimated output rows.
    pub output_rows: f64,
}

/// Estimate a plan's cost.
pub fn estimate(plan: &QueryPlan) -> PlanCost {
    let mut cost = PlanCost::default();
    let mut rows = 1.0f64;

    for stage in plan.stages() {
        let steps = &plan.steps[stage];
        let mut stage_total = 0.0;
        let mut stage_latency = 0.0f64;
        let mut kept = 1.0;
        let mut next_rows = rows;
        for step in steps {
            let hint = step.effective_hint();
            let step_cost = hint.io_cost * rows;
            stage_total += step_cost;
            stage_latency = stage_latency.max(step_cost);
            match &step.op {
                PlanOp::Limit { count } => next_rows = rows.min(*count as f64),
                _ if steps.len() > 1 => kept *= hint.selectivity * hint.fan_out,
                _ => next_rows = rows * hint.selectivity * hint.fan_out,
            }
        }
        if steps.len() > 1 {
            next_rows = rows * kept;
        }
        cost.total += stage_total;
        cost.critical_path += stage_latency;
        rows = next_rows;
    }

    cost.output_rows = rows;
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::plan::{PlanStep, Predicate, SelectivityHint};

    fn filter(sel: f64, io: f64) -> PlanStep {
        PlanStep::new(PlanOp::Filter {
            predicate: Predicate::MinConfidence { min: 0.0 },
        })
        .with_hint(SelectivityHint::filter(sel, io))
    }

    #[test]
    fn test_sequential_cost() {
        let mut plan = QueryPlan::from_source(PlanOp::LookupEntities { ids: Vec::new() });
        plan.steps[0].hint = Some(SelectivityHint::new(1.0, 100.0, 1.0));
        let plan = plan.then(filter(0.1, 1.0)).then(filter(0.5, 1.0));

        let cost = estimate(&plan);
        // source 1, first filter 100, second filter 10
        assert!((cost.total - 111.0).abs() < 1e-9);
        assert!((cost.critical_path - 111.0).abs() < 1e-9);
        assert!((cost.output_rows - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_stage_cost() {
        let mut plan = QueryPlan::from_source(PlanOp::LookupEntities { ids: Vec::new() });
        plan.steps[0].hint = Some(SelectivityHint::new(1.0, 100.0, 1.0));
        let mut second = filter(0.5, 3.0);
        second.concurrent = true;
        let plan = plan.then(filter(0.1, 1.0)).then(second);

        let cost = estimate(&plan);
        // source 1, stage members 100 and 300
        assert!((cost.total - 401.0).abs() < 1e-9);
        assert!((cost.critical_path - 301.0).abs() < 1e-9);
        assert!((cost.output_rows - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_limit_caps_rows() {
        let plan = QueryPlan::from_source(PlanOp::ScanType {
            entity_type: "Person".to_string(),
        })
        .then_op(PlanOp::Limit { count: 7 });
        assert!((estimate(&plan).output_rows - 7.0).abs() < 1e-9);
    }
}
