//! Cost-based query plan optimizer.
//!
//! Rules are applied to a fixed point per pipeline; the strategy decides
//! which pipelines run and how their results are compared. The optimizer
//! never returns a plan whose objective is worse than the input's.

pub mod cost;
pub mod executor;
pub mod plan;
pub mod rules;
pub mod strategy;

use tracing::debug;

use crate::error::Result;

pub use cost::{estimate, PlanCost};
pub use executor::PlanExecutor;
pub use plan::{PlanOp, PlanStep, Predicate, QueryPlan, SelectivityHint};
pub use rules::{ConcurrentFilterStage, FilterMerge, OptimizationRule, RuleTrace, SelectivityReorder, Transformed};
pub use strategy::{OptimizationStrategy, OptimizerConfig};

/// Result of optimization.
#[derive(Debug, Clone)]
pub struct OptimizedPlan {
    /// Chosen plan.
    pub plan: QueryPlan,
    /// Cost of the input plan.
    pub original_cost: PlanCost,
    /// Cost of the chosen plan.
    pub cost: PlanCost,
    /// Rules that changed the chosen plan, in order.
    pub trace: Vec<RuleTrace>,
    /// Whether the input plan was kept because no candidate beat it.
    pub kept_original: bool,
}

/// Query optimizer.
#[derive(Debug, Clone, Default)]
pub struct QueryOptimizer {
    config: OptimizerConfig,
}

impl QueryOptimizer {
    /// Create an optimizer.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Configuration.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Optimize a plan.
    ///
    /// Fails with `InvalidPlan` when the input is malformed.
    pub fn optimize(&self, plan: QueryPlan) -> Result<OptimizedPlan> {
        plan.validate()?;
        let original_cost = estimate(&plan);
        let strategy = self.config.strategy;

        let mut best: Option<(QueryPlan, PlanCost, Vec<RuleTrace>, f64)> = None;
        for rules in strategy.pipelines() {
            let (candidate, trace) = self.run_pipeline(&rules, plan.clone())?;
            let cost = estimate(&candidate);
            let score = strategy.objective(&cost, &original_cost);
            let better = best.as_ref().map(|(_, _, _, s)| score < *s).unwrap_or(true);
            if better {
                best = Some((candidate, cost, trace, score));
            }
        }

        let baseline = strategy.objective(&original_cost, &original_cost);
        let result = match best {
            Some((candidate, cost, trace, score)) if score <= baseline => OptimizedPlan {
                plan: candidate,
                original_cost,
                cost,
                trace,
                kept_original: false,
            },
            _ => OptimizedPlan {
                plan,
                original_cost,
                cost: original_cost,
                trace: Vec::new(),
                kept_original: true,
            },
        };

        debug!(
            strategy = ?strategy,
            original_total = result.original_cost.total,
            optimized_total = result.cost.total,
            original_latency = result.original_cost.critical_path,
            optimized_latency = result.cost.critical_path,
            rules_applied = result.trace.len(),
            "Plan optimized"
        );
        Ok(result)
    }

    fn run_pipeline(
        &self,
        rules: &[Box<dyn OptimizationRule>],
        plan: QueryPlan,
    ) -> Result<(QueryPlan, Vec<RuleTrace>)> {
        let mut current = plan;
        let mut trace = Vec::new();
        for iteration in 0..self.config.max_iterations.max(1) {
            let mut changed = false;
            for rule in rules {
                let before = self.config.enable_trace.then(|| current.explain());
                let result = rule.apply(current)?;
                if result.changed {
                    changed = true;
                    debug!(rule = rule.name(), iteration, "Rule applied");
                    if let Some(before) = before {
                        trace.push(RuleTrace::new(rule.name(), before, result.plan.explain()));
                    }
                }
                current = result.plan;
            }
            if !changed {
                break;
            }
        }
        current.validate()?;
        Ok((current, trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(min: f32, sel: f64, io: f64) -> PlanStep {
        PlanStep::new(PlanOp::Filter {
            predicate: Predicate::MinConfidence { min },
        })
        .with_hint(SelectivityHint::filter(sel, io))
    }

    fn plan() -> QueryPlan {
        QueryPlan::from_source(PlanOp::ScanType {
            entity_type: "Person".to_string(),
        })
        .then(filter(0.1, 0.9, 1.0))
        .then(filter(0.2, 0.1, 1.0))
        .then(filter(0.3, 0.5, 1.0))
    }

    #[test]
    fn test_total_cost_strategy_orders_filters() {
        let optimizer = QueryOptimizer::new(OptimizerConfig::default().with_strategy(OptimizationStrategy::MinimizeTotalCost));
        let result = optimizer.optimize(plan()).unwrap();
        assert!(result.cost.total < result.original_cost.total);
        assert!(!result.kept_original);
        assert_eq!(result.trace[0].rule_name, "SelectivityReorder");
        assert!(result.plan.steps.iter().all(|s| !s.concurrent));
    }

    #[test]
    fn test_latency_strategy_groups_filters() {
        let optimizer = QueryOptimizer::new(OptimizerConfig::default().with_strategy(OptimizationStrategy::MinimizeLatency));
        let result = optimizer.optimize(plan()).unwrap();
        assert!(result.cost.critical_path < result.original_cost.critical_path);
        assert_eq!(result.plan.stages().len(), 2);
        let rules: Vec<&str> = result.trace.iter().map(|t| t.rule_name.as_str()).collect();
        assert_eq!(rules, vec!["SelectivityReorder", "ConcurrentFilterStage"]);
    }

    #[test]
    fn test_balanced_pipelines_converge() {
        let optimizer = QueryOptimizer::new(
            OptimizerConfig::default().with_strategy(OptimizationStrategy::Balanced { cost_weight: 0.5 }),
        );
        let result = optimizer.optimize(plan()).unwrap();
        assert!(result.trace.len() <= 2);
    }

    #[test]
    fn test_never_worse_than_input() {
        for strategy in [
            OptimizationStrategy::MinimizeTotalCost,
            OptimizationStrategy::MinimizeLatency,
            OptimizationStrategy::Balanced { cost_weight: 0.3 },
        ] {
            let optimizer = QueryOptimizer::new(OptimizerConfig::default().with_strategy(strategy));
            let result = optimizer.optimize(plan()).unwrap();
            let before = strategy.objective(&result.original_cost, &result.original_cost);
            let after = strategy.objective(&result.cost, &result.original_cost);
            assert!(after <= before + 1e-9, "{:?} made the plan worse", strategy);
        }
    }

    #[test]
    fn test_unhinted_plan_is_kept() {
        let plan = QueryPlan::from_source(PlanOp::ScanType {
            entity_type: "Person".to_string(),
        })
        .then_op(PlanOp::Limit { count: 3 });
        let result = QueryOptimizer::default().optimize(plan.clone()).unwrap();
        assert_eq!(result.plan, plan);
        assert!(result.trace.is_empty());
    }

    #[test]
    fn test_invalid_plan_rejected() {
        let err = QueryOptimizer::default().optimize(QueryPlan::default()).unwrap_err();
        assert_eq!(err.code(), "INVALID_PLAN");
    }
}
