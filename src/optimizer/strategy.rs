//! Optimization strategies and optimizer configuration.

use serde::{Deserialize, Serialize};

use super::cost::PlanCost;
use super::rules::{ConcurrentFilterStage, FilterMerge, OptimizationRule, SelectivityReorder};

/// What the optimizer minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizationStrategy {
    /// Total work: filters run sequentially in rank order.
    MinimizeTotalCost,
    /// Critical path: commuting filters share one concurrent stage.
    MinimizeLatency,
    /// Weighted mix of normalized total cost and critical path.
    Balanced {
        /// Weight of total cost in [0, 1]; the rest goes to latency.
        cost_weight: f64,
    },
}

impl Default for OptimizationStrategy {
    fn default() -> Self {
        Self::Balanced { cost_weight: 0.5 }
    }
}

impl OptimizationStrategy {
    /// Rule pipelines worth trying under this strategy.
    pub(crate) fn pipelines(&self) -> Vec<Vec<Box<dyn OptimizationRule>>> {
        let sequential = || -> Vec<Box<dyn OptimizationRule>> { vec![Box::new(FilterMerge), Box::new(SelectivityReorder)] };
        let concurrent = || -> Vec<Box<dyn OptimizationRule>> {
            vec![Box::new(FilterMerge), Box::new(SelectivityReorder), Box::new(ConcurrentFilterStage)]
        };
        match self {
            Self::MinimizeTotalCost => vec![sequential()],
            Self::MinimizeLatency => vec![concurrent()],
            Self::Balanced { .. } => vec![sequential(), concurrent()],
        }
    }

    /// Objective value of `cost`, lower is better. `reference` normalizes the
    /// balanced objective so both terms are comparable.
    pub fn objective(&self, cost: &PlanCost, reference: &PlanCost) -> f64 {
        match self {
            Self::MinimizeTotalCost => cost.total,
            Self::MinimizeLatency => cost.critical_path,
            Self::Balanced { cost_weight } => {
                let w = cost_weight.clamp(0.0, 1.0);
                let total = ratio(cost.total, reference.total);
                let latency = ratio(cost.critical_path, reference.critical_path);
                w * total + (1.0 - w) * latency
            }
        }
    }
}

fn ratio(value: f64, reference: f64) -> f64 {
    if reference > 0.0 {
        value / reference
    } else {
        value
    }
}

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// What to minimize.
    pub strategy: OptimizationStrategy,
    /// Fixed-point iteration cap per pipeline.
    pub max_iterations: usize,
    /// Record before/after plans for each applied rule.
    pub enable_trace: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: OptimizationStrategy::default(),
            max_iterations: 16,
            enable_trace: true,
        }
    }
}

impl OptimizerConfig {
    /// Config with the given strategy.
    pub fn with_strategy(mut self, strategy: OptimizationStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_objective_weights() {
        let reference = PlanCost {
            total: 100.0,
            critical_path: 50.0,
            output_rows: 1.0,
        };
        let cost = PlanCost {
            total: 50.0,
            critical_path: 50.0,
            output_rows: 1.0,
        };
        let only_cost = OptimizationStrategy::Balanced { cost_weight: 1.0 };
        assert!((only_cost.objective(&cost, &reference) - 0.5).abs() < 1e-9);
        let only_latency = OptimizationStrategy::Balanced { cost_weight: 0.0 };
        assert!((only_latency.objective(&cost, &reference) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_roundtrips_through_config_json() {
        let json = r#"{"strategy":{"kind":"minimize_latency"}}"#;
        let config: OptimizerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.strategy, OptimizationStrategy::MinimizeLatency);
        assert_eq!(config.max_iterations, 16);
    }
}
