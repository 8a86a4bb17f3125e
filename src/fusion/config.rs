//! Fusion configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How conflicting values of a property are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Value from the member with the most non-empty properties.
    MostComplete,
    /// Value from the most recently updated member.
    MostRecent,
    /// Value from the member with the highest extraction confidence.
    MostConfident,
    /// Longest rendered value.
    Longest,
    /// Every distinct value, as a list.
    KeepAll,
}

/// Knowledge fusion settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Minimum name similarity for two entities to be merged.
    pub similarity_threshold: f64,
    /// Upper bound on candidates compared per entity.
    pub max_candidates: usize,
    /// Strategy for properties without an override.
    pub default_strategy: ConflictStrategy,
    /// Per-property strategy overrides. An override also disables voting
    /// for that property.
    pub property_strategies: BTreeMap<String, ConflictStrategy>,
    /// String properties resolved by voting rather than by strategy.
    pub categorical_properties: Vec<String>,
    /// Source name -> quality weight in [0, 1].
    pub source_quality: BTreeMap<String, f64>,
    /// Weight of members whose source quality is unknown.
    pub default_source_quality: f64,
    /// Weighted agreement needed to accept a voted value.
    pub agreement_threshold: f64,
    /// Relative tolerance under which numeric votes count as equal.
    pub numeric_tolerance: f64,
    /// Fail the run instead of flagging unresolved conflicts.
    pub fail_on_conflict: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.9,
            max_candidates: 50,
            default_strategy: ConflictStrategy::MostComplete,
            property_strategies: BTreeMap::new(),
            categorical_properties: Vec::new(),
            source_quality: BTreeMap::new(),
            default_source_quality: 0.5,
            agreement_threshold: 0.6,
            numeric_tolerance: 0.01,
            fail_on_conflict: false,
        }
    }
}

impl FusionConfig {
    /// Strategy applied to a property.
    pub fn strategy_for(&self, property: &str) -> ConflictStrategy {
        self.property_strategies
            .get(property)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Override the strategy of one property.
    pub fn with_property_strategy(mut self, property: impl Into<String>, strategy: ConflictStrategy) -> Self {
        self.property_strategies.insert(property.into(), strategy);
        self
    }

    /// Set a source's quality weight.
    pub fn with_source_quality(mut self, source: impl Into<String>, quality: f64) -> Self {
        self.source_quality.insert(source.into(), quality);
        self
    }

    /// Mark a string property as categorical (voted).
    pub fn with_categorical(mut self, property: impl Into<String>) -> Self {
        self.categorical_properties.push(property.into());
        self
    }
}
