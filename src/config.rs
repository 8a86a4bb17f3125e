//! Kernel configuration.
//!
//! Every section has production defaults, so an empty JSON object is a
//! valid configuration.

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::fusion::FusionConfig;
use crate::optimizer::OptimizerConfig;
use crate::rerank::RerankConfig;
use crate::runnable::RunnerConfig;
use crate::schema::SchemaCacheConfig;
use crate::store::RateLimitConfig;

#[cfg(feature = "postgres")]
use crate::store::postgres::PostgresConfig;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// In-process maps.
    #[default]
    Memory,
    /// PostgreSQL (feature `postgres`).
    Postgres,
}

/// Storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend.
    pub backend: StorageBackend,
    /// Token bucket in front of the backend; unlimited when absent.
    pub rate_limit: Option<RateLimitConfig>,
    /// Connection settings for the PostgreSQL backend.
    #[cfg(feature = "postgres")]
    pub postgres: PostgresConfig,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Retry, timeout and breaker settings of every store call.
    pub runner: RunnerConfig,
    /// Schema lookup cache.
    pub schema_cache: SchemaCacheConfig,
    /// Knowledge fusion.
    pub fusion: FusionConfig,
    /// Reranking weights.
    pub rerank: RerankConfig,
    /// Query optimizer.
    pub optimizer: OptimizerConfig,
    /// Storage backend.
    pub storage: StorageConfig,
}

impl KernelConfig {
    /// Parse from JSON; missing sections take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| GraphError::validation("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        let fusion = &self.fusion;
        if !(0.0..=1.0).contains(&fusion.similarity_threshold) {
            return Err(GraphError::validation("fusion.similarity_threshold", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&fusion.agreement_threshold) {
            return Err(GraphError::validation("fusion.agreement_threshold", "must be within [0, 1]"));
        }
        if fusion.max_candidates == 0 {
            return Err(GraphError::validation("fusion.max_candidates", "must be positive"));
        }
        if self.runner.retry.max_attempts == 0 {
            return Err(GraphError::validation("runner.retry.max_attempts", "must be positive"));
        }
        let w = &self.rerank.weights;
        if [w.text, w.semantic, w.structural].iter().any(|x| *x < 0.0) {
            return Err(GraphError::validation("rerank.weights", "weights must be non-negative"));
        }
        if self.storage.backend == StorageBackend::Postgres && !cfg!(feature = "postgres") {
            return Err(GraphError::validation(
                "storage.backend",
                "postgres backend requires the `postgres` feature",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::ConflictStrategy;

    #[test]
    fn test_empty_object_is_default() {
        let config = KernelConfig::from_json_str("{}").unwrap();
        assert_eq!(config.fusion, FusionConfig::default());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.storage.rate_limit.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = KernelConfig::from_json_str(
            r#"{
                "runner": {"retry": {"max_attempts": 5}, "attempt_timeout_ms": 250},
                "fusion": {"similarity_threshold": 0.8, "property_strategies": {"bio": "longest"}},
                "rerank": {"weights": {"text": 1.0, "semantic": 0.0, "structural": 0.0}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.runner.retry.max_attempts, 5);
        assert_eq!(config.runner.attempt_timeout_ms, Some(250));
        assert_eq!(config.fusion.strategy_for("bio"), ConflictStrategy::Longest);
        assert_eq!(config.fusion.max_candidates, 50);
        assert_eq!(config.rerank.weights.text, 1.0);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = KernelConfig::from_json_str(r#"{"fusion": {"similarity_threshold": 1.5}}"#).unwrap_err();
        assert!(matches!(err, GraphError::Validation { ref path, .. } if path == "fusion.similarity_threshold"));
        assert!(KernelConfig::from_json_str("not json").is_err());
    }
}
