//! Error types shared by every kernel component.
//!
//! ## Propagation Policy
//!
//! | Kind | Retried by the runner | Notes |
//! |------|----------------------|-------|
//! | `Validation` | no | carries the dotted property path |
//! | `NotFound` | no | absent entity / relation / type |
//! | `Timeout` | yes (idempotent ops only) | attempt or deadline expiry |
//! | `Backend { transient: true }` | yes | connection-class failures |
//! | `RetryExhausted` | no | wraps the last attempt's error |
//! | `CircuitOpen` | no | fast-fail while the breaker is open |
//! | `ConflictUnresolved` | no | fusion could not reach agreement |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runnable::RunnableState;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Kind of resource referenced by a `NotFound` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// An entity.
    Entity,
    /// A relation.
    Relation,
    /// An entity type definition.
    EntityType,
    /// A relation type definition.
    RelationType,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity => write!(f, "entity"),
            Self::Relation => write!(f, "relation"),
            Self::EntityType => write!(f, "entity type"),
            Self::RelationType => write!(f, "relation type"),
        }
    }
}

/// Errors surfaced by storage, schema, fusion and execution operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// Schema or property violation.
    #[error("Validation failed at `{path}`: {reason}")]
    Validation {
        /// Dotted path of the offending property (empty for whole-object errors).
        path: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Entity, relation or type absent.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up.
        kind: ResourceKind,
        /// Identifier that was looked up.
        id: String,
    },

    /// An attempt (or the overall deadline) expired.
    #[error("Operation `{operation}` on `{target}` timed out (attempt {attempt})")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Target identifier.
        target: String,
        /// Attempt number that timed out (1-based).
        attempt: u32,
    },

    /// All retry attempts failed.
    #[error("Operation `{operation}` on `{target}` failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Operation name.
        operation: String,
        /// Target identifier.
        target: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: Box<GraphError>,
    },

    /// The circuit breaker is open and the call was rejected without running.
    #[error("Circuit open for `{operation}` on `{target}`")]
    CircuitOpen {
        /// Operation name.
        operation: String,
        /// Target identifier.
        target: String,
    },

    /// Consensus fusion could not reach the agreement threshold.
    #[error(
        "Consensus not reached for `{property}` on {entity_id}: agreement {agreement:.3} < {threshold:.3}"
    )]
    ConflictUnresolved {
        /// Canonical entity being built.
        entity_id: String,
        /// Property in conflict.
        property: String,
        /// Best weighted agreement observed.
        agreement: f64,
        /// Configured agreement threshold.
        threshold: f64,
    },

    /// Implicit schema redefinition or version mismatch.
    #[error("Schema conflict for `{name}`: {reason}")]
    SchemaConflict {
        /// Type name.
        name: String,
        /// Why the write was refused.
        reason: String,
    },

    /// Illegal lifecycle transition in the execution substrate.
    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: RunnableState,
        /// Requested state.
        to: RunnableState,
    },

    /// Backend failure.
    #[error("Backend error during `{operation}`: {message}")]
    Backend {
        /// Operation name.
        operation: String,
        /// Backend message.
        message: String,
        /// Whether a retry may succeed (connection-class failures).
        transient: bool,
    },

    /// The backend does not provide the capability.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The query plan is malformed.
    #[error("Invalid query plan: {0}")]
    InvalidPlan(String),
}

impl GraphError {
    /// Create a validation error.
    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(kind: ResourceKind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Create a backend error.
    pub fn backend(operation: impl Into<String>, message: impl fmt::Display, transient: bool) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.to_string(),
            transient,
        }
    }

    /// Whether the execution substrate may retry after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Backend { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Stable machine-readable code for API responses and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Timeout { .. } => "TIMEOUT",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::ConflictUnresolved { .. } => "CONFLICT_UNRESOLVED",
            Self::SchemaConflict { .. } => "SCHEMA_CONFLICT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Backend { .. } => "BACKEND_ERROR",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::InvalidPlan(_) => "INVALID_PLAN",
        }
    }
}
