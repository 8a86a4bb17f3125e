//! Knowledge fusion: deduplicating entities extracted from different documents.
//!
//! ## Pipeline
//!
//! 1. Enumerate active entities, blocked by tenant and type.
//! 2. Retrieve candidates through a token [`CandidateIndex`].
//! 3. Score pairs with [`name_similarity`]; union pairs above the threshold.
//! 4. Reconcile properties per group (voting or [`ConflictStrategy`]).
//! 5. Write the canonical entity, mark members, project relations.

pub mod config;
pub mod consensus;
pub mod engine;
pub mod index;
pub mod similarity;

pub use config::{ConflictStrategy, FusionConfig};
pub use consensus::{Contribution, Resolution};
pub use engine::{EntityProvenance, FusionEngine, FusionStats, PropertyConflict};
pub use index::CandidateIndex;
pub use similarity::name_similarity;
