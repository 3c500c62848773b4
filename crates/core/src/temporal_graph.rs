//! Verity: consistency engine for bi-temporal knowledge graphs.
//!
//! The graph holds [`Entity`] nodes and typed [`Relationship`] edges. Every
//! relationship carries two independent time axes:
//!
//! **Transaction time** (`created_at`) captures when the edge was recorded.
//! **Valid time** (`valid_at` / `invalid_at`) captures when the edge was true
//! *in the world*, as the half-open interval `[valid_at, invalid_at)`.
//!
//! Verity keeps such a graph consistent. Storage is a collaborator behind the
//! [`GraphStore`] trait ([`MemoryStore`] and the redb-backed [`RedbStore`]
//! ship with the crate), driven by these components:
//!
//! - [`TemporalEnhancer`] stamps new relationships with bi-temporal metadata.
//! - [`ContradictionDetector`] finds stored edges of the same
//!   `(from, to, type)` whose validity overlaps a candidate.
//! - [`ContradictionResolver`] applies a [`ResolutionStrategy`] to every
//!   conflicting pair and records the outcome through the
//!   [`ContradictionLogger`].
//! - [`EntityMatcher`] / [`EntityMerger`] find duplicate entities by exact
//!   name variants or embedding similarity and merge their attributes.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use verity::{
//!     ContradictionResolver, EngineConfig, GraphStore, MemoryStore, NewRelationship,
//!     ResolutionStrategy, TemporalEnhancer,
//! };
//!
//! let config = EngineConfig::default();
//! let store: Arc<dyn GraphStore> = Arc::new(MemoryStore::new());
//! let enhancer = TemporalEnhancer::new();
//! let resolver = ContradictionResolver::new(store.clone(), &config);
//!
//! let edge = enhancer
//!     .enhance(NewRelationship::new("alice", "acme", "works_at"), None, None)
//!     .unwrap();
//! let edge = store.insert_relationship(&edge).unwrap();
//! let result = resolver.resolve_all(&edge, ResolutionStrategy::NewestWins).unwrap();
//! assert!(result.success);
//! ```

pub mod audit;
pub mod config;
pub mod contradiction;
pub mod matcher;
pub mod merger;
pub mod model;
pub mod normalize;
pub mod redb_store;
pub mod store;
pub mod temporal;
pub mod validation;
pub mod vector;

pub use audit::{
    AuditSummary, ContradictionLogger, ContradictionRecord, EdgeSummary, RecordStatus,
    ResolutionSummary,
};
pub use config::{EngineConfig, MatchingConfig, ValidationConfig};
pub use contradiction::{
    plan_resolution, ContradictionDetector, ContradictionResolver, PairOutcome, ResolutionAction,
    ResolutionPlan, ResolutionState, ResolveAllResult,
};
pub use matcher::{calculate_match_confidence, Embedder, EntityMatch, EntityMatcher, MatchMethod};
pub use merger::{merge_attributes, merge_entity_attributes, EntityMerger, EntityResolution};
pub use model::{
    Attributes, Entity, EntityId, MergeRecord, MergeStrategy, NewRelationship, Relationship,
    RelationshipId, ResolutionStrategy, Value,
};
pub use redb_store::RedbStore;
pub use store::{EntityQuery, GraphStore, MemoryStore, RelationshipQuery};
pub use temporal::{Interval, TemporalEnhancer, TimeInput};
pub use validation::{validate_relationship, ValidationReport};
pub use vector::{select_ann, AnnSearch, BruteForceAnn, NativeAnn, VectorIndex};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VerityError {
    #[error("storage error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// A revision-checked write lost a race with another writer.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for VerityError {
    fn from(e: redb::DatabaseError) -> Self {
        VerityError::Store(e.to_string())
    }
}
impl From<redb::TransactionError> for VerityError {
    fn from(e: redb::TransactionError) -> Self {
        VerityError::Store(e.to_string())
    }
}
impl From<redb::TableError> for VerityError {
    fn from(e: redb::TableError) -> Self {
        VerityError::Store(e.to_string())
    }
}
impl From<redb::StorageError> for VerityError {
    fn from(e: redb::StorageError) -> Self {
        VerityError::Store(e.to_string())
    }
}
impl From<redb::CommitError> for VerityError {
    fn from(e: redb::CommitError) -> Self {
        VerityError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VerityError>;
