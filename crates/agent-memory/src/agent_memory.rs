//! High-level agent memory API built on Verity.
//!
//! Wires the enhancer, contradiction resolver and entity merger into the two
//! write paths an agent needs, and serializes them so concurrent callers
//! cannot both miss each other's writes:
//!
//! - relationships are serialized per `(from, to, type)`;
//! - entity adds and merges run one at a time, since a match can come from
//!   any name variant or from embedding similarity;
//! - relationship endpoints are canonicalized under a shared hold on the
//!   entity flow, so no merge lands between redirect and write.
//!
//! # Usage
//!
//! ```rust,no_run
//! use verity_agent_memory::{AgentMemory, RelationshipParams};
//! use verity::{Entity, NewRelationship};
//!
//! let memory = AgentMemory::open("./my-agent.verity").unwrap();
//!
//! let alice = memory.add_entity(Entity::new("Alice Smith", "person")).unwrap().entity;
//! let acme = memory.add_entity(Entity::new("Acme", "organization")).unwrap().entity;
//!
//! // Alice moved from Acme's Berlin office to Paris in March.
//! let params = RelationshipParams::default().valid_from("2024-03-01");
//! let outcome = memory
//!     .add_relationship(
//!         NewRelationship::new(alice.id.clone(), acme.id.clone(), "works_at")
//!             .with_attribute("office", "Paris"),
//!         params,
//!     )
//!     .unwrap();
//! assert!(outcome.success);
//!
//! // What did we believe about Alice and Acme in February?
//! let past: chrono::DateTime<chrono::Utc> = "2024-02-01T00:00:00Z".parse().unwrap();
//! let then = memory.relationships_at(&alice.id, &acme.id, past).unwrap();
//! ```

mod keyed_lock;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

use verity::{
    validate_relationship, AuditSummary, ContradictionRecord, ContradictionResolver, Embedder,
    EngineConfig, Entity, EntityId, EntityMatcher, EntityMerger, EntityResolution, GraphStore,
    MemoryStore, MergeStrategy, NewRelationship, PairOutcome, RedbStore, Relationship,
    RelationshipQuery, ResolutionStrategy, TemporalEnhancer, TimeInput, ValidationReport,
};

use keyed_lock::KeyedLocks;

pub use verity::VerityError as Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Optional inputs to [`AgentMemory::add_relationship`].
#[derive(Debug, Clone, Default)]
pub struct RelationshipParams {
    /// Start of validity. Defaults to now.
    pub reference_time: Option<TimeInput>,
    /// End of validity. Defaults to open-ended.
    pub valid_until: Option<TimeInput>,
    /// Defaults to the configured strategy.
    pub strategy: Option<ResolutionStrategy>,
}

impl RelationshipParams {
    pub fn valid_from(mut self, at: impl Into<TimeInput>) -> Self {
        self.reference_time = Some(at.into());
        self
    }

    pub fn valid_until(mut self, at: impl Into<TimeInput>) -> Self {
        self.valid_until = Some(at.into());
        self
    }

    pub fn strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// What [`AgentMemory::add_relationship`] stored and resolved.
#[derive(Debug, Clone)]
pub struct RelationshipOutcome {
    /// The new relationship as stored after resolution.
    pub relationship: Relationship,
    pub outcomes: Vec<PairOutcome>,
    /// `false` if any contradicting pair failed to resolve.
    pub success: bool,
    pub report: ValidationReport,
}

/// Optional overrides for [`AgentMemory::add_entity_with`].
#[derive(Debug, Clone, Default)]
pub struct EntityOptions {
    pub min_confidence: Option<f64>,
    pub merge_strategy: Option<MergeStrategy>,
    pub auto_merge: Option<bool>,
}

/// Agent memory over a consistent bi-temporal knowledge graph.
///
/// This is the primary entry point for AI agent developers.
pub struct AgentMemory {
    store: Arc<dyn GraphStore>,
    config: EngineConfig,
    enhancer: TemporalEnhancer,
    resolver: ContradictionResolver,
    merger: EntityMerger,
    locks: KeyedLocks,
    entity_flow: RwLock<()>,
}

impl AgentMemory {
    /// Open or create an agent memory file at the given path.
    ///
    /// ```rust,no_run
    /// use verity_agent_memory::AgentMemory;
    /// let memory = AgentMemory::open("./my-agent.verity").unwrap();
    /// ```
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: &str, config: EngineConfig) -> Result<Self> {
        let store = RedbStore::open(path, &config)?;
        Self::with_store(Arc::new(store), config)
    }

    /// Memory that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_store(Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    /// Run on any [`GraphStore`].
    pub fn with_store(store: Arc<dyn GraphStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let matcher = EntityMatcher::new(store.clone(), &config.matching);
        Ok(Self {
            resolver: ContradictionResolver::new(store.clone(), &config),
            merger: EntityMerger::new(store.clone(), matcher, &config),
            enhancer: TemporalEnhancer::new(),
            locks: KeyedLocks::new(),
            entity_flow: RwLock::new(()),
            store,
            config,
        })
    }

    /// Generate embeddings for entities that arrive without one.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        let matcher =
            EntityMatcher::new(self.store.clone(), &self.config.matching).with_embedder(embedder);
        self.merger = EntityMerger::new(self.store.clone(), matcher, &self.config);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Relationships
    // -----------------------------------------------------------------------

    /// Validate, stamp, store and reconcile a new relationship.
    ///
    /// Endpoints that name merged-away entities are redirected to the entity
    /// they were merged into.
    ///
    /// # Errors
    ///
    /// Validation and detection failures are returned before or instead of
    /// resolution. Failures resolving individual contradictions are reported
    /// in [`RelationshipOutcome::outcomes`] instead.
    pub fn add_relationship(
        &self,
        relationship: NewRelationship,
        params: RelationshipParams,
    ) -> Result<RelationshipOutcome> {
        let report = validate_relationship(&relationship, &self.config.validation)?;
        let strategy = params.strategy.unwrap_or(self.config.default_strategy);

        let _entities = self.entity_flow.read();
        let mut relationship = relationship;
        relationship.from_id = self.canonical_id(&relationship.from_id)?;
        relationship.to_id = self.canonical_id(&relationship.to_id)?;

        let key = format!(
            "{}\u{1f}{}\u{1f}{}",
            relationship.from_id, relationship.to_id, relationship.rel_type
        );
        self.locks.with_lock(&key, || {
            let enhanced =
                self.enhancer
                    .enhance(relationship, params.reference_time, params.valid_until)?;
            let stored = self.store.insert_relationship(&enhanced)?;
            let result = self.resolver.resolve_all(&stored, strategy)?;
            if !result.success {
                warn!(edge = %stored.id, "some contradictions were not resolved");
            }
            Ok(RelationshipOutcome {
                relationship: self.store.relationship(&stored.id)?,
                outcomes: result.outcomes,
                success: result.success,
                report,
            })
        })
    }

    /// Record that `from` relates to `to` as of now.
    pub fn assert_relationship(
        &self,
        from: impl Into<EntityId>,
        to: impl Into<EntityId>,
        rel_type: &str,
    ) -> Result<RelationshipOutcome> {
        self.add_relationship(
            NewRelationship::new(from, to, rel_type),
            RelationshipParams::default(),
        )
    }

    /// Every relationship between the pair, closed ones included.
    pub fn relationships_between(&self, from: &EntityId, to: &EntityId) -> Result<Vec<Relationship>> {
        let query = RelationshipQuery::between(self.canonical_id(from)?, self.canonical_id(to)?);
        self.store.query_relationships(&query)
    }

    /// Relationships between the pair that are still open.
    pub fn current_relationships(&self, from: &EntityId, to: &EntityId) -> Result<Vec<Relationship>> {
        let query = RelationshipQuery::between(self.canonical_id(from)?, self.canonical_id(to)?)
            .current_only();
        self.store.query_relationships(&query)
    }

    /// Relationships between the pair that were true at `at`.
    pub fn relationships_at(
        &self,
        from: &EntityId,
        to: &EntityId,
        at: DateTime<Utc>,
    ) -> Result<Vec<Relationship>> {
        let query =
            RelationshipQuery::between(self.canonical_id(from)?, self.canonical_id(to)?).valid_at(at);
        self.store.query_relationships(&query)
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Merge `entity` into a stored duplicate, or insert it.
    pub fn add_entity(&self, entity: Entity) -> Result<EntityResolution> {
        self.add_entity_with(entity, EntityOptions::default())
    }

    pub fn add_entity_with(&self, entity: Entity, options: EntityOptions) -> Result<EntityResolution> {
        let matching = &self.config.matching;
        let min_confidence = options.min_confidence.unwrap_or(matching.min_confidence);
        let merge_strategy = options.merge_strategy.unwrap_or(matching.merge_strategy);
        let auto_merge = options.auto_merge.unwrap_or(matching.auto_merge);

        let _entities = self.entity_flow.write();
        self.merger
            .resolve_entity(&entity, min_confidence, merge_strategy, auto_merge)
    }

    /// Merge stored entity `source` into `target`, leaving a tombstone.
    pub fn merge_entities(
        &self,
        source: &EntityId,
        target: &EntityId,
        strategy: Option<MergeStrategy>,
    ) -> Result<Entity> {
        let strategy = strategy.unwrap_or(self.config.matching.merge_strategy);
        let _entities = self.entity_flow.write();
        self.merger.merge_entities(source, target, strategy)
    }

    /// The entity stored under `id`, tombstones included.
    pub fn entity(&self, id: &EntityId) -> Result<Entity> {
        self.store.entity(id)
    }

    /// The live entity `id` resolves to.
    pub fn canonical_entity(&self, id: &EntityId) -> Result<Entity> {
        self.merger.canonical_entity(id)
    }

    /// `id` with merges followed. Ids that name no stored entity are kept
    /// as-is, since relationship endpoints may be external identifiers.
    fn canonical_id(&self, id: &EntityId) -> Result<EntityId> {
        match self.merger.canonical_entity(id) {
            Ok(entity) => {
                if &entity.id != id {
                    debug!(from = %id, to = %entity.id, "redirected merged entity");
                }
                Ok(entity.id)
            }
            Err(Error::NotFound(_)) => Ok(id.clone()),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Audit and context
    // -----------------------------------------------------------------------

    /// The `limit` most recent contradiction records, newest first.
    pub fn contradiction_log(&self, limit: usize) -> Result<Vec<ContradictionRecord>> {
        self.resolver.logger().recent(limit)
    }

    pub fn audit_summary(&self) -> Result<AuditSummary> {
        self.resolver.logger().summary()
    }

    /// Render what is currently believed about `entity` as prompt lines,
    /// within roughly `max_tokens` tokens.
    pub fn assemble_context(&self, entity: &EntityId, max_tokens: usize) -> Result<String> {
        let subject = self.canonical_entity(entity)?;
        let query = RelationshipQuery::outgoing(subject.id.clone()).current_only();
        let relationships = self.store.query_relationships(&query)?;
        let char_budget = max_tokens.saturating_mul(4); // rough 1 token ≈ 4 chars
        let mut context = String::new();

        for rel in &relationships {
            let object = match self.store.entity(&rel.to_id) {
                Ok(target) => target.name,
                Err(Error::NotFound(_)) => rel.to_id.to_string(),
                Err(e) => return Err(e),
            };
            let line = format!(
                "[{}] {} · {} · {}\n",
                rel.valid_at.format("%Y-%m-%d"),
                subject.name,
                rel.rel_type,
                object
            );
            if context.len() + line.len() > char_budget {
                break;
            }
            context.push_str(&line);
        }

        Ok(context)
    }
}
