//! The graph-document store the engine consumes.
//!
//! Storage, querying and indexing belong to the store; the engine only reads
//! documents, writes them back with optimistic concurrency, and appends audit
//! records. Every stored document carries a `revision`: inserts start at 1,
//! and a replace succeeds only if the submitted document still carries the
//! stored revision, after which the stored revision is bumped. Stale writes
//! fail with [`VerityError::Conflict`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::audit::ContradictionRecord;
use crate::model::{Entity, EntityId, Relationship, RelationshipId};
use crate::temporal::Interval;
use crate::vector::VectorIndex;
use crate::{Result, VerityError};

/// Filter over the entity collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityQuery {
    pub entity_type: Option<String>,
    /// Also return tombstoned (merged-away) entities.
    pub include_merged: bool,
    /// Only return entities that carry an embedding.
    pub with_embedding_only: bool,
}

impl EntityQuery {
    /// Every entity that has not been merged into another.
    pub fn live() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            include_merged: true,
            ..Self::default()
        }
    }

    pub fn of_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn with_embedding_only(mut self) -> Self {
        self.with_embedding_only = true;
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        (self.include_merged || !entity.is_tombstone())
            && (!self.with_embedding_only || entity.embedding.is_some())
            && self
                .entity_type
                .as_deref()
                .is_none_or(|t| entity.entity_type == t)
    }
}

/// Filter over the relationship collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipQuery {
    pub from_id: Option<EntityId>,
    pub to_id: Option<EntityId>,
    pub rel_type: Option<String>,
    /// Also return relationships whose validity has been closed.
    pub include_invalidated: bool,
    /// Only relationships valid at this instant.
    pub valid_at: Option<DateTime<Utc>>,
    /// Only relationships whose validity overlaps this interval.
    pub overlapping: Option<Interval>,
}

impl RelationshipQuery {
    /// All relationships from `from_id` to `to_id`, closed ones included.
    pub fn between(from_id: impl Into<EntityId>, to_id: impl Into<EntityId>) -> Self {
        Self {
            from_id: Some(from_id.into()),
            to_id: Some(to_id.into()),
            include_invalidated: true,
            ..Self::default()
        }
    }

    /// All relationships leaving `from_id`, closed ones included.
    pub fn outgoing(from_id: impl Into<EntityId>) -> Self {
        Self {
            from_id: Some(from_id.into()),
            include_invalidated: true,
            ..Self::default()
        }
    }

    pub fn of_type(mut self, rel_type: impl Into<String>) -> Self {
        self.rel_type = Some(rel_type.into());
        self
    }

    /// Drop relationships whose `invalid_at` is set.
    pub fn current_only(mut self) -> Self {
        self.include_invalidated = false;
        self
    }

    pub fn valid_at(mut self, at: DateTime<Utc>) -> Self {
        self.valid_at = Some(at);
        self
    }

    pub fn overlapping(mut self, interval: Interval) -> Self {
        self.overlapping = Some(interval);
        self
    }

    pub fn matches(&self, rel: &Relationship) -> bool {
        self.from_id.as_ref().is_none_or(|id| &rel.from_id == id)
            && self.to_id.as_ref().is_none_or(|id| &rel.to_id == id)
            && self.rel_type.as_deref().is_none_or(|t| rel.rel_type == t)
            && (self.include_invalidated || rel.is_current())
            && self.valid_at.is_none_or(|at| rel.was_valid_at(at))
            && self
                .overlapping
                .as_ref()
                .is_none_or(|iv| rel.interval().overlaps(iv))
    }
}

/// Graph-document store consumed by the engine.
///
/// Query results come back in transaction-time order (`created_at`, then id).
pub trait GraphStore: Send + Sync {
    /// Insert a new entity. Fails with `Conflict` if the id is taken.
    fn insert_entity(&self, entity: &Entity) -> Result<Entity>;

    fn entity(&self, id: &EntityId) -> Result<Entity>;

    /// Replace several entities atomically: either every revision check passes
    /// and all are written, or nothing is.
    fn replace_entities(&self, entities: &[Entity]) -> Result<Vec<Entity>>;

    fn replace_entity(&self, entity: &Entity) -> Result<Entity> {
        self.replace_entities(std::slice::from_ref(entity))?
            .pop()
            .ok_or_else(|| VerityError::Internal("replace returned no document".into()))
    }

    fn query_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>>;

    /// Insert a new relationship. Fails with `Conflict` if the id is taken.
    fn insert_relationship(&self, relationship: &Relationship) -> Result<Relationship>;

    fn relationship(&self, id: &RelationshipId) -> Result<Relationship>;

    /// Replace several relationships atomically.
    fn replace_relationships(&self, relationships: &[Relationship]) -> Result<Vec<Relationship>>;

    fn query_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>>;

    /// Append to the contradiction audit trail.
    fn append_audit(&self, record: &ContradictionRecord) -> Result<()>;

    /// Most recent audit records first.
    fn recent_audit(&self, limit: usize) -> Result<Vec<ContradictionRecord>>;

    /// Does this store have a native nearest-neighbour operator?
    fn supports_vector_search(&self) -> bool {
        false
    }

    /// Native nearest-neighbour search over live entity embeddings.
    fn vector_search(
        &self,
        _query: &[f32],
        _k: usize,
        _threshold: f32,
    ) -> Result<Vec<(EntityId, f32)>> {
        Err(VerityError::Unsupported(
            "this store has no native vector search".to_string(),
        ))
    }
}

pub(crate) fn sort_entities(entities: &mut [Entity]) {
    entities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn sort_relationships(relationships: &mut [Relationship]) {
    relationships.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn check_revision(kind: &str, id: &str, stored: u64, submitted: u64) -> Result<()> {
    if stored != submitted {
        return Err(VerityError::Conflict(format!(
            "{kind} {id} is at revision {stored}, write was based on {submitted}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Collections {
    entities: HashMap<EntityId, Entity>,
    relationships: HashMap<RelationshipId, Relationship>,
    audit: Vec<ContradictionRecord>,
}

/// Process-local [`GraphStore`] with a native flat vector index.
///
/// Useful for tests and ephemeral workloads; data is lost on drop.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
    /// Embeddings of live entities. Always updated while the collections
    /// write lock is held, so the two never disagree.
    vector_index: Mutex<VectorIndex>,
}

fn poisoned<T>(_: T) -> VerityError {
    VerityError::Internal("memory store lock poisoned".into())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the vector index in line with `entities`, checking dimensions for
    /// the whole batch before touching the index.
    fn sync_vector_index(&self, entities: &[&Entity]) -> Result<()> {
        let mut index = self.vector_index.lock().map_err(poisoned)?;
        let mut dim = index.dim();
        for entity in entities.iter().filter(|e| !e.is_tombstone()) {
            if let Some(embedding) = entity.embedding.as_deref() {
                if embedding.is_empty() {
                    return Err(VerityError::InvalidEmbedding(format!(
                        "entity {} has an empty embedding",
                        entity.id
                    )));
                }
                match dim {
                    None => dim = Some(embedding.len()),
                    Some(d) if d != embedding.len() => {
                        return Err(VerityError::InvalidEmbedding(format!(
                            "embedding dimension mismatch for entity {}: expected {d}, got {}",
                            entity.id,
                            embedding.len()
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        for entity in entities {
            match (&entity.embedding, entity.is_tombstone()) {
                (Some(embedding), false) => index.insert(entity.id.clone(), embedding.clone())?,
                _ => index.remove(&entity.id),
            }
        }
        Ok(())
    }
}

impl GraphStore for MemoryStore {
    fn insert_entity(&self, entity: &Entity) -> Result<Entity> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        if collections.entities.contains_key(&entity.id) {
            return Err(VerityError::Conflict(format!(
                "entity {} already exists",
                entity.id
            )));
        }
        let mut stored = entity.clone();
        stored.revision = 1;
        self.sync_vector_index(&[&stored])?;
        collections.entities.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    fn entity(&self, id: &EntityId) -> Result<Entity> {
        let collections = self.collections.read().map_err(poisoned)?;
        collections
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| VerityError::NotFound(format!("entity {id}")))
    }

    fn replace_entities(&self, entities: &[Entity]) -> Result<Vec<Entity>> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let mut updated = Vec::with_capacity(entities.len());
        for entity in entities {
            let current = collections
                .entities
                .get(&entity.id)
                .ok_or_else(|| VerityError::NotFound(format!("entity {}", entity.id)))?;
            check_revision("entity", entity.id.as_str(), current.revision, entity.revision)?;
            let mut next = entity.clone();
            next.revision = current.revision + 1;
            updated.push(next);
        }
        self.sync_vector_index(&updated.iter().collect::<Vec<_>>())?;
        for entity in &updated {
            collections.entities.insert(entity.id.clone(), entity.clone());
        }
        Ok(updated)
    }

    fn query_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let mut results: Vec<Entity> = collections
            .entities
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        sort_entities(&mut results);
        Ok(results)
    }

    fn insert_relationship(&self, relationship: &Relationship) -> Result<Relationship> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        if collections.relationships.contains_key(&relationship.id) {
            return Err(VerityError::Conflict(format!(
                "relationship {} already exists",
                relationship.id
            )));
        }
        let mut stored = relationship.clone();
        stored.revision = 1;
        collections
            .relationships
            .insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    fn relationship(&self, id: &RelationshipId) -> Result<Relationship> {
        let collections = self.collections.read().map_err(poisoned)?;
        collections
            .relationships
            .get(id)
            .cloned()
            .ok_or_else(|| VerityError::NotFound(format!("relationship {id}")))
    }

    fn replace_relationships(&self, relationships: &[Relationship]) -> Result<Vec<Relationship>> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        let mut updated = Vec::with_capacity(relationships.len());
        for rel in relationships {
            let current = collections
                .relationships
                .get(&rel.id)
                .ok_or_else(|| VerityError::NotFound(format!("relationship {}", rel.id)))?;
            check_revision("relationship", rel.id.as_str(), current.revision, rel.revision)?;
            let mut next = rel.clone();
            next.revision = current.revision + 1;
            updated.push(next);
        }
        for rel in &updated {
            collections.relationships.insert(rel.id.clone(), rel.clone());
        }
        Ok(updated)
    }

    fn query_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let mut results: Vec<Relationship> = collections
            .relationships
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        sort_relationships(&mut results);
        Ok(results)
    }

    fn append_audit(&self, record: &ContradictionRecord) -> Result<()> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.audit.push(record.clone());
        Ok(())
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<ContradictionRecord>> {
        let collections = self.collections.read().map_err(poisoned)?;
        Ok(collections.audit.iter().rev().take(limit).cloned().collect())
    }

    fn supports_vector_search(&self) -> bool {
        true
    }

    fn vector_search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(EntityId, f32)>> {
        self.vector_index
            .lock()
            .map_err(poisoned)?
            .search(query, k, threshold)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A [`MemoryStore`] wrapper that fails chosen replace calls.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Picks the error, if any, for the `n`th call (counting from 1).
    pub(crate) type FaultPlan = fn(usize) -> Option<VerityError>;

    fn never(_: usize) -> Option<VerityError> {
        None
    }

    pub(crate) struct FaultyStore {
        inner: MemoryStore,
        entity_faults: FaultPlan,
        relationship_faults: FaultPlan,
        entity_replaces: AtomicUsize,
        relationship_replaces: AtomicUsize,
    }

    impl FaultyStore {
        pub(crate) fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                entity_faults: never,
                relationship_faults: never,
                entity_replaces: AtomicUsize::new(0),
                relationship_replaces: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing_entity_replaces(mut self, plan: FaultPlan) -> Self {
            self.entity_faults = plan;
            self
        }

        pub(crate) fn failing_relationship_replaces(mut self, plan: FaultPlan) -> Self {
            self.relationship_faults = plan;
            self
        }

        pub(crate) fn entity_replaces(&self) -> usize {
            self.entity_replaces.load(Ordering::SeqCst)
        }

        pub(crate) fn relationship_replaces(&self) -> usize {
            self.relationship_replaces.load(Ordering::SeqCst)
        }
    }

    impl GraphStore for FaultyStore {
        fn insert_entity(&self, entity: &Entity) -> Result<Entity> {
            self.inner.insert_entity(entity)
        }
        fn entity(&self, id: &EntityId) -> Result<Entity> {
            self.inner.entity(id)
        }
        fn replace_entities(&self, entities: &[Entity]) -> Result<Vec<Entity>> {
            let n = self.entity_replaces.fetch_add(1, Ordering::SeqCst) + 1;
            match (self.entity_faults)(n) {
                Some(err) => Err(err),
                None => self.inner.replace_entities(entities),
            }
        }
        fn query_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
            self.inner.query_entities(query)
        }
        fn insert_relationship(&self, rel: &Relationship) -> Result<Relationship> {
            self.inner.insert_relationship(rel)
        }
        fn relationship(&self, id: &RelationshipId) -> Result<Relationship> {
            self.inner.relationship(id)
        }
        fn replace_relationships(&self, rels: &[Relationship]) -> Result<Vec<Relationship>> {
            let n = self.relationship_replaces.fetch_add(1, Ordering::SeqCst) + 1;
            match (self.relationship_faults)(n) {
                Some(err) => Err(err),
                None => self.inner.replace_relationships(rels),
            }
        }
        fn query_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
            self.inner.query_relationships(query)
        }
        fn append_audit(&self, record: &ContradictionRecord) -> Result<()> {
            self.inner.append_audit(record)
        }
        fn recent_audit(&self, limit: usize) -> Result<Vec<ContradictionRecord>> {
            self.inner.recent_audit(limit)
        }
        fn supports_vector_search(&self) -> bool {
            self.inner.supports_vector_search()
        }
        fn vector_search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(EntityId, f32)>> {
            self.inner.vector_search(query, k, threshold)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attributes, Value};

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn edge(from: &str, to: &str, rel_type: &str, valid_at: &str) -> Relationship {
        Relationship {
            id: RelationshipId::new(),
            from_id: from.into(),
            to_id: to.into(),
            rel_type: rel_type.into(),
            attributes: Attributes::new(),
            confidence: 1.0,
            created_at: Utc::now(),
            valid_at: dt(valid_at),
            invalid_at: None,
            invalidation_reason: None,
            invalidated_by: None,
            revision: 0,
        }
    }

    #[test]
    fn insert_assigns_first_revision() {
        let store = MemoryStore::new();
        let stored = store.insert_entity(&Entity::new("Ada", "person")).unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(store.entity(&stored.id).unwrap(), stored);
    }

    #[test]
    fn duplicate_insert_is_a_conflict() {
        let store = MemoryStore::new();
        let entity = Entity::new("Ada", "person");
        store.insert_entity(&entity).unwrap();
        assert!(matches!(
            store.insert_entity(&entity),
            Err(VerityError::Conflict(_))
        ));
    }

    #[test]
    fn stale_replace_is_a_conflict() {
        let store = MemoryStore::new();
        let stored = store.insert_entity(&Entity::new("Ada", "person")).unwrap();

        let first = store
            .replace_entity(&stored.clone().with_attribute("field", "math"))
            .unwrap();
        assert_eq!(first.revision, 2);

        let stale = store.replace_entity(&stored.with_attribute("field", "poetry"));
        assert!(matches!(stale, Err(VerityError::Conflict(_))));
        assert_eq!(
            store.entity(&first.id).unwrap().attributes["field"],
            Value::from("math")
        );
    }

    #[test]
    fn batch_replace_is_all_or_nothing() {
        let store = MemoryStore::new();
        let a = store
            .insert_relationship(&edge("a", "b", "knows", "2024-01-01T00:00:00Z"))
            .unwrap();
        let b = store
            .insert_relationship(&edge("a", "b", "knows", "2024-02-01T00:00:00Z"))
            .unwrap();

        let mut a_closed = a.clone();
        a_closed.invalid_at = Some(dt("2024-02-01T00:00:00Z"));
        let mut b_stale = b.clone();
        b_stale.revision = 7;

        let result = store.replace_relationships(&[a_closed, b_stale]);
        assert!(matches!(result, Err(VerityError::Conflict(_))));
        assert!(store.relationship(&a.id).unwrap().is_current(), "nothing written");
    }

    #[test]
    fn relationship_query_filters() {
        let store = MemoryStore::new();
        let mut closed = edge("a", "b", "knows", "2024-01-01T00:00:00Z");
        closed.invalid_at = Some(dt("2024-03-01T00:00:00Z"));
        store.insert_relationship(&closed).unwrap();
        store
            .insert_relationship(&edge("a", "b", "knows", "2024-04-01T00:00:00Z"))
            .unwrap();
        store
            .insert_relationship(&edge("a", "b", "likes", "2024-04-01T00:00:00Z"))
            .unwrap();
        store
            .insert_relationship(&edge("a", "c", "knows", "2024-04-01T00:00:00Z"))
            .unwrap();

        let pair = store
            .query_relationships(&RelationshipQuery::between("a", "b"))
            .unwrap();
        assert_eq!(pair.len(), 3);

        let knows_now = store
            .query_relationships(&RelationshipQuery::between("a", "b").of_type("knows").current_only())
            .unwrap();
        assert_eq!(knows_now.len(), 1);

        let in_feb = store
            .query_relationships(
                &RelationshipQuery::between("a", "b").valid_at(dt("2024-02-01T00:00:00Z")),
            )
            .unwrap();
        assert_eq!(in_feb.len(), 1);
        assert_eq!(in_feb[0].id, closed.id);
    }

    #[test]
    fn tombstoned_entities_leave_the_vector_index() {
        let store = MemoryStore::new();
        let stored = store
            .insert_entity(&Entity::new("Ada", "person").with_embedding(vec![1.0, 0.0]))
            .unwrap();
        assert_eq!(store.vector_search(&[1.0, 0.0], 5, 0.0).unwrap().len(), 1);

        let mut tombstone = stored.clone();
        tombstone.merged_into = Some(EntityId::new());
        store.replace_entity(&tombstone).unwrap();

        assert!(store.vector_search(&[1.0, 0.0], 5, 0.0).unwrap().is_empty());
        assert!(store.query_entities(&EntityQuery::live()).unwrap().is_empty());
        assert_eq!(store.query_entities(&EntityQuery::all()).unwrap().len(), 1);
    }

    #[test]
    fn mismatched_embedding_dimension_is_rejected_without_writing() {
        let store = MemoryStore::new();
        store
            .insert_entity(&Entity::new("Ada", "person").with_embedding(vec![1.0, 0.0]))
            .unwrap();
        let bad = Entity::new("Grace", "person").with_embedding(vec![1.0, 0.0, 0.0]);
        assert!(matches!(
            store.insert_entity(&bad),
            Err(VerityError::InvalidEmbedding(_))
        ));
        assert!(matches!(store.entity(&bad.id), Err(VerityError::NotFound(_))));
    }
}
