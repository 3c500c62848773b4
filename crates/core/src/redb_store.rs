//! Persistent [`GraphStore`] on top of redb.
//!
//! Each configured collection is one redb table of JSON documents keyed by
//! document id; the audit table is keyed by an increasing sequence number.
//! Revision checks and the writes they guard share one write transaction, so
//! a failed check rolls the whole batch back.
//!
//! The store has no vector operator; similarity search goes through
//! [`BruteForceAnn`](crate::vector::BruteForceAnn).

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::audit::ContradictionRecord;
use crate::config::EngineConfig;
use crate::model::{Entity, EntityId, Relationship, RelationshipId};
use crate::store::{
    check_revision, sort_entities, sort_relationships, EntityQuery, GraphStore, RelationshipQuery,
};
use crate::{Result, VerityError};

type DocTable<'a> = TableDefinition<'a, &'static str, &'static str>;
type AuditTable<'a> = TableDefinition<'a, u64, &'static str>;

pub struct RedbStore {
    db: Database,
    entity_table: String,
    relationship_table: String,
    audit_table: String,
}

impl RedbStore {
    /// Open or create a store file at `path`.
    pub fn open(path: &str, config: &EngineConfig) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db, config)
    }

    /// Create a store with no file I/O. Data is lost on drop.
    pub fn open_in_memory(config: &EngineConfig) -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db, config)
    }

    fn init(db: Database, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = Self {
            db,
            entity_table: config.entity_collection.clone(),
            relationship_table: config.relationship_collection.clone(),
            audit_table: config.audit_collection.clone(),
        };
        {
            let write_txn = store.db.begin_write()?;
            write_txn.open_table(store.entities())?;
            write_txn.open_table(store.relationships())?;
            write_txn.open_table(store.audit())?;
            write_txn.commit()?;
        }
        debug!(
            entities = %store.entity_table,
            relationships = %store.relationship_table,
            audit = %store.audit_table,
            "opened redb store"
        );
        Ok(store)
    }

    fn entities(&self) -> DocTable<'_> {
        TableDefinition::new(&self.entity_table)
    }

    fn relationships(&self) -> DocTable<'_> {
        TableDefinition::new(&self.relationship_table)
    }

    fn audit(&self) -> AuditTable<'_> {
        TableDefinition::new(&self.audit_table)
    }

    /// Run `f` in a write transaction, committing on success and aborting on
    /// error.
    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let write_txn = self.db.begin_write()?;
        match f(&write_txn) {
            Ok(value) => {
                write_txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                write_txn.abort()?;
                Err(e)
            }
        }
    }

    fn get_doc<T: DeserializeOwned>(&self, table: DocTable<'_>, id: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let doc = match table.get(id)? {
            Some(guard) => Some(serde_json::from_str(guard.value())?),
            None => None,
        };
        Ok(doc)
    }

    fn scan_docs<T: DeserializeOwned>(
        &self,
        table: DocTable<'_>,
        keep: impl Fn(&T) -> bool,
    ) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let mut docs = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let doc: T = serde_json::from_str(v.value())?;
            if keep(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }
}

/// Insert `value` under `id` unless the key is already taken.
fn insert_new(
    write_txn: &WriteTransaction,
    table: DocTable<'_>,
    id: &str,
    value: &str,
    kind: &str,
) -> Result<()> {
    let mut table = write_txn.open_table(table)?;
    if table.get(id)?.is_some() {
        return Err(VerityError::Conflict(format!("{kind} {id} already exists")));
    }
    table.insert(id, value)?;
    Ok(())
}

impl GraphStore for RedbStore {
    fn insert_entity(&self, entity: &Entity) -> Result<Entity> {
        let mut stored = entity.clone();
        stored.revision = 1;
        let value = serde_json::to_string(&stored)?;
        self.write(|txn| insert_new(txn, self.entities(), stored.id.as_str(), &value, "entity"))?;
        Ok(stored)
    }

    fn entity(&self, id: &EntityId) -> Result<Entity> {
        self.get_doc(self.entities(), id.as_str())?
            .ok_or_else(|| VerityError::NotFound(format!("entity {id}")))
    }

    fn replace_entities(&self, entities: &[Entity]) -> Result<Vec<Entity>> {
        self.write(|txn| {
            let mut table = txn.open_table(self.entities())?;
            let mut updated = Vec::with_capacity(entities.len());
            for entity in entities {
                let current: Entity = match table.get(entity.id.as_str())? {
                    Some(guard) => serde_json::from_str(guard.value())?,
                    None => return Err(VerityError::NotFound(format!("entity {}", entity.id))),
                };
                check_revision("entity", entity.id.as_str(), current.revision, entity.revision)?;
                let mut next = entity.clone();
                next.revision = current.revision + 1;
                let value = serde_json::to_string(&next)?;
                table.insert(next.id.as_str(), value.as_str())?;
                updated.push(next);
            }
            Ok(updated)
        })
    }

    fn query_entities(&self, query: &EntityQuery) -> Result<Vec<Entity>> {
        let mut entities = self.scan_docs(self.entities(), |e: &Entity| query.matches(e))?;
        sort_entities(&mut entities);
        Ok(entities)
    }

    fn insert_relationship(&self, relationship: &Relationship) -> Result<Relationship> {
        let mut stored = relationship.clone();
        stored.revision = 1;
        let value = serde_json::to_string(&stored)?;
        self.write(|txn| {
            insert_new(
                txn,
                self.relationships(),
                stored.id.as_str(),
                &value,
                "relationship",
            )
        })?;
        Ok(stored)
    }

    fn relationship(&self, id: &RelationshipId) -> Result<Relationship> {
        self.get_doc(self.relationships(), id.as_str())?
            .ok_or_else(|| VerityError::NotFound(format!("relationship {id}")))
    }

    fn replace_relationships(&self, relationships: &[Relationship]) -> Result<Vec<Relationship>> {
        self.write(|txn| {
            let mut table = txn.open_table(self.relationships())?;
            let mut updated = Vec::with_capacity(relationships.len());
            for rel in relationships {
                let current: Relationship = match table.get(rel.id.as_str())? {
                    Some(guard) => serde_json::from_str(guard.value())?,
                    None => {
                        return Err(VerityError::NotFound(format!("relationship {}", rel.id)))
                    }
                };
                check_revision("relationship", rel.id.as_str(), current.revision, rel.revision)?;
                let mut next = rel.clone();
                next.revision = current.revision + 1;
                let value = serde_json::to_string(&next)?;
                table.insert(next.id.as_str(), value.as_str())?;
                updated.push(next);
            }
            Ok(updated)
        })
    }

    fn query_relationships(&self, query: &RelationshipQuery) -> Result<Vec<Relationship>> {
        let mut rels = self.scan_docs(self.relationships(), |r: &Relationship| query.matches(r))?;
        sort_relationships(&mut rels);
        Ok(rels)
    }

    fn append_audit(&self, record: &ContradictionRecord) -> Result<()> {
        let value = serde_json::to_string(record)?;
        self.write(|txn| {
            let mut table = txn.open_table(self.audit())?;
            let next = match table.last()? {
                Some((k, _)) => k.value() + 1,
                None => 0,
            };
            table.insert(next, value.as_str())?;
            Ok(())
        })
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<ContradictionRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.audit())?;
        let mut records = Vec::new();
        for entry in table.iter()?.rev().take(limit) {
            let (_k, v) = entry?;
            records.push(serde_json::from_str(v.value())?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attributes, RelationshipId};
    use chrono::{DateTime, Utc};
    use redb::ReadableTableMetadata;
    use tempfile::NamedTempFile;

    fn open_temp_store() -> (RedbStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let store = RedbStore::open(&path, &EngineConfig::default()).unwrap();
        (store, file)
    }

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn edge(valid_at: &str) -> Relationship {
        Relationship {
            id: RelationshipId::new(),
            from_id: "alice".into(),
            to_id: "acme".into(),
            rel_type: "works_at".into(),
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
    fn documents_survive_reopen() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let config = EngineConfig::default();

        let (entity, rel) = {
            let store = RedbStore::open(&path, &config).unwrap();
            let entity = store.insert_entity(&Entity::new("Alice", "person")).unwrap();
            let rel = store.insert_relationship(&edge("2024-01-01T00:00:00Z")).unwrap();
            (entity, rel)
        };

        let store = RedbStore::open(&path, &config).unwrap();
        assert_eq!(store.entity(&entity.id).unwrap(), entity);
        assert_eq!(store.relationship(&rel.id).unwrap(), rel);
    }

    #[test]
    fn stale_relationship_batch_rolls_back() {
        let (store, _tmp) = open_temp_store();
        let a = store.insert_relationship(&edge("2024-01-01T00:00:00Z")).unwrap();
        let b = store.insert_relationship(&edge("2024-02-01T00:00:00Z")).unwrap();

        let mut a_closed = a.clone();
        a_closed.invalid_at = Some(dt("2024-02-01T00:00:00Z"));
        let mut b_stale = b.clone();
        b_stale.revision = 0;

        let err = store.replace_relationships(&[a_closed.clone(), b_stale]).unwrap_err();
        assert!(matches!(err, VerityError::Conflict(_)), "got {err:?}");
        assert!(store.relationship(&a.id).unwrap().is_current());

        let written = store.replace_relationships(&[a_closed]).unwrap();
        assert_eq!(written[0].revision, 2);
        assert!(!store.relationship(&a.id).unwrap().is_current());
    }

    #[test]
    fn duplicate_ids_conflict() {
        let (store, _tmp) = open_temp_store();
        let entity = Entity::new("Alice", "person");
        store.insert_entity(&entity).unwrap();
        assert!(matches!(
            store.insert_entity(&entity),
            Err(VerityError::Conflict(_))
        ));
    }

    #[test]
    fn missing_documents_are_not_found() {
        let store = RedbStore::open_in_memory(&EngineConfig::default()).unwrap();
        assert!(matches!(
            store.entity(&EntityId::from("nope")),
            Err(VerityError::NotFound(_))
        ));
        assert!(matches!(
            store.replace_relationships(&[edge("2024-01-01T00:00:00Z")]),
            Err(VerityError::NotFound(_))
        ));
    }

    #[test]
    fn custom_collection_names_are_used() {
        let config = EngineConfig {
            entity_collection: "nodes".into(),
            relationship_collection: "edges".into(),
            audit_collection: "audit".into(),
            ..EngineConfig::default()
        };
        let store = RedbStore::open_in_memory(&config).unwrap();
        store.insert_entity(&Entity::new("Alice", "person")).unwrap();

        let read_txn = store.db.begin_read().unwrap();
        let nodes: DocTable<'_> = TableDefinition::new("nodes");
        assert_eq!(read_txn.open_table(nodes).unwrap().len().unwrap(), 1);
    }

    #[test]
    fn queries_return_transaction_time_order() {
        let (store, _tmp) = open_temp_store();
        let mut later = edge("2024-01-01T00:00:00Z");
        later.created_at = dt("2024-03-01T00:00:00Z");
        let mut earlier = edge("2024-01-01T00:00:00Z");
        earlier.created_at = dt("2024-02-01T00:00:00Z");
        store.insert_relationship(&later).unwrap();
        store.insert_relationship(&earlier).unwrap();

        let rels = store
            .query_relationships(&RelationshipQuery::between("alice", "acme"))
            .unwrap();
        assert_eq!(rels.len(), 2);
        assert_eq!(rels[0].id, earlier.id);
        assert_eq!(rels[1].id, later.id);
    }

    #[test]
    fn no_native_vector_search() {
        let (store, _tmp) = open_temp_store();
        assert!(!store.supports_vector_search());
        assert!(matches!(
            store.vector_search(&[1.0], 1, 0.0),
            Err(VerityError::Unsupported(_))
        ));
    }
}
