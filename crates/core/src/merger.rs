//! Entity deduplication and attribute merging.
//!
//! Merged-away entities are never deleted. They become tombstones whose
//! `merged_into` points at the entity that absorbed them, and readers follow
//! that chain with [`EntityMerger::canonical_entity`].

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{EngineConfig, MatchingConfig};
use crate::matcher::{EntityMatch, EntityMatcher};
use crate::model::{Attributes, Entity, EntityId, MergeRecord, MergeStrategy};
use crate::store::GraphStore;
use crate::{Result, VerityError};

/// Combine two attribute maps under `strategy`.
///
/// | strategy | on conflict | keys kept |
/// |---|---|---|
/// | `prefer_existing` | existing | union |
/// | `prefer_new` | new | union |
/// | `union` | new | union |
/// | `intersection` | new | present in both |
pub fn merge_attributes(new: &Attributes, existing: &Attributes, strategy: MergeStrategy) -> Attributes {
    match strategy {
        MergeStrategy::PreferExisting => {
            let mut merged = new.clone();
            merged.extend(existing.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        }
        MergeStrategy::PreferNew | MergeStrategy::Union => {
            let mut merged = existing.clone();
            merged.extend(new.iter().map(|(k, v)| (k.clone(), v.clone())));
            merged
        }
        MergeStrategy::Intersection => new
            .iter()
            .filter(|(k, _)| existing.contains_key(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

/// `existing` with `new`'s attributes merged in and a merge-history entry
/// for `new` appended. The entry is appended even when nothing changed.
pub fn merge_entity_attributes(new: &Entity, existing: &Entity, strategy: MergeStrategy) -> Entity {
    let mut merged = existing.clone();
    merged.attributes = merge_attributes(&new.attributes, &existing.attributes, strategy);
    if merged.embedding.is_none() {
        merged.embedding = new.embedding.clone();
    }
    merged.merge_history.push(MergeRecord {
        merged_with: new.id.clone(),
        strategy,
        timestamp: Utc::now(),
    });
    merged
}

/// Outcome of [`EntityMerger::resolve_entity`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntityResolution {
    /// The stored entity: the updated match when merged, else the new insert.
    pub entity: Entity,
    /// Every candidate considered, best first.
    pub matches: Vec<EntityMatch>,
    pub merged: bool,
}

pub struct EntityMerger {
    store: Arc<dyn GraphStore>,
    matcher: EntityMatcher,
    matching: MatchingConfig,
    max_write_retries: u32,
    max_merge_chain_depth: usize,
}

impl EntityMerger {
    pub fn new(store: Arc<dyn GraphStore>, matcher: EntityMatcher, config: &EngineConfig) -> Self {
        Self {
            store,
            matcher,
            matching: config.matching.clone(),
            max_write_retries: config.max_write_retries,
            max_merge_chain_depth: config.max_merge_chain_depth,
        }
    }

    pub fn matcher(&self) -> &EntityMatcher {
        &self.matcher
    }

    /// [`resolve_entity`](Self::resolve_entity) with the configured
    /// thresholds and strategy.
    pub fn resolve(&self, new_entity: &Entity) -> Result<EntityResolution> {
        self.resolve_entity(
            new_entity,
            self.matching.min_confidence,
            self.matching.merge_strategy,
            self.matching.auto_merge,
        )
    }

    /// Merge `new_entity` into its best stored match, or insert it.
    ///
    /// The best candidate is merged into only when its confidence reaches
    /// `min_confidence` and `auto_merge` is set.
    pub fn resolve_entity(
        &self,
        new_entity: &Entity,
        min_confidence: f64,
        merge_strategy: MergeStrategy,
        auto_merge: bool,
    ) -> Result<EntityResolution> {
        let matches = self.matcher.find_candidates(new_entity)?;

        let best = matches
            .first()
            .filter(|m| auto_merge && m.confidence >= min_confidence);
        if let Some(best) = best {
            let target = best.entity.id.clone();
            let entity = self.absorb(new_entity, &target, merge_strategy)?;
            info!(
                name = %new_entity.name,
                target = %entity.id,
                confidence = best.confidence,
                strategy = %merge_strategy,
                "merged entity into existing match"
            );
            return Ok(EntityResolution {
                entity,
                matches,
                merged: true,
            });
        }

        let mut doc = new_entity.clone();
        if doc.embedding.is_none() {
            doc.embedding = self.matcher.query_embedding(new_entity)?;
        }
        let entity = self.store.insert_entity(&doc)?;
        debug!(
            name = %entity.name,
            id = %entity.id,
            candidates = matches.len(),
            "inserted new entity"
        );
        Ok(EntityResolution {
            entity,
            matches,
            merged: false,
        })
    }

    /// Fold `new_entity`'s attributes into the live entity `target` resolves
    /// to, retrying on revision conflicts.
    fn absorb(&self, new_entity: &Entity, target: &EntityId, strategy: MergeStrategy) -> Result<Entity> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let current = self.canonical_entity(target)?;
            let merged = merge_entity_attributes(new_entity, &current, strategy);
            match self.store.replace_entity(&merged) {
                Err(VerityError::Conflict(msg)) if attempts <= self.max_write_retries => {
                    debug!(attempt = attempts, %msg, "revision conflict while merging, retrying");
                }
                other => return other,
            }
        }
    }

    /// Merge the stored entity `source` into `target`.
    ///
    /// `target` receives `source`'s attributes and a merge-history entry;
    /// `source` becomes a tombstone pointing at `target`. Both writes land in
    /// one batch. Returns the updated target.
    pub fn merge_entities(
        &self,
        source: &EntityId,
        target: &EntityId,
        strategy: MergeStrategy,
    ) -> Result<Entity> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let from = self.store.entity(source)?;
            if let Some(into) = &from.merged_into {
                return Err(VerityError::Validation(format!(
                    "entity {source} was already merged into {into}"
                )));
            }
            let into = self.canonical_entity(target)?;
            if into.id == from.id {
                return Err(VerityError::Validation(format!(
                    "cannot merge entity {source} into itself"
                )));
            }

            let updated = merge_entity_attributes(&from, &into, strategy);
            let mut tombstone = from;
            tombstone.merged_into = Some(into.id.clone());

            match self.store.replace_entities(&[updated, tombstone]) {
                Ok(written) => {
                    info!(%source, target = %into.id, %strategy, "merged entities");
                    return written.into_iter().next().ok_or_else(|| {
                        VerityError::Internal("replace returned no document".into())
                    });
                }
                Err(VerityError::Conflict(msg)) if attempts <= self.max_write_retries => {
                    debug!(attempt = attempts, %msg, "revision conflict while merging, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The live entity `id` resolves to after following `merged_into`.
    ///
    /// # Errors
    ///
    /// [`VerityError::Internal`] if the chain loops or is longer than
    /// `max_merge_chain_depth`.
    pub fn canonical_entity(&self, id: &EntityId) -> Result<Entity> {
        canonical_entity(self.store.as_ref(), id, self.max_merge_chain_depth)
    }
}

/// Follow `merged_into` from `id` to the live entity at the end of the chain.
pub fn canonical_entity(store: &dyn GraphStore, id: &EntityId, max_depth: usize) -> Result<Entity> {
    let mut current = store.entity(id)?;
    let mut seen = HashSet::new();
    seen.insert(current.id.clone());
    while let Some(next) = current.merged_into.clone() {
        if !seen.insert(next.clone()) {
            return Err(VerityError::Internal(format!(
                "merge chain from {id} loops at {next}"
            )));
        }
        if seen.len() > max_depth + 1 {
            return Err(VerityError::Internal(format!(
                "merge chain from {id} is longer than {max_depth}"
            )));
        }
        current = store.entity(&next)?;
    }
    Ok(current)
}
