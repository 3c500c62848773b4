//! Duplicate-entity detection.
//!
//! Two lookups, tried in order by [`EntityMatcher::find_candidates`]:
//!
//! 1. **Exact**: the stored entity's normalized name equals one of the
//!    query's name variants. Confidence is always 1.0.
//! 2. **Similarity**: nearest neighbours of the query's embedding through the
//!    store's [`AnnSearch`] backend. Confidence is the cosine score.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::config::MatchingConfig;
use crate::model::Entity;
use crate::normalize::{attribute_overlap, name_variants, normalize_name, token_overlap};
use crate::store::{EntityQuery, GraphStore};
use crate::vector::{cosine, select_ann, AnnSearch};
use crate::{Result, VerityError};

const NAME_EXACT_WEIGHT: f64 = 3.0;
const NAME_OVERLAP_WEIGHT: f64 = 2.0;
const TYPE_WEIGHT: f64 = 1.5;
const ATTRIBUTE_WEIGHT: f64 = 1.0;
const EMBEDDING_WEIGHT: f64 = 2.0;

/// Text-to-vector capability used when an entity arrives without an
/// embedding.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Similarity,
}

/// A stored entity that may be a duplicate of the query.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMatch {
    pub entity: Entity,
    pub confidence: f64,
    pub method: MatchMethod,
}

pub struct EntityMatcher {
    store: Arc<dyn GraphStore>,
    ann: Box<dyn AnnSearch>,
    embedder: Option<Arc<dyn Embedder>>,
    config: MatchingConfig,
}

impl EntityMatcher {
    pub fn new(store: Arc<dyn GraphStore>, config: &MatchingConfig) -> Self {
        Self {
            ann: select_ann(store.clone()),
            store,
            embedder: None,
            config: config.clone(),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn ann_backend(&self) -> &'static str {
        self.ann.backend()
    }

    /// Can a similarity lookup run for `entity`?
    pub fn can_embed(&self, entity: &Entity) -> bool {
        entity.embedding.is_some() || self.embedder.is_some()
    }

    /// The entity's own embedding, or one generated from its name.
    pub fn query_embedding(&self, entity: &Entity) -> Result<Option<Vec<f32>>> {
        if let Some(embedding) = &entity.embedding {
            return Ok(Some(embedding.clone()));
        }
        match &self.embedder {
            Some(embedder) => embedder.embed(&entity.name).map(Some),
            None => Ok(None),
        }
    }

    /// Live stored entities whose normalized name equals a variant of
    /// `entity`'s name.
    pub fn find_exact_matches(&self, entity: &Entity, use_variants: bool) -> Result<Vec<EntityMatch>> {
        let variants = if use_variants {
            name_variants(&entity.name)
        } else {
            vec![normalize_name(&entity.name)]
        };
        if variants.iter().all(|v| v.is_empty()) {
            return Ok(Vec::new());
        }

        let matches: Vec<EntityMatch> = self
            .store
            .query_entities(&EntityQuery::live())?
            .into_iter()
            .filter(|candidate| candidate.id != entity.id)
            .filter(|candidate| variants.contains(&normalize_name(&candidate.name)))
            .map(|candidate| EntityMatch {
                entity: candidate,
                confidence: 1.0,
                method: MatchMethod::Exact,
            })
            .collect();
        debug!(name = %entity.name, count = matches.len(), "exact matches");
        Ok(matches)
    }

    /// Live stored entities whose embedding is at least `min_similarity`
    /// cosine-similar to `entity`'s, best first, at most `max_results`.
    ///
    /// # Errors
    ///
    /// [`VerityError::Validation`] if `entity` has no embedding and no
    /// embedder is configured.
    pub fn find_similar_matches(
        &self,
        entity: &Entity,
        min_similarity: f64,
        max_results: usize,
    ) -> Result<Vec<EntityMatch>> {
        let embedding = self.query_embedding(entity)?.ok_or_else(|| {
            VerityError::Validation(format!(
                "entity `{}` has no embedding and no embedder is configured",
                entity.name
            ))
        })?;
        if max_results == 0 {
            return Ok(Vec::new());
        }

        // One extra in case the query entity itself is stored.
        let hits = self
            .ann
            .search(&embedding, max_results + 1, min_similarity as f32)?;

        let mut matches = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            if id == entity.id {
                continue;
            }
            let candidate = match self.store.entity(&id) {
                Ok(e) => e,
                Err(VerityError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if candidate.is_tombstone() {
                continue;
            }
            matches.push(EntityMatch {
                entity: candidate,
                confidence: f64::from(score),
                method: MatchMethod::Similarity,
            });
        }
        matches.truncate(max_results);
        debug!(
            name = %entity.name,
            backend = self.ann.backend(),
            count = matches.len(),
            "similarity matches"
        );
        Ok(matches)
    }

    /// Exact matches, or similarity matches when there are none and an
    /// embedding is available. Sorted by confidence, best first.
    pub fn find_candidates(&self, entity: &Entity) -> Result<Vec<EntityMatch>> {
        let mut candidates = self.find_exact_matches(entity, self.config.use_variants)?;
        if candidates.is_empty() && self.can_embed(entity) {
            candidates = self.find_similar_matches(
                entity,
                self.config.min_similarity,
                self.config.max_results,
            )?;
        }
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        Ok(candidates)
    }
}

/// Weighted blend of every signal `a` and `b` both carry, in `[0, 1]`.
///
/// | signal | weight |
/// |---|---|
/// | identical normalized name | 3.0 |
/// | otherwise name token overlap | 2.0 |
/// | same type (case-insensitive) | 1.5 |
/// | attribute key/value overlap | 1.0 |
/// | embedding cosine, clamped to `[0, 1]` | 2.0 |
///
/// Signals missing on either side are left out of both the sum and the
/// total weight. Returns 0.0 when nothing is comparable.
pub fn calculate_match_confidence(a: &Entity, b: &Entity) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;
    let mut add = |score: f64, weight: f64| {
        weighted += score * weight;
        total += weight;
    };

    let (name_a, name_b) = (normalize_name(&a.name), normalize_name(&b.name));
    if !name_a.is_empty() && !name_b.is_empty() {
        if name_a == name_b {
            add(1.0, NAME_EXACT_WEIGHT);
        } else {
            add(token_overlap(&a.name, &b.name), NAME_OVERLAP_WEIGHT);
        }
    }

    if !a.entity_type.is_empty() && !b.entity_type.is_empty() {
        let same = a.entity_type.eq_ignore_ascii_case(&b.entity_type);
        add(if same { 1.0 } else { 0.0 }, TYPE_WEIGHT);
    }

    if let Some(overlap) = attribute_overlap(&a.attributes, &b.attributes) {
        add(overlap, ATTRIBUTE_WEIGHT);
    }

    if let (Some(ea), Some(eb)) = (a.embedding.as_deref(), b.embedding.as_deref()) {
        if let Some(sim) = cosine(ea, eb) {
            add(f64::from(sim).clamp(0.0, 1.0), EMBEDDING_WEIGHT);
        }
    }

    if total == 0.0 {
        0.0
    } else {
        weighted / total
    }
}
