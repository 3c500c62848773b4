//! Embedding similarity search over entities.
//!
//! Two ways to answer "which entities are closest to this vector":
//!
//! - [`NativeAnn`] delegates to the store's own nearest-neighbour operator
//!   ([`GraphStore::vector_search`]). [`MemoryStore`] backs that operator with
//!   the flat [`VectorIndex`] below.
//! - [`BruteForceAnn`] pulls every live entity that has an embedding and
//!   scores it locally.
//!
//! [`select_ann`] probes the store once and picks one. Both honour the same
//! contract: `(id, cosine)` pairs with `cosine >= threshold`, sorted by score
//! descending (ties by id ascending), at most `k` of them. A query whose
//! dimension differs from the stored embeddings is an
//! [`VerityError::InvalidEmbedding`] error on both paths.
//!
//! # Complexity
//! - `VectorIndex::insert`: O(n) replace-or-append
//! - `VectorIndex::search` and `BruteForceAnn::search`: O(n·d)
//!
//! [`MemoryStore`]: crate::store::MemoryStore

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::model::EntityId;
use crate::store::{EntityQuery, GraphStore};
use crate::{Result, VerityError};

#[derive(Debug, Clone)]
struct Entry {
    id: EntityId,
    embedding: Vec<f32>,
}

/// Flat in-memory vector index keyed by [`EntityId`].
#[derive(Debug, Default, Clone)]
pub struct VectorIndex {
    entries: Vec<Entry>,
    /// Set on first insert; later inserts and queries are validated against it.
    dim: Option<usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the embedding for `id`.
    ///
    /// # Errors
    ///
    /// [`VerityError::InvalidEmbedding`] if `embedding` is empty or its
    /// dimension differs from the first embedding ever inserted.
    pub fn insert(&mut self, id: EntityId, embedding: Vec<f32>) -> Result<()> {
        if embedding.is_empty() {
            return Err(VerityError::InvalidEmbedding(
                "embedding must not be empty".into(),
            ));
        }
        match self.dim {
            None => self.dim = Some(embedding.len()),
            Some(d) if d != embedding.len() => {
                return Err(VerityError::InvalidEmbedding(format!(
                    "embedding dimension mismatch: expected {d}, got {}",
                    embedding.len()
                )));
            }
            Some(_) => {}
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.embedding = embedding;
        } else {
            self.entries.push(Entry { id, embedding });
        }
        Ok(())
    }

    /// Remove the entry for `id`. No-op if `id` is not present.
    ///
    /// Called when an entity is tombstoned, so merged-away entities never
    /// surface as similarity candidates.
    pub fn remove(&mut self, id: &EntityId) {
        if let Some(pos) = self.entries.iter().position(|e| &e.id == id) {
            self.entries.swap_remove(pos);
        }
    }

    /// Top-`k` entries whose cosine similarity to `query` is at least
    /// `threshold`.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(EntityId, f32)>> {
        check_query(query)?;
        if let Some(d) = self.dim {
            if query.len() != d {
                return Err(VerityError::InvalidEmbedding(format!(
                    "query dimension mismatch: index has dim {d}, query has {}",
                    query.len()
                )));
            }
        }
        let query_norm = l2_norm(query);
        if k == 0 || query_norm == 0.0 {
            return Ok(Vec::new());
        }

        let scored = self
            .entries
            .iter()
            .map(|e| (e.id.clone(), cosine_similarity(query, &e.embedding, query_norm)))
            .collect();
        Ok(rank(scored, k, threshold))
    }

    pub(crate) fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ANN capability
// ---------------------------------------------------------------------------

/// Approximate-nearest-neighbour lookup over entity embeddings.
pub trait AnnSearch: Send + Sync {
    fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(EntityId, f32)>>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Uses the store's native vector operator.
pub struct NativeAnn {
    store: Arc<dyn GraphStore>,
}

impl NativeAnn {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

impl AnnSearch for NativeAnn {
    fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(EntityId, f32)>> {
        self.store.vector_search(query, k, threshold)
    }

    fn backend(&self) -> &'static str {
        "native"
    }
}

/// Scores every live entity with an embedding locally.
pub struct BruteForceAnn {
    store: Arc<dyn GraphStore>,
}

impl BruteForceAnn {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

impl AnnSearch for BruteForceAnn {
    fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<(EntityId, f32)>> {
        check_query(query)?;
        let candidates = self
            .store
            .query_entities(&EntityQuery::live().with_embedding_only())?;

        let query_norm = l2_norm(query);
        let mut scored = Vec::with_capacity(candidates.len());
        for entity in candidates {
            let Some(embedding) = entity.embedding.as_deref() else {
                continue;
            };
            if embedding.len() != query.len() {
                return Err(VerityError::InvalidEmbedding(format!(
                    "query dimension mismatch: entity {} has dim {}, query has {}",
                    entity.id,
                    embedding.len(),
                    query.len()
                )));
            }
            if query_norm > 0.0 {
                scored.push((entity.id, cosine_similarity(query, embedding, query_norm)));
            }
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        Ok(rank(scored, k, threshold))
    }

    fn backend(&self) -> &'static str {
        "brute_force"
    }
}

/// Pick the ANN implementation for `store`: native when the store advertises
/// a vector operator, brute force otherwise.
pub fn select_ann(store: Arc<dyn GraphStore>) -> Box<dyn AnnSearch> {
    let ann: Box<dyn AnnSearch> = if store.supports_vector_search() {
        Box::new(NativeAnn::new(store))
    } else {
        Box::new(BruteForceAnn::new(store))
    };
    debug!(backend = ann.backend(), "selected similarity search backend");
    ann
}

// ---------------------------------------------------------------------------
// Math helpers
// ---------------------------------------------------------------------------

fn check_query(query: &[f32]) -> Result<()> {
    if query.is_empty() {
        return Err(VerityError::InvalidEmbedding(
            "query embedding must not be empty".into(),
        ));
    }
    Ok(())
}

/// Filter by `threshold`, sort by score descending then id, keep `k`.
fn rank(mut scored: Vec<(EntityId, f32)>, k: usize, threshold: f32) -> Vec<(EntityId, f32)> {
    scored.retain(|(_, score)| *score >= threshold);
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(k);
    scored
}

/// Euclidean (L2) norm of `v`.
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between `a` and `b`, with `a_norm` pre-computed by the
/// caller. Returns `0.0` if the dimensions differ or `b` is the zero vector.
fn cosine_similarity(a: &[f32], b: &[f32], a_norm: f32) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let b_norm = l2_norm(b);
    if b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

/// Cosine similarity in `[-1, 1]`, or `None` when it is undefined (empty or
/// zero vectors, mismatched dimensions).
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let a_norm = l2_norm(a);
    if a_norm == 0.0 || l2_norm(b) == 0.0 {
        return None;
    }
    Some(cosine_similarity(a, b, a_norm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entity;
    use crate::store::MemoryStore;

    fn new_id() -> EntityId {
        EntityId::new()
    }

    fn make_ids(n: usize) -> Vec<EntityId> {
        (0..n).map(|_| new_id()).collect()
    }

    #[test]
    fn test_l2_norm_unit_vector() {
        assert!((l2_norm(&[1.0, 0.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![1.0f32, 2.0, 3.0];
        assert!((cosine(&v, &v).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite_vectors() {
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_undefined_cases() {
        assert_eq!(cosine(&[1.0, 2.0], &[0.0, 0.0]), None);
        assert_eq!(cosine(&[1.0, 2.0], &[1.0, 2.0, 3.0]), None);
        assert_eq!(cosine(&[], &[]), None);
    }

    #[test]
    fn test_insert_replaces_existing_id() {
        let mut idx = VectorIndex::new();
        let id = new_id();
        idx.insert(id.clone(), vec![1.0, 0.0, 0.0]).unwrap();
        idx.insert(id, vec![0.0, 1.0, 0.0]).unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_insert_rejects_empty_and_mismatched() {
        let mut idx = VectorIndex::new();
        assert!(matches!(
            idx.insert(new_id(), vec![]),
            Err(VerityError::InvalidEmbedding(_))
        ));
        idx.insert(new_id(), vec![1.0, 0.0]).unwrap();
        assert!(matches!(
            idx.insert(new_id(), vec![1.0, 0.0, 0.0]),
            Err(VerityError::InvalidEmbedding(_))
        ));
        assert_eq!(idx.dim(), Some(2));
    }

    #[test]
    fn test_remove_existing_and_missing() {
        let mut idx = VectorIndex::new();
        let id = new_id();
        idx.insert(id.clone(), vec![1.0, 0.0]).unwrap();
        idx.remove(&new_id());
        assert_eq!(idx.len(), 1);
        idx.remove(&id);
        assert!(idx.is_empty());
    }

    #[test]
    fn test_search_orders_filters_and_truncates() {
        let mut idx = VectorIndex::new();
        let ids = make_ids(3);
        idx.insert(ids[0].clone(), vec![1.0, 0.0, 0.0]).unwrap();
        idx.insert(ids[1].clone(), vec![0.6, 0.8, 0.0]).unwrap();
        idx.insert(ids[2].clone(), vec![-1.0, 0.0, 0.0]).unwrap();

        let all = idx.search(&[1.0, 0.0, 0.0], 10, -1.0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, ids[0]);
        assert_eq!(all[1].0, ids[1]);
        assert_eq!(all[2].0, ids[2]);

        let above = idx.search(&[1.0, 0.0, 0.0], 10, 0.5).unwrap();
        assert_eq!(above.len(), 2, "the opposite vector falls below threshold");

        let top1 = idx.search(&[1.0, 0.0, 0.0], 1, 0.0).unwrap();
        assert_eq!(top1.len(), 1);
        assert!((top1[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_search_rejects_wrong_query_dim() {
        let mut idx = VectorIndex::new();
        idx.insert(new_id(), vec![1.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            idx.search(&[1.0, 0.0], 5, 0.0),
            Err(VerityError::InvalidEmbedding(_))
        ));
    }

    #[test]
    fn test_search_zero_query_returns_empty() {
        let mut idx = VectorIndex::new();
        idx.insert(new_id(), vec![1.0, 0.0]).unwrap();
        assert!(idx.search(&[0.0, 0.0], 5, 0.0).unwrap().is_empty());
    }

    #[test]
    fn native_and_brute_force_agree() {
        let store: Arc<dyn GraphStore> = Arc::new(MemoryStore::new());
        let vectors = [
            vec![1.0f32, 0.0, 0.0],
            vec![0.9, 0.1, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.7, 0.7, 0.1],
        ];
        for (i, v) in vectors.iter().enumerate() {
            store
                .insert_entity(&Entity::new(format!("e{i}"), "thing").with_embedding(v.clone()))
                .unwrap();
        }

        let native = NativeAnn::new(store.clone());
        let brute = BruteForceAnn::new(store.clone());
        let query = [1.0f32, 0.05, 0.0];
        let a = native.search(&query, 3, 0.5).unwrap();
        let b = brute.search(&query, 3, 0.5).unwrap();

        assert_eq!(a.len(), b.len());
        for ((id_a, score_a), (id_b, score_b)) in a.iter().zip(b.iter()) {
            assert_eq!(id_a, id_b);
            assert!((score_a - score_b).abs() < 1e-6);
        }
        assert!(a.windows(2).all(|w| w[0].1 >= w[1].1), "sorted descending");
        assert!(a.iter().all(|(_, s)| *s >= 0.5));
    }

    #[test]
    fn select_ann_probes_the_store() {
        let memory: Arc<dyn GraphStore> = Arc::new(MemoryStore::new());
        assert_eq!(select_ann(memory).backend(), "native");

        let redb: Arc<dyn GraphStore> = Arc::new(
            crate::redb_store::RedbStore::open_in_memory(&crate::EngineConfig::default()).unwrap(),
        );
        assert_eq!(select_ann(redb).backend(), "brute_force");
    }
}
