use chrono::{DateTime, Utc};
use std::sync::Arc;
use tempfile::NamedTempFile;
use verity::{
    calculate_match_confidence, merge_entity_attributes, ContradictionResolver, EngineConfig,
    Entity, EntityMatcher, EntityMerger, GraphStore, MemoryStore, MergeStrategy, NewRelationship,
    RedbStore, Relationship, ResolutionStrategy, TemporalEnhancer, TimeInput,
};

fn dt(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

/// Both store implementations; the temp file keeps the redb store's file alive.
fn stores() -> Vec<(Arc<dyn GraphStore>, Option<NamedTempFile>)> {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap().to_string();
    let redb = RedbStore::open(&path, &EngineConfig::default()).unwrap();
    vec![
        (Arc::new(MemoryStore::new()), None),
        (Arc::new(redb), Some(file)),
    ]
}

fn insert_edge(
    store: &Arc<dyn GraphStore>,
    valid_at: &str,
    invalid_at: Option<&str>,
    created_at: &str,
) -> Relationship {
    let edge = TemporalEnhancer::new()
        .enhance_at(
            NewRelationship::new("alice", "acme", "works_at"),
            Some(TimeInput::from(valid_at)),
            invalid_at.map(TimeInput::from),
            dt(created_at),
        )
        .unwrap();
    store.insert_relationship(&edge).unwrap()
}

#[test]
fn newest_wins_closes_the_older_edge_where_the_newer_begins() {
    for (store, _tmp) in stores() {
        let e1 = insert_edge(
            &store,
            "2024-01-01T00:00:00Z",
            Some("2024-03-01T00:00:00Z"),
            "2024-01-01T00:00:00Z",
        );
        let e2 = insert_edge(&store, "2024-02-01T00:00:00Z", None, "2024-02-15T00:00:00Z");

        let resolver = ContradictionResolver::new(store.clone(), &EngineConfig::default());
        let result = resolver.resolve_all(&e2, ResolutionStrategy::NewestWins).unwrap();
        assert!(result.success);
        assert_eq!(result.outcomes.len(), 1);

        let e1 = store.relationship(&e1.id).unwrap();
        assert_eq!(e1.invalid_at, Some(dt("2024-02-01T00:00:00Z")));
        assert_eq!(e1.invalidated_by, Some(e2.id.clone()));
        assert!(store.relationship(&e2.id).unwrap().invalid_at.is_none());
    }
}

#[test]
fn split_timeline_keeps_both_periods() {
    for (store, _tmp) in stores() {
        let later_start = insert_edge(&store, "2024-05-01T00:00:00Z", None, "2024-01-01T00:00:00Z");
        let earlier_start =
            insert_edge(&store, "2024-01-01T00:00:00Z", None, "2024-06-01T00:00:00Z");

        let resolver = ContradictionResolver::new(store.clone(), &EngineConfig::default());
        let result = resolver
            .resolve_all(&earlier_start, ResolutionStrategy::SplitTimeline)
            .unwrap();
        assert!(result.success);

        let earlier = store.relationship(&earlier_start.id).unwrap();
        let later = store.relationship(&later_start.id).unwrap();
        assert_eq!(earlier.invalid_at, Some(dt("2024-05-01T00:00:00Z")));
        assert_eq!(earlier.invalidation_reason.as_deref(), Some("timeline_split"));
        assert!(later.is_current());
    }
}

#[test]
fn differently_cased_names_match_exactly() {
    for (store, _tmp) in stores() {
        let john = store.insert_entity(&Entity::new("John Smith", "person")).unwrap();
        let matcher = EntityMatcher::new(store.clone(), &EngineConfig::default().matching);

        let found = matcher
            .find_exact_matches(&Entity::new("JOHN SMITH", "person"), true)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity.id, john.id);
        assert_eq!(found[0].confidence, 1.0);
    }
}

#[test]
fn weak_best_match_inserts_instead_of_merging() {
    for (store, _tmp) in stores() {
        store
            .insert_entity(&Entity::new("Acme Widgets", "organization").with_embedding(vec![1.0, 0.0]))
            .unwrap();

        let mut config = EngineConfig::default();
        config.matching.min_similarity = 0.5;
        let matcher = EntityMatcher::new(store.clone(), &config.matching);
        let merger = EntityMerger::new(store.clone(), matcher, &config);

        // cos([1, 0], [0.6, 0.8]) = 0.6
        let candidate = Entity::new("Widget Works", "organization").with_embedding(vec![0.6, 0.8]);
        let result = merger
            .resolve_entity(&candidate, 0.8, MergeStrategy::Union, true)
            .unwrap();

        assert!(!result.merged);
        assert_eq!(result.matches.len(), 1);
        assert!((result.matches[0].confidence - 0.6).abs() < 1e-6);
        assert_eq!(result.entity.id, candidate.id);
        assert_eq!(store.entity(&candidate.id).unwrap().name, "Widget Works");
    }
}

#[test]
fn self_merge_is_idempotent_on_values() {
    let x = Entity::new("Ada Lovelace", "person")
        .with_attribute("born", 1815_i64)
        .with_attribute("field", "mathematics");
    let merged = merge_entity_attributes(&x, &x, MergeStrategy::Union);
    assert_eq!(merged.attributes, x.attributes);
    assert_eq!(merged.merge_history.len(), x.merge_history.len() + 1);
    assert_eq!(merged.merge_history[0].merged_with, x.id);
}

#[test]
fn confidence_separates_identical_from_dissimilar() {
    let x = Entity::new("Grace Hopper", "person")
        .with_attribute("navy", true)
        .with_embedding(vec![0.3, 0.4, 0.5]);
    let twin = x.clone().with_id("twin");
    assert!(calculate_match_confidence(&x, &twin) >= 0.95);

    let other = Entity::new("Blue Whale", "species")
        .with_attribute("habitat", "ocean")
        .with_embedding(vec![-0.3, -0.4, -0.5]);
    assert!(calculate_match_confidence(&x, &other) < 0.5);
}
