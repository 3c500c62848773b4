use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use verity::{
    ContradictionResolver, EngineConfig, GraphStore, Interval, MemoryStore, NewRelationship,
    RelationshipQuery, ResolutionStrategy, TemporalEnhancer, TimeInput,
};

fn base() -> DateTime<Utc> {
    "2024-01-01T00:00:00Z".parse().unwrap()
}

fn arb_interval() -> impl Strategy<Value = Interval> {
    (0i64..365, prop::option::of(1i64..200)).prop_map(|(start, len)| {
        let start = base() + Duration::days(start);
        Interval::new(start, len.map(|d| start + Duration::days(d)))
    })
}

fn arb_strategy() -> impl Strategy<Value = ResolutionStrategy> {
    prop_oneof![
        Just(ResolutionStrategy::NewestWins),
        Just(ResolutionStrategy::Merge),
        Just(ResolutionStrategy::SplitTimeline),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn overlap_is_symmetric(a in arb_interval(), b in arb_interval()) {
        prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
    }

    #[test]
    fn disjoint_intervals_never_overlap(start in 0i64..365, len in 1i64..100, gap in 0i64..100) {
        let a_start = base() + Duration::days(start);
        let a_end = a_start + Duration::days(len);
        let a = Interval::new(a_start, Some(a_end));
        let b = Interval::new(a_end + Duration::days(gap), None);
        prop_assert!(!a.overlaps(&b));
        prop_assert!(!b.overlaps(&a));
    }

    /// After every insert + resolve, at most one instance of the key is open
    /// and every closed instance still has `invalid_at > valid_at`.
    #[test]
    fn resolution_leaves_at_most_one_current_edge(
        intervals in prop::collection::vec(arb_interval(), 1..8),
        strategy in arb_strategy(),
    ) {
        let store: Arc<dyn GraphStore> = Arc::new(MemoryStore::new());
        let resolver = ContradictionResolver::new(store.clone(), &EngineConfig::default());
        let enhancer = TemporalEnhancer::new();

        for (i, interval) in intervals.iter().enumerate() {
            let created_at = base() + Duration::days(400) + Duration::seconds(i as i64);
            let edge = enhancer
                .enhance_at(
                    NewRelationship::new("alice", "acme", "works_at"),
                    Some(TimeInput::At(interval.start)),
                    interval.end.map(TimeInput::At),
                    created_at,
                )
                .unwrap();
            let edge = store.insert_relationship(&edge).unwrap();
            let result = resolver.resolve_all(&edge, strategy).unwrap();
            prop_assert!(result.success);

            let all = store
                .query_relationships(&RelationshipQuery::between("alice", "acme"))
                .unwrap();
            let open = all.iter().filter(|r| r.is_current()).count();
            prop_assert!(open <= 1, "{} open edges after {} inserts", open, i + 1);
            for rel in &all {
                if let Some(end) = rel.invalid_at {
                    prop_assert!(end > rel.valid_at);
                }
            }
        }
    }
}
