//! Autonomous Enrichment Integration Tests
//!
//! Target selection and the search-and-record cycle, with a scripted
//! search tool.

mod common;

use std::sync::Arc;

use common::{shared_store, FakeSearch};
use magpie::store::EngagementKind;
use magpie::{Config, Enricher, Trigger};

const USER: i64 = 1;

fn seed_entity_with_interest(
    store: &magpie::SharedStore,
    name: &str,
    fact_count: usize,
) -> magpie::store::Entity {
    let s = store.lock();
    let (entity, _) = s.get_or_create_entity(USER, name).expect("entity");
    s.add_engagement(
        USER,
        Some(&entity.id),
        None,
        EngagementKind::SearchInitiated,
        1,
        0.6,
        None,
    )
    .expect("engagement");
    for i in 0..fact_count {
        s.add_fact(
            &entity.id,
            &format!("{name} fact number {i}."),
            None,
            None,
            None,
            None,
        )
        .expect("fact");
    }
    entity
}

#[tokio::test]
async fn picks_the_highest_priority_entity() {
    let store = shared_store();
    // Same interest, different fact counts: the thin dossier wins
    seed_entity_with_interest(&store, "deep dossier", 10);
    let thin = seed_entity_with_interest(&store, "thin dossier", 2);

    let enricher = Enricher::new(store, Arc::new(FakeSearch::new()), Config::default());
    let target = enricher
        .pick_target(USER)
        .expect("pick")
        .expect("some target");
    assert_eq!(target.entity.id, thin.id);
    assert_eq!(target.fact_count, 2);
    assert!(target.interest > 0.0);
}

#[tokio::test]
async fn run_once_issues_one_search_and_records_it() {
    let store = shared_store();
    let entity = seed_entity_with_interest(&store, "kef ls50 meta", 0);

    let search = Arc::new(FakeSearch::new());
    search.push_response("The LS50 Meta is a coaxial bookshelf speaker.");
    search.push_response("unused second response");

    let enricher = Enricher::new(store.clone(), search.clone(), Config::default());
    let record_id = enricher
        .run_once(USER)
        .await
        .expect("run")
        .expect("search issued");

    // One search per tick, broad mode for an empty dossier
    let queries = search.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains("kef ls50 meta"));
    assert!(queries[0].contains("overview"));

    let record = store
        .lock()
        .get_search_record(&record_id)
        .expect("query")
        .expect("record exists");
    assert_eq!(record.trigger, Trigger::AutonomousEnrichment);
    assert_eq!(record.entity_id.as_deref(), Some(entity.id.as_str()));
    assert!(!record.extracted);
}

#[tokio::test]
async fn search_failure_skips_the_tick() {
    let store = shared_store();
    seed_entity_with_interest(&store, "kef ls50 meta", 0);

    // No scripted responses: every search fails as unavailable
    let search = Arc::new(FakeSearch::new());
    let enricher = Enricher::new(store.clone(), search, Config::default());

    let result = enricher.run_once(USER).await.expect("run");
    assert!(result.is_none());
    assert!(store
        .lock()
        .unextracted_search_records(USER, 3)
        .expect("pending")
        .is_empty());
}

#[tokio::test]
async fn disliked_entities_are_never_enriched() {
    let store = shared_store();
    {
        let s = store.lock();
        let (entity, _) = s.get_or_create_entity(USER, "crypto news").expect("entity");
        s.add_engagement(
            USER,
            Some(&entity.id),
            None,
            EngagementKind::ExplicitDislike,
            -1,
            0.8,
            None,
        )
        .expect("engagement");
    }

    let search = Arc::new(FakeSearch::new());
    search.push_response("should never be requested");

    let enricher = Enricher::new(store, search.clone(), Config::default());
    let result = enricher.run_once(USER).await.expect("run");
    assert!(result.is_none());
    assert!(search.queries().is_empty());
}

#[tokio::test]
async fn stale_entity_breaks_priority_ties() {
    let store = shared_store();
    let second = seed_entity_with_interest(&store, "beta topic", 1);
    let first = seed_entity_with_interest(&store, "alpha topic", 1);

    // Searching one entity recently makes the other one staler
    store
        .lock()
        .add_search_record(
            USER,
            "beta topic overview",
            "results",
            5,
            Trigger::AutonomousEnrichment,
            None,
            Some(&second.id),
        )
        .expect("record");

    let enricher = Enricher::new(store, Arc::new(FakeSearch::new()), Config::default());
    let target = enricher
        .pick_target(USER)
        .expect("pick")
        .expect("some target");
    assert_eq!(target.entity.id, first.id);
}
