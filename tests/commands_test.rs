//! Command Surface Integration Tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{axes, axis, shared_store, FakeEmbedder, FakeGenerator, FakeSearch};
use magpie::store::EngagementKind;
use magpie::{BackoffGovernor, Commands, Config, Trigger};

const USER: i64 = 1;

fn make_commands(
    store: magpie::SharedStore,
) -> (Commands, Arc<FakeGenerator>, Arc<FakeEmbedder>, Arc<FakeSearch>) {
    let generator = Arc::new(FakeGenerator::new());
    let embedder = Arc::new(FakeEmbedder::new());
    let search = Arc::new(FakeSearch::new());
    let governor = Arc::new(BackoffGovernor::new(Duration::from_secs(60)));
    let commands = Commands::new(
        store,
        generator.clone(),
        embedder.clone(),
        search.clone(),
        governor,
        Config::default(),
    );
    (commands, generator, embedder, search)
}

#[tokio::test]
async fn learn_runs_generated_queries_and_completes() {
    let store = shared_store();
    let (commands, _generator, _embedder, search) = make_commands(store.clone());

    for _ in 0..3 {
        search.push_response("search result text");
    }

    let prompt = commands.learn(USER, "vintage synthesizers").await.expect("learn");
    assert_eq!(prompt.prompt, "vintage synthesizers");

    // Three queries generated, three records tagged with the prompt
    assert_eq!(search.queries().len(), 3);
    let records = store
        .lock()
        .unextracted_search_records(USER, 3)
        .expect("records");
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.trigger, Trigger::LearnCommand);
        assert_eq!(record.learn_prompt_id.as_deref(), Some(prompt.id.as_str()));
    }

    let statuses = commands.learn_status(USER).expect("status");
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].prompt.completed);
    assert_eq!(statuses[0].prompt.searches_remaining, 0);
}

#[tokio::test]
async fn learn_tolerates_failed_searches() {
    let store = shared_store();
    let (commands, _generator, _embedder, search) = make_commands(store.clone());

    // Only one of the three queries will find a backend
    search.push_response("the single result");

    let prompt = commands.learn(USER, "obscure topic").await.expect("learn");
    assert_eq!(
        store
            .lock()
            .unextracted_search_records(USER, 3)
            .expect("records")
            .len(),
        1
    );

    let statuses = commands.learn_status(USER).expect("status");
    assert!(statuses[0].prompt.completed);
    assert_eq!(statuses[0].prompt.prompt, prompt.prompt);
}

#[tokio::test]
async fn like_creates_entity_and_boosts_related_ones() {
    let store = shared_store();
    let (commands, _generator, embedder, _search) = make_commands(store.clone());

    // A known entity close to the liked topic, and a distant one
    let (kef, _) = store
        .lock()
        .get_or_create_entity(USER, "kef ls50 meta")
        .expect("seed");
    store
        .lock()
        .set_entity_embedding(&kef.id, &axis(0))
        .expect("embedding");
    let (crypto, _) = store
        .lock()
        .get_or_create_entity(USER, "crypto news")
        .expect("seed");
    store
        .lock()
        .set_entity_embedding(&crypto.id, &axis(5))
        .expect("embedding");

    embedder.set("bookshelf speakers", axes(&[0, 1]));

    let preference = commands.like(USER, "bookshelf speakers").await.expect("like");
    assert!(preference.liked);

    let s = store.lock();
    // The like command may create entities directly
    let liked = s
        .get_entity_by_name(USER, "bookshelf speakers")
        .expect("query")
        .expect("created");
    let direct = s.engagements_for_entity(&liked.id).expect("engagements");
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].kind, EngagementKind::ExplicitLike);
    assert!((direct[0].strength - 0.8).abs() < 1e-9);

    // cosine(axes([0,1]), axis(0)) ~ 0.707: above the relatedness bar
    let boosted = s.engagements_for_entity(&kef.id).expect("engagements");
    assert_eq!(boosted.len(), 1);
    assert!((boosted[0].strength - 0.4).abs() < 1e-9);

    // The unrelated entity gets nothing
    assert!(s.engagements_for_entity(&crypto.id).expect("engagements").is_empty());
}

#[tokio::test]
async fn dislike_records_negative_signal_without_creating() {
    let store = shared_store();
    let (commands, _generator, _embedder, _search) = make_commands(store.clone());

    let (entity, _) = store
        .lock()
        .get_or_create_entity(USER, "crypto news")
        .expect("seed");

    let preference = commands.dislike(USER, "crypto news").await.expect("dislike");
    assert!(!preference.liked);

    let s = store.lock();
    let engagements = s.engagements_for_entity(&entity.id).expect("engagements");
    assert_eq!(engagements.len(), 1);
    assert_eq!(engagements[0].kind, EngagementKind::ExplicitDislike);
    assert_eq!(engagements[0].valence, -1);
    assert!((engagements[0].strength - 0.8).abs() < 1e-9);

    // Disliking an unknown topic must not create an entity
    drop(s);
    commands.dislike(USER, "celebrity gossip").await.expect("dislike");
    assert!(store
        .lock()
        .get_entity_by_name(USER, "celebrity gossip")
        .expect("query")
        .is_none());

    let interests = commands.list_interests(USER).expect("interests");
    assert_eq!(interests.len(), 2);
    assert!(interests.iter().all(|p| !p.liked));
}

#[tokio::test]
async fn reactions_attach_to_mentioned_entities() {
    let store = shared_store();
    let (commands, _generator, _embedder, _search) = make_commands(store.clone());

    let (entity, _) = store
        .lock()
        .get_or_create_entity(USER, "kef ls50 meta")
        .expect("seed");

    let hit = commands
        .react(USER, "Loved that piece on the KEF LS50 Meta!", true, false)
        .expect("react");
    assert_eq!(hit, 1);

    // A thumbs-down on an unprompted notification weighs in harder
    commands
        .react(USER, "Update on kef ls50 meta: new firmware", false, true)
        .expect("react");

    let engagements = store
        .lock()
        .engagements_for_entity(&entity.id)
        .expect("engagements");
    assert_eq!(engagements.len(), 2);

    let positive = engagements.iter().find(|e| e.valence > 0).expect("positive");
    assert_eq!(positive.kind, EngagementKind::Reaction);
    assert!((positive.strength - 0.6).abs() < 1e-9);

    let negative = engagements.iter().find(|e| e.valence < 0).expect("negative");
    assert!((negative.strength - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn entity_detail_reports_interest_and_facts() {
    let store = shared_store();
    let (commands, _generator, _embedder, _search) = make_commands(store.clone());

    let (entity, _) = store
        .lock()
        .get_or_create_entity(USER, "kef ls50 meta")
        .expect("seed");
    store
        .lock()
        .add_fact(&entity.id, "Coaxial Uni-Q driver.", None, None, None, None)
        .expect("fact");
    store
        .lock()
        .add_engagement(
            USER,
            Some(&entity.id),
            None,
            EngagementKind::ExplicitLike,
            1,
            0.8,
            None,
        )
        .expect("engagement");

    let detail = commands
        .entity_detail(USER, &entity.id)
        .expect("query")
        .expect("exists");
    assert_eq!(detail.facts.len(), 1);
    // A fresh 0.8 engagement has barely decayed
    assert!(detail.interest > 0.75 && detail.interest <= 0.8);

    assert!(commands.delete_entity(USER, &entity.id).expect("delete"));
    assert!(commands
        .entity_detail(USER, &entity.id)
        .expect("query")
        .is_none());
}

#[tokio::test]
async fn entity_access_is_scoped_to_the_owning_user() {
    let store = shared_store();
    let (commands, _generator, _embedder, _search) = make_commands(store.clone());

    let (entity, _) = store
        .lock()
        .get_or_create_entity(USER, "kef ls50 meta")
        .expect("seed");
    let other_user = USER + 1;

    // Another user's id lookups come back empty instead of leaking
    assert!(commands
        .entity_detail(other_user, &entity.id)
        .expect("query")
        .is_none());
    assert!(!commands.delete_entity(other_user, &entity.id).expect("delete"));
    assert!(store.lock().get_entity(&entity.id).expect("query").is_some());

    assert!(commands.delete_entity(USER, &entity.id).expect("delete"));
}

#[tokio::test]
async fn record_message_queues_for_extraction() {
    let store = shared_store();
    let (commands, _generator, _embedder, _search) = make_commands(store.clone());

    commands
        .record_message(USER, "thinking about a new turntable")
        .expect("message");

    let pending = store.lock().unprocessed_messages(USER, 3).expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].content, "thinking about a new turntable");
}
