//! Command Surface
//!
//! The data operations chat adapters call into. Every user-originated
//! operation resets the notification backoff before doing its work.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::embeddings::{try_embed, Embedder};
use crate::generation::Generator;
use crate::interest::interest_at;
use crate::notify::BackoffGovernor;
use crate::search::{timed_search, SearchTool};
use crate::store::{
    Engagement, EngagementKind, Entity, Fact, LearnPrompt, Preference, SharedStore, StoredMessage,
    Trigger,
};

/// One learn prompt with what it has yielded so far
#[derive(Debug, Clone)]
pub struct LearnStatus {
    pub prompt: LearnPrompt,
    /// Derived entities and their fact counts, via the provenance chain
    /// LearnPrompt -> SearchRecord -> Fact -> Entity
    pub entities: Vec<(String, i64)>,
}

/// Full read view of one entity
#[derive(Debug, Clone)]
pub struct EntityDetail {
    pub entity: Entity,
    pub facts: Vec<Fact>,
    pub engagements: Vec<Engagement>,
    pub interest: f64,
}

pub struct Commands {
    store: SharedStore,
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    search: Arc<dyn SearchTool>,
    governor: Arc<BackoffGovernor>,
    config: Config,
}

impl Commands {
    pub fn new(
        store: SharedStore,
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        search: Arc<dyn SearchTool>,
        governor: Arc<BackoffGovernor>,
        config: Config,
    ) -> Self {
        Self {
            store,
            generator,
            embedder,
            search,
            governor,
            config,
        }
    }

    /// Queue an incoming chat message for the next extraction pass.
    pub fn record_message(&self, user_id: i64, content: &str) -> Result<StoredMessage> {
        self.governor.record_user_action(user_id);
        self.store.lock().add_message(user_id, content)
    }

    /// Research a topic now: generate 3..=N queries, run them
    /// sequentially tagged `learn_command`, mark the prompt completed.
    /// Extraction happens on the next pipeline pass.
    pub async fn learn(&self, user_id: i64, topic: &str) -> Result<LearnPrompt> {
        self.governor.record_user_action(user_id);

        let queries = self
            .generator
            .learn_queries(topic, self.config.learn_max_searches)
            .await?;

        let prompt = self
            .store
            .lock()
            .add_learn_prompt(user_id, topic, queries.len() as i64)?;

        info!(
            "Learn '{}' for user {}: {} search(es)",
            topic,
            user_id,
            queries.len()
        );

        for query in &queries {
            match timed_search(self.search.as_ref(), query).await {
                Ok(outcome) => {
                    let store = self.store.lock();
                    store.add_search_record(
                        user_id,
                        query,
                        &outcome.response,
                        outcome.duration_ms,
                        Trigger::LearnCommand,
                        Some(&prompt.id),
                        None,
                    )?;
                    store.decrement_learn_prompt(&prompt.id)?;
                }
                Err(e) => {
                    warn!("Learn search failed for '{}': {}", query, e);
                    self.store.lock().decrement_learn_prompt(&prompt.id)?;
                }
            }
        }

        self.store.lock().complete_learn_prompt(&prompt.id)?;
        Ok(prompt)
    }

    pub fn learn_status(&self, user_id: i64) -> Result<Vec<LearnStatus>> {
        let store = self.store.lock();
        let prompts = store.list_learn_prompts(user_id)?;
        let mut statuses = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let entities = store
                .learn_prompt_yield(&prompt.id)?
                .into_iter()
                .map(|(e, n)| (e.name, n))
                .collect();
            statuses.push(LearnStatus { prompt, entities });
        }
        Ok(statuses)
    }

    /// Register a liked topic. The one user-gated entity-creation path
    /// outside the pipeline: the entity is created eagerly if absent,
    /// and similar known entities get a smaller boost.
    pub async fn like(&self, user_id: i64, topic: &str) -> Result<Preference> {
        self.governor.record_user_action(user_id);

        let embedding = try_embed(self.embedder.as_ref(), topic).await;

        let (preference, entity) = {
            let store = self.store.lock();
            let preference =
                store.upsert_preference(user_id, topic, true, embedding.as_deref())?;
            let (entity, created) = store.get_or_create_entity(user_id, topic)?;
            if created {
                info!("Entity created from like: {}", entity.name);
            }
            store.add_engagement(
                user_id,
                Some(&entity.id),
                Some(&preference.id),
                EngagementKind::ExplicitLike,
                1,
                0.8,
                None,
            )?;
            (preference, entity)
        };

        // Related entities share some of the enthusiasm
        if let Some(ref emb) = embedding {
            let similar = {
                let store = self.store.lock();
                store.find_similar_entities(user_id, emb, 5)?
            };
            for (other, score) in similar {
                if other.id == entity.id || score < self.config.entity_similarity_threshold {
                    continue;
                }
                self.store.lock().add_engagement(
                    user_id,
                    Some(&other.id),
                    Some(&preference.id),
                    EngagementKind::ExplicitLike,
                    1,
                    0.4,
                    None,
                )?;
            }
        }

        Ok(preference)
    }

    /// Register a disliked topic; the matching entity, if known, takes a
    /// strong negative signal and falls out of enrichment.
    pub async fn dislike(&self, user_id: i64, topic: &str) -> Result<Preference> {
        self.governor.record_user_action(user_id);

        let embedding = try_embed(self.embedder.as_ref(), topic).await;

        let store = self.store.lock();
        let preference = store.upsert_preference(user_id, topic, false, embedding.as_deref())?;

        let entity_id = store
            .get_entity_by_name(user_id, topic)?
            .map(|e| e.id);
        store.add_engagement(
            user_id,
            entity_id.as_deref(),
            Some(&preference.id),
            EngagementKind::ExplicitDislike,
            -1,
            0.8,
            None,
        )?;

        Ok(preference)
    }

    /// A reaction to a message: engagement on every known entity the
    /// message text mentions. A thumbs-down on an unsolicited
    /// notification weighs in hard at -0.8.
    pub fn react(
        &self,
        user_id: i64,
        message_text: &str,
        positive: bool,
        on_notification: bool,
    ) -> Result<usize> {
        self.governor.record_user_action(user_id);

        let (valence, strength) = match (positive, on_notification) {
            (false, true) => (-1, 0.8),
            (false, false) => (-1, 0.6),
            (true, _) => (1, 0.6),
        };

        let store = self.store.lock();
        let names = store.entity_names(user_id)?;
        let mentioned = mentioned_entities(message_text, &names);

        let mut count = 0;
        for name in mentioned {
            if let Some(entity) = store.get_entity_by_name(user_id, &name)? {
                store.add_engagement(
                    user_id,
                    Some(&entity.id),
                    None,
                    EngagementKind::Reaction,
                    valence,
                    strength,
                    None,
                )?;
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn list_entities(&self, user_id: i64) -> Result<Vec<Entity>> {
        self.store.lock().list_entities(user_id)
    }

    pub fn entity_detail(&self, user_id: i64, entity_id: &str) -> Result<Option<EntityDetail>> {
        let store = self.store.lock();
        // Ids are opaque to the host; a foreign id must read as absent
        let entity = match store.get_entity(entity_id)? {
            Some(e) if e.user_id == user_id => e,
            _ => return Ok(None),
        };
        let facts = store.facts_for_entity(entity_id)?;
        let engagements = store.engagements_for_entity(entity_id)?;
        let interest = interest_at(
            &engagements,
            chrono::Utc::now().timestamp(),
            self.config.interest_half_life_days,
        );
        Ok(Some(EntityDetail {
            entity,
            facts,
            engagements,
            interest,
        }))
    }

    pub fn delete_entity(&self, user_id: i64, entity_id: &str) -> Result<bool> {
        self.governor.record_user_action(user_id);
        let store = self.store.lock();
        match store.get_entity(entity_id)? {
            Some(e) if e.user_id == user_id => store.delete_entity(entity_id),
            _ => Ok(false),
        }
    }

    pub fn list_interests(&self, user_id: i64) -> Result<Vec<Preference>> {
        self.store.lock().list_preferences(user_id)
    }
}

/// Known entity names mentioned in a piece of text, case-insensitive.
pub fn mentioned_entities(text: &str, known_names: &[String]) -> Vec<String> {
    let lower = text.to_lowercase();
    known_names
        .iter()
        .filter(|name| lower.contains(name.as_str()))
        .cloned()
        .collect()
}
