//! Extraction Pipeline
//!
//! Drains unprocessed search records and chat messages, turning their
//! text into entities, facts and engagements. The mode is derived from
//! each record's trigger and passed explicitly; there is no shared
//! pipeline mode. Full mode may create entities (validator permitting);
//! known-only mode uses an identification schema with no new-entity
//! slot, so an autonomous search can never grow the entity set.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embeddings::{entity_embedding_text, try_embed, Embedder};
use crate::generation::{ExtractedFact, Generator, NewCandidate};
use crate::notify::{BackoffGovernor, Discovery, Notification};
use crate::store::{
    EngagementKind, Entity, SearchRecord, SharedStore, StoredMessage, Trigger,
};
use crate::validator::Validator;

/// Extraction mode, derived from the record's trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    /// May create new entities after validation
    Full,
    /// Restricted to matching existing entities
    KnownOnly,
}

impl ExtractionMode {
    pub fn for_trigger(trigger: Trigger) -> Self {
        match trigger {
            Trigger::UserMessage | Trigger::LearnCommand => ExtractionMode::Full,
            Trigger::AutonomousEnrichment => ExtractionMode::KnownOnly,
        }
    }
}

/// Running pipeline counters
#[derive(Debug, Default, Clone)]
pub struct PipelineStats {
    pub records_processed: u64,
    pub messages_processed: u64,
    pub entities_created: u64,
    pub entities_matched: u64,
    pub facts_added: u64,
    pub duplicate_facts_skipped: u64,
    pub candidates_rejected: u64,
    pub generation_failures: u64,
}

/// An entity present in a record's content, plus whether this pass
/// created it.
struct PresentEntity {
    entity: Entity,
    created: bool,
    tagline: String,
    primary: bool,
}

pub struct Pipeline {
    store: SharedStore,
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    validator: Validator,
    governor: Arc<BackoffGovernor>,
    config: Config,
    stats: Mutex<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        store: SharedStore,
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        governor: Arc<BackoffGovernor>,
        config: Config,
    ) -> Self {
        let validator = Validator::new(config.semantic_threshold);
        Self {
            store,
            generator,
            embedder,
            validator,
            governor,
            config,
            stats: Mutex::new(PipelineStats::default()),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }

    /// Process everything pending for the user. Returns how many
    /// records/messages were handled this pass; failed ones stay queued
    /// for the next pass until their attempt cap.
    pub async fn drain(&self, user_id: i64) -> Result<usize> {
        let (records, messages) = {
            let store = self.store.lock();
            (
                store.unextracted_search_records(user_id, self.config.max_extraction_attempts)?,
                store.unprocessed_messages(user_id, self.config.max_extraction_attempts)?,
            )
        };

        let mut handled = 0;

        for record in records {
            match self.process_search_record(&record).await {
                Ok(()) => handled += 1,
                Err(e) => {
                    self.stats.lock().generation_failures += 1;
                    let attempts = self.store.lock().bump_search_attempts(&record.id)?;
                    if attempts >= self.config.max_extraction_attempts {
                        warn!(
                            "Giving up on search record {} after {} attempts: {}",
                            record.id, attempts, e
                        );
                    } else {
                        debug!("Extraction failed for {}, will retry: {}", record.id, e);
                    }
                }
            }
        }

        for message in messages {
            match self.process_message(&message).await {
                Ok(()) => handled += 1,
                Err(e) => {
                    self.stats.lock().generation_failures += 1;
                    let attempts = self.store.lock().bump_message_attempts(&message.id)?;
                    if attempts >= self.config.max_extraction_attempts {
                        warn!(
                            "Giving up on message {} after {} attempts: {}",
                            message.id, attempts, e
                        );
                    }
                }
            }
        }

        Ok(handled)
    }

    /// True when nothing is pending; the enrichment loop only runs then.
    pub fn is_drained(&self, user_id: i64) -> Result<bool> {
        let store = self.store.lock();
        Ok(store
            .unextracted_search_records(user_id, self.config.max_extraction_attempts)?
            .is_empty()
            && store
                .unprocessed_messages(user_id, self.config.max_extraction_attempts)?
                .is_empty())
    }

    async fn process_search_record(&self, record: &SearchRecord) -> Result<()> {
        let mode = ExtractionMode::for_trigger(record.trigger);
        debug!(
            "Extracting search record {} ({:?}, {:?})",
            record.id, record.trigger, mode
        );

        let present = self
            .identify(record.user_id, &record.response, mode)
            .await?;

        let mut yields = Vec::with_capacity(present.len());
        for p in &present {
            let new_facts = self
                .extract_entity_facts(p, &record.response, Some(&record.id), None)
                .await?;
            yields.push(new_facts);
        }

        // Engagements and notifications land only after every entity has
        // extracted cleanly; engagements are append-only, so a retried
        // record must not re-count the entities a failed pass got through.
        for (p, new_facts) in present.iter().zip(yields) {
            // Engagement only for user-originated triggers
            if mode == ExtractionMode::Full {
                self.store.lock().add_engagement(
                    record.user_id,
                    Some(&p.entity.id),
                    None,
                    EngagementKind::SearchInitiated,
                    1,
                    0.6,
                    None,
                )?;
            }

            self.notify_discovery(record.user_id, p, new_facts, mode);
        }

        // Exactly once, regardless of what the record yielded
        self.store.lock().mark_extracted(&record.id)?;
        self.stats.lock().records_processed += 1;
        Ok(())
    }

    async fn process_message(&self, message: &StoredMessage) -> Result<()> {
        // A user message is definitionally user-triggered: always full mode
        let present = self
            .identify(message.user_id, &message.content, ExtractionMode::Full)
            .await?;

        for p in &present {
            self.extract_entity_facts(p, &message.content, None, Some(&message.id))
                .await?;
        }

        // A message mostly about one known entity is a follow-up signal
        if let Some(primary) = present.iter().find(|p| !p.created && p.primary) {
            self.store.lock().add_engagement(
                message.user_id,
                Some(&primary.entity.id),
                None,
                EngagementKind::FollowUpQuestion,
                1,
                0.5,
                Some(&message.id),
            )?;
            debug!(
                "Follow-up engagement for {} from message {}",
                primary.entity.name, message.id
            );
        }

        self.store.lock().mark_message_processed(&message.id)?;
        self.stats.lock().messages_processed += 1;
        Ok(())
    }

    /// Identify the entities present in some content. In full mode new
    /// candidates pass through the validator; in known-only mode the
    /// generation schema has no new slot, so this is match-only.
    async fn identify(
        &self,
        user_id: i64,
        content: &str,
        mode: ExtractionMode,
    ) -> Result<Vec<PresentEntity>> {
        let known_names = self.store.lock().entity_names(user_id)?;

        let (known, candidates) = match mode {
            ExtractionMode::Full => {
                let result = self
                    .generator
                    .identify_entities_full(content, &known_names)
                    .await?;
                (result.known, result.new)
            }
            ExtractionMode::KnownOnly => {
                let result = self
                    .generator
                    .identify_entities_known_only(content, &known_names)
                    .await?;
                (result.known, Vec::new())
            }
        };

        let mut present = Vec::new();

        for m in known {
            let entity = self.store.lock().get_entity_by_name(user_id, &m.name)?;
            match entity {
                Some(entity) => {
                    self.stats.lock().entities_matched += 1;
                    present.push(PresentEntity {
                        entity,
                        created: false,
                        tagline: String::new(),
                        primary: m.primary,
                    });
                }
                // Hallucinated "known" match; nothing to attach facts to
                None => debug!("Ignoring unknown 'known' match: {}", m.name),
            }
        }

        for candidate in candidates {
            if let Some(p) = self.admit_candidate(user_id, &candidate, content).await? {
                present.push(p);
            }
        }

        Ok(present)
    }

    /// The only path that creates entities: full-mode extraction after
    /// validator approval.
    async fn admit_candidate(
        &self,
        user_id: i64,
        candidate: &NewCandidate,
        trigger_content: &str,
    ) -> Result<Option<PresentEntity>> {
        match self
            .validator
            .validate(&candidate.name, trigger_content, self.embedder.as_ref())
            .await?
        {
            Ok(()) => {}
            Err(rejection) => {
                self.stats.lock().candidates_rejected += 1;
                debug!("Candidate '{}' dropped: {}", candidate.name, rejection);
                return Ok(None);
            }
        }

        let (entity, created) = self.store.lock().get_or_create_entity(user_id, &candidate.name)?;
        if created {
            self.stats.lock().entities_created += 1;
            info!("New entity: {} ({})", entity.name, &entity.id[..8]);
        } else {
            self.stats.lock().entities_matched += 1;
        }
        Ok(Some(PresentEntity {
            entity,
            created,
            tagline: candidate.tagline.clone(),
            primary: false,
        }))
    }

    /// Extract and store new facts for one entity, deduplicating by
    /// embedding similarity against what is already known. Returns the
    /// stored fact texts.
    async fn extract_entity_facts(
        &self,
        present: &PresentEntity,
        content: &str,
        search_record_id: Option<&str>,
        message_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let known_facts: Vec<String> = {
            let store = self.store.lock();
            store
                .facts_for_entity(&present.entity.id)?
                .into_iter()
                .map(|f| f.content)
                .collect()
        };

        let extracted = self
            .generator
            .extract_facts(content, &present.entity.name, &known_facts)
            .await?;

        let mut stored = Vec::new();
        for fact in extracted {
            if self
                .store_fact_deduped(&present.entity.id, &fact, search_record_id, message_id)
                .await?
            {
                stored.push(fact.content);
            }
        }

        if !stored.is_empty() {
            self.refresh_entity_embedding(&present.entity.id).await?;
        } else if present.created {
            // New entity with no facts yet still needs a name embedding
            self.refresh_entity_embedding(&present.entity.id).await?;
        }

        Ok(stored)
    }

    /// Store one fact unless its embedding is near-duplicate of an
    /// existing fact on the entity. Embedding failure stores the fact
    /// without a vector; it is excluded from similarity until backfill.
    async fn store_fact_deduped(
        &self,
        entity_id: &str,
        fact: &ExtractedFact,
        search_record_id: Option<&str>,
        message_id: Option<&str>,
    ) -> Result<bool> {
        let embedding = try_embed(self.embedder.as_ref(), &fact.content).await;

        if let Some(ref emb) = embedding {
            let duplicates = self.store.lock().find_similar_facts(
                entity_id,
                emb,
                self.config.fact_dedup_threshold,
            )?;
            if let Some((existing, score)) = duplicates.first() {
                self.stats.lock().duplicate_facts_skipped += 1;
                debug!(
                    "Skipping duplicate fact ({:.2} vs '{}'): {}",
                    score, existing.content, fact.content
                );
                return Ok(false);
            }
        }

        self.store.lock().add_fact(
            entity_id,
            &fact.content,
            fact.source_url.as_deref(),
            search_record_id,
            message_id,
            embedding.as_deref(),
        )?;
        self.stats.lock().facts_added += 1;
        Ok(true)
    }

    /// Recompute the entity embedding over its name + current facts.
    async fn refresh_entity_embedding(&self, entity_id: &str) -> Result<()> {
        let text = {
            let store = self.store.lock();
            let entity = match store.get_entity(entity_id)? {
                Some(e) => e,
                None => return Ok(()),
            };
            let facts = store.facts_for_entity(entity_id)?;
            entity_embedding_text(&entity, &facts)
        };

        if let Some(embedding) = try_embed(self.embedder.as_ref(), &text).await {
            self.store.lock().set_entity_embedding(entity_id, &embedding)?;
        }
        Ok(())
    }

    /// Backfill missing entity and fact embeddings; rows stay excluded
    /// from similarity search until this succeeds.
    pub async fn backfill_embeddings(&self, user_id: i64, batch_size: usize) -> Result<usize> {
        let (entities, facts) = {
            let store = self.store.lock();
            (
                store.entities_needing_embeddings(user_id, batch_size)?,
                store.facts_needing_embeddings(batch_size)?,
            )
        };

        let mut filled = 0;

        for entity in entities {
            self.refresh_entity_embedding(&entity.id).await?;
            filled += 1;
        }

        for fact in facts {
            if let Some(embedding) = try_embed(self.embedder.as_ref(), &fact.content).await {
                self.store.lock().set_fact_embedding(&fact.id, &embedding)?;
                filled += 1;
            }
        }

        if filled > 0 {
            info!("Backfilled {} embedding(s) for user {}", filled, user_id);
        }
        Ok(filled)
    }

    /// Queue the discovery message for this entity. Known-only passes
    /// only ever report facts; full-mode passes report new entities too.
    fn notify_discovery(
        &self,
        user_id: i64,
        present: &PresentEntity,
        new_facts: Vec<String>,
        mode: ExtractionMode,
    ) {
        let discovery = if present.created {
            debug_assert!(mode == ExtractionMode::Full);
            Discovery::NewEntity {
                tagline: present.tagline.clone(),
            }
        } else if !new_facts.is_empty() {
            Discovery::NewFacts { facts: new_facts }
        } else {
            return;
        };

        self.governor.submit(Notification {
            user_id,
            entity_id: present.entity.id.clone(),
            entity_name: present.entity.name.clone(),
            discovery,
            created_at: chrono::Utc::now().timestamp(),
        });
    }
}
