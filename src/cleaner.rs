//! Entity Cleaner
//!
//! Daily maintenance pass that merges duplicate entities discovered
//! after the fact (abbreviation vs full form, spelling variants). A
//! structured-generation call proposes duplicate groups with a
//! canonical name each; facts and engagements are re-pointed to the
//! canonical row, the duplicates are deleted, the merged fact set is
//! deduplicated, and the canonical embedding is regenerated. This is
//! the only component allowed to delete or re-parent facts and
//! engagements.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embeddings::{cosine_similarity, entity_embedding_text, try_embed, Embedder};
use crate::generation::Generator;
use crate::store::{normalize_name, SharedStore};

/// What one cleaning pass did
#[derive(Debug, Default, Clone)]
pub struct CleanReport {
    pub groups_merged: usize,
    pub entities_removed: usize,
    pub facts_deduped: usize,
}

pub struct Cleaner {
    store: SharedStore,
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    config: Config,
}

impl Cleaner {
    pub fn new(
        store: SharedStore,
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        config: Config,
    ) -> Self {
        Self {
            store,
            generator,
            embedder,
            config,
        }
    }

    /// One full cleaning pass for a user.
    pub async fn run(&self, user_id: i64) -> Result<CleanReport> {
        let names = self.store.lock().entity_names(user_id)?;
        let mut report = CleanReport::default();

        if names.len() < 2 {
            return Ok(report);
        }

        let groups = self.generator.duplicate_groups(&names).await?;
        if groups.is_empty() {
            debug!("Cleaner found no duplicate groups for user {}", user_id);
            return Ok(report);
        }

        for group in groups {
            let canonical_name = normalize_name(&group.canonical);
            let canonical = match self.store.lock().get_entity_by_name(user_id, &canonical_name)? {
                Some(e) => e,
                None => {
                    warn!(
                        "Cleaner proposed unknown canonical '{}', skipping group",
                        group.canonical
                    );
                    continue;
                }
            };

            let mut merged_any = false;
            for dup_name in &group.duplicates {
                let dup_name = normalize_name(dup_name);
                if dup_name == canonical.name {
                    continue;
                }
                let dup = match self.store.lock().get_entity_by_name(user_id, &dup_name)? {
                    Some(e) => e,
                    None => continue,
                };

                {
                    let store = self.store.lock();
                    let facts = store.repoint_facts(&dup.id, &canonical.id)?;
                    let engagements = store.repoint_engagements(&dup.id, &canonical.id)?;
                    store.delete_entity(&dup.id)?;
                    info!(
                        "Merged '{}' into '{}' ({} facts, {} engagements)",
                        dup.name, canonical.name, facts, engagements
                    );
                }
                report.entities_removed += 1;
                merged_any = true;
            }

            if merged_any {
                report.groups_merged += 1;
                report.facts_deduped += self.dedup_facts(&canonical.id)?;
                self.refresh_embedding(&canonical.id).await?;
            }
        }

        info!(
            "Cleaner for user {}: {} group(s), {} entity(ies) removed, {} fact(s) deduped",
            user_id, report.groups_merged, report.entities_removed, report.facts_deduped
        );
        Ok(report)
    }

    /// Drop later facts that near-duplicate an earlier one in the merged
    /// set. Facts without embeddings are left alone until backfill.
    fn dedup_facts(&self, entity_id: &str) -> Result<usize> {
        let store = self.store.lock();
        let facts = store.facts_for_entity(entity_id)?;

        let mut kept: Vec<&crate::store::Fact> = Vec::new();
        let mut removed = 0;

        for fact in &facts {
            let emb = match fact.embedding.as_deref() {
                Some(e) => e,
                None => {
                    kept.push(fact);
                    continue;
                }
            };

            let duplicate = kept.iter().any(|k| {
                k.embedding
                    .as_deref()
                    .map(|ke| cosine_similarity(emb, ke) >= self.config.fact_dedup_threshold)
                    .unwrap_or(false)
            });

            if duplicate {
                store.delete_fact(&fact.id)?;
                removed += 1;
            } else {
                kept.push(fact);
            }
        }

        Ok(removed)
    }

    async fn refresh_embedding(&self, entity_id: &str) -> Result<()> {
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
}
