//! Enrichment Loop
//!
//! Once per idle tick, after extraction has fully drained, the loop
//! scores every entity, picks the one most worth researching, and
//! issues exactly one search tagged `autonomous_enrichment`. Extraction
//! is never done inline; the next pipeline pass picks the record up in
//! known-only mode like any other search result.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::interest::{interest_at, select_enrichment_target, ScoredEntity};
use crate::search::{timed_search, SearchTool};
use crate::store::{SharedStore, Trigger};

/// How deep the knowledge already goes decides how the query is shaped.
/// The breakpoints are heuristic configuration; only the monotonic
/// broad → targeted → briefing progression is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Little is known: survey the territory
    Broad,
    /// A sketch exists: aim at the gaps
    GapTargeted,
    /// The picture is rich: ask only what changed
    Briefing,
}

pub fn query_mode(fact_count: i64, config: &Config) -> QueryMode {
    if fact_count < config.enrich_broad_max_facts {
        QueryMode::Broad
    } else if fact_count < config.enrich_targeted_max_facts {
        QueryMode::GapTargeted
    } else {
        QueryMode::Briefing
    }
}

/// Build the search query for an entity in the given mode.
pub fn build_query(
    name: &str,
    mode: QueryMode,
    known_facts: &[String],
    last_search_at: Option<i64>,
) -> String {
    match mode {
        QueryMode::Broad => format!("{}: overview, key facts and background", name),
        QueryMode::GapTargeted => {
            // Name what is already covered so results skew to the gaps
            let covered: Vec<&str> = known_facts
                .iter()
                .take(5)
                .map(|f| f.split('.').next().unwrap_or(f.as_str()))
                .collect();
            format!(
                "{}: details and specifications, beyond the following: {}",
                name,
                covered.join("; ")
            )
        }
        QueryMode::Briefing => {
            let since = last_search_at
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "last month".to_string());
            format!("{} news and updates since {}", name, since)
        }
    }
}

/// Autonomous research driver
pub struct Enricher {
    store: SharedStore,
    search: Arc<dyn SearchTool>,
    config: Config,
}

impl Enricher {
    pub fn new(store: SharedStore, search: Arc<dyn SearchTool>, config: Config) -> Self {
        Self {
            store,
            search,
            config,
        }
    }

    /// Score all entities and return the enrichment target, if any has
    /// positive interest.
    pub fn pick_target(&self, user_id: i64) -> Result<Option<ScoredEntity>> {
        let now = chrono::Utc::now().timestamp();
        let store = self.store.lock();

        let mut scored = Vec::new();
        for entity in store.list_entities(user_id)? {
            let engagements = store.engagements_for_entity(&entity.id)?;
            let interest = interest_at(&engagements, now, self.config.interest_half_life_days);
            let fact_count = store.fact_count(&entity.id)?;
            let last_search_at = store.last_search_time_for_entity(&entity.id)?;
            scored.push(ScoredEntity {
                entity,
                interest,
                fact_count,
                last_search_at,
            });
        }

        Ok(select_enrichment_target(scored))
    }

    /// One enrichment cycle: pick, search, record. At most one search
    /// per tick; a search-tool failure skips the tick. Returns the new
    /// search record's id when a search was issued.
    pub async fn run_once(&self, user_id: i64) -> Result<Option<String>> {
        let target = match self.pick_target(user_id)? {
            Some(t) => t,
            None => {
                debug!("No entity with positive interest; enrichment idle");
                return Ok(None);
            }
        };

        let (query, mode) = {
            let store = self.store.lock();
            let known_facts: Vec<String> = store
                .facts_for_entity(&target.entity.id)?
                .into_iter()
                .map(|f| f.content)
                .collect();
            let mode = query_mode(target.fact_count, &self.config);
            (
                build_query(&target.entity.name, mode, &known_facts, target.last_search_at),
                mode,
            )
        };

        info!(
            "Enriching '{}' ({:?}, {} facts, interest {:.2})",
            target.entity.name, mode, target.fact_count, target.interest
        );

        let outcome = match timed_search(self.search.as_ref(), &query).await {
            Ok(o) => o,
            Err(e) => {
                warn!("Enrichment search failed, skipping tick: {}", e);
                return Ok(None);
            }
        };

        let record = self.store.lock().add_search_record(
            user_id,
            &query,
            &outcome.response,
            outcome.duration_ms,
            Trigger::AutonomousEnrichment,
            None,
            Some(&target.entity.id),
        )?;

        Ok(Some(record.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_progression_is_monotonic() {
        let config = Config::default();
        assert_eq!(query_mode(0, &config), QueryMode::Broad);
        assert_eq!(query_mode(4, &config), QueryMode::Broad);
        assert_eq!(query_mode(5, &config), QueryMode::GapTargeted);
        assert_eq!(query_mode(14, &config), QueryMode::GapTargeted);
        assert_eq!(query_mode(15, &config), QueryMode::Briefing);
        assert_eq!(query_mode(100, &config), QueryMode::Briefing);
    }

    #[test]
    fn test_broad_query_names_entity() {
        let q = build_query("kef ls50 meta", QueryMode::Broad, &[], None);
        assert!(q.contains("kef ls50 meta"));
        assert!(q.contains("overview"));
    }

    #[test]
    fn test_targeted_query_names_covered_ground() {
        let facts = vec!["Uses a Uni-Q driver. Released 2020.".to_string()];
        let q = build_query("kef ls50 meta", QueryMode::GapTargeted, &facts, None);
        assert!(q.contains("beyond the following"));
        assert!(q.contains("Uses a Uni-Q driver"));
        // Only the first sentence of each fact is quoted
        assert!(!q.contains("Released 2020"));
    }

    #[test]
    fn test_briefing_query_carries_since_date() {
        // 2024-01-01 UTC
        let q = build_query("nvidia", QueryMode::Briefing, &[], Some(1_704_067_200));
        assert!(q.contains("since 2024-01-01"));

        let q = build_query("nvidia", QueryMode::Briefing, &[], None);
        assert!(q.contains("since last month"));
    }
}
