//! Interest Scorer
//!
//! interest(entity) = Σ sign(valence) × strength × 0.5^(age_days / half_life)
//!
//! Fresh engagement dominates; a signal halves in weight every
//! half-life (30 days by default). Negative-valence engagements can pull
//! the total below zero, which the enrichment loop reads as "never
//! research".

use crate::store::{Engagement, Entity};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Exponential recency decay factor for an engagement's age
pub fn recency_decay(age_days: f64, half_life_days: f64) -> f64 {
    if age_days <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(age_days / half_life_days)
}

/// Decayed interest over a set of engagements, evaluated at `now`
pub fn interest_at(engagements: &[Engagement], now: i64, half_life_days: f64) -> f64 {
    engagements
        .iter()
        .map(|e| {
            let age_days = (now - e.created_at) as f64 / SECONDS_PER_DAY;
            e.valence.signum() as f64 * e.strength * recency_decay(age_days, half_life_days)
        })
        .sum()
}

/// An entity scored for enrichment selection
#[derive(Debug, Clone)]
pub struct ScoredEntity {
    pub entity: Entity,
    pub interest: f64,
    pub fact_count: i64,
    /// Most recent enrichment search for this entity, if any
    pub last_search_at: Option<i64>,
}

impl ScoredEntity {
    /// interest × 1/max(fact_count, 1): equal interest favors the entity
    /// we know least about.
    pub fn priority(&self) -> f64 {
        self.interest / self.fact_count.max(1) as f64
    }
}

/// Pick the enrichment target: highest priority, ties broken by lowest
/// fact count, then stalest last-search time (never-searched is stalest
/// of all). Entities with non-positive interest are never candidates.
pub fn select_enrichment_target(mut scored: Vec<ScoredEntity>) -> Option<ScoredEntity> {
    scored.retain(|s| s.interest > 0.0);
    scored.sort_by(|a, b| {
        b.priority()
            .partial_cmp(&a.priority())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.fact_count.cmp(&b.fact_count))
            .then(
                a.last_search_at
                    .unwrap_or(i64::MIN)
                    .cmp(&b.last_search_at.unwrap_or(i64::MIN)),
            )
    });
    scored.into_iter().next()
}
