//! Configuration management
//!
//! All tunables come from environment variables with sensible defaults.
//! Thresholds with a documented precision/recall trade-off (semantic
//! validator, enrichment breakpoints) are deliberately configurable
//! rather than hard-coded.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Ollama URL for generation + embeddings
    pub ollama_url: String,

    /// Generation model name
    pub generation_model: String,

    /// Embedding model name
    pub embedding_model: String,

    /// SQLite database path for the knowledge store
    pub db_path: PathBuf,

    /// Minimum cosine similarity between a proposed entity name and the
    /// triggering content. Known to falsely reject legitimate proper
    /// nouns with low lexical overlap; kept configurable for that reason.
    pub semantic_threshold: f32,

    /// Cosine similarity above which two facts on the same entity are
    /// considered duplicates.
    pub fact_dedup_threshold: f32,

    /// Cosine similarity for entity/preference relatedness lookups.
    pub entity_similarity_threshold: f32,

    /// Interest decay half-life in days.
    pub interest_half_life_days: f64,

    /// Entities with fewer facts than this get broad enrichment queries.
    pub enrich_broad_max_facts: i64,

    /// Entities with fewer facts than this (and at least the broad
    /// cutoff) get gap-targeted queries; above it, briefing queries.
    pub enrich_targeted_max_facts: i64,

    /// Extraction attempts per record before it is logged and skipped.
    pub max_extraction_attempts: i64,

    /// First non-zero notification delay; doubles per unacknowledged send.
    pub notify_base_delay: Duration,

    /// Generation call timeout.
    pub generation_timeout: Duration,

    /// Retries per generation call (on top of the first attempt).
    pub generation_retries: u32,

    /// Upper bound on searches generated per learn command.
    pub learn_max_searches: usize,

    /// Scheduler pass interval (extraction, notifications, enrichment).
    pub tick_interval: Duration,

    /// Cleaner + embedding-backfill sweep interval.
    pub clean_interval: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let db_path = std::env::var("MAGPIE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("magpie.db"));

        Ok(Self {
            ollama_url: std::env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            generation_model: std::env::var("MAGPIE_GENERATION_MODEL")
                .unwrap_or_else(|_| "llama3.2:3b".to_string()),
            embedding_model: std::env::var("MAGPIE_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            db_path,
            semantic_threshold: env_parse("MAGPIE_SEMANTIC_THRESHOLD", 0.35),
            fact_dedup_threshold: env_parse("MAGPIE_FACT_DEDUP_THRESHOLD", 0.85),
            entity_similarity_threshold: env_parse("MAGPIE_ENTITY_SIMILARITY_THRESHOLD", 0.55),
            interest_half_life_days: env_parse("MAGPIE_INTEREST_HALF_LIFE_DAYS", 30.0),
            enrich_broad_max_facts: env_parse("MAGPIE_ENRICH_BROAD_MAX", 5),
            enrich_targeted_max_facts: env_parse("MAGPIE_ENRICH_TARGETED_MAX", 15),
            max_extraction_attempts: env_parse("MAGPIE_MAX_EXTRACTION_ATTEMPTS", 3),
            notify_base_delay: Duration::from_secs(env_parse("MAGPIE_NOTIFY_BASE_DELAY_SECS", 60)),
            generation_timeout: Duration::from_secs(env_parse("MAGPIE_GENERATION_TIMEOUT_SECS", 60)),
            generation_retries: env_parse("MAGPIE_GENERATION_RETRIES", 2),
            learn_max_searches: env_parse("MAGPIE_LEARN_MAX_SEARCHES", 5),
            tick_interval: Duration::from_secs(env_parse("MAGPIE_TICK_SECS", 30)),
            clean_interval: Duration::from_secs(env_parse("MAGPIE_CLEAN_SECS", 86_400)),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            generation_model: "llama3.2:3b".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            db_path: PathBuf::from("magpie.db"),
            semantic_threshold: 0.35,
            fact_dedup_threshold: 0.85,
            entity_similarity_threshold: 0.55,
            interest_half_life_days: 30.0,
            enrich_broad_max_facts: 5,
            enrich_targeted_max_facts: 15,
            max_extraction_attempts: 3,
            notify_base_delay: Duration::from_secs(60),
            generation_timeout: Duration::from_secs(60),
            generation_retries: 2,
            learn_max_searches: 5,
            tick_interval: Duration::from_secs(30),
            clean_interval: Duration::from_secs(86_400),
        }
    }
}
