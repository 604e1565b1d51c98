//! Knowledge Store
//!
//! SQLite persistence for entities, facts, search records, learn prompts,
//! engagements, preferences and the message inbox. Embeddings are stored
//! as little-endian f32 BLOBs and compared with brute-force cosine, which
//! is fine at per-user cardinality (hundreds of entities).
//!
//! All mutation goes through one connection behind a mutex; the tick
//! orchestrator guarantees a single writer per user.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::embeddings::{cosine_similarity, embedding_from_bytes, embedding_to_bytes};

/// Provenance tag on a search record; immutable after creation and
/// determines the extraction mode for that record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    UserMessage,
    LearnCommand,
    AutonomousEnrichment,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::UserMessage => "user_message",
            Trigger::LearnCommand => "learn_command",
            Trigger::AutonomousEnrichment => "autonomous_enrichment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_message" => Some(Trigger::UserMessage),
            "learn_command" => Some(Trigger::LearnCommand),
            "autonomous_enrichment" => Some(Trigger::AutonomousEnrichment),
            _ => None,
        }
    }
}

/// Interest signal type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementKind {
    SearchInitiated,
    FollowUpQuestion,
    ExplicitLike,
    ExplicitDislike,
    Reaction,
}

impl EngagementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementKind::SearchInitiated => "search_initiated",
            EngagementKind::FollowUpQuestion => "follow_up_question",
            EngagementKind::ExplicitLike => "explicit_like",
            EngagementKind::ExplicitDislike => "explicit_dislike",
            EngagementKind::Reaction => "reaction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "search_initiated" => Some(EngagementKind::SearchInitiated),
            "follow_up_question" => Some(EngagementKind::FollowUpQuestion),
            "explicit_like" => Some(EngagementKind::ExplicitLike),
            "explicit_dislike" => Some(EngagementKind::ExplicitDislike),
            "reaction" => Some(EngagementKind::Reaction),
            _ => None,
        }
    }
}

/// A named real-world thing the system has knowledge about
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub user_id: i64,
    /// Canonical name: lowercased, trimmed, unique per user
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    /// Covers name + summarized facts; null until backfilled
    pub embedding: Option<Vec<f32>>,
}

/// One atomic statement about an entity, with provenance
#[derive(Debug, Clone)]
pub struct Fact {
    pub id: String,
    pub entity_id: String,
    pub content: String,
    pub source_url: Option<String>,
    pub search_record_id: Option<String>,
    pub message_id: Option<String>,
    pub learned_at: i64,
    pub embedding: Option<Vec<f32>>,
}

/// Result of one web search
#[derive(Debug, Clone)]
pub struct SearchRecord {
    pub id: String,
    pub user_id: i64,
    pub query: String,
    pub response: String,
    pub duration_ms: i64,
    pub trigger: Trigger,
    pub extracted: bool,
    pub learn_prompt_id: Option<String>,
    /// Entity an autonomous enrichment search was issued for
    pub entity_id: Option<String>,
    pub attempts: i64,
    pub created_at: i64,
}

/// A user-issued research directive
#[derive(Debug, Clone)]
pub struct LearnPrompt {
    pub id: String,
    pub user_id: i64,
    pub prompt: String,
    pub completed: bool,
    pub searches_remaining: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Timestamped interest signal; append-only
#[derive(Debug, Clone)]
pub struct Engagement {
    pub id: String,
    pub user_id: i64,
    pub entity_id: Option<String>,
    pub preference_id: Option<String>,
    pub kind: EngagementKind,
    /// +1 positive, -1 negative, 0 neutral
    pub valence: i64,
    pub strength: f64,
    pub message_id: Option<String>,
    pub created_at: i64,
}

/// Explicit like/dislike topic with its own embedding
#[derive(Debug, Clone)]
pub struct Preference {
    pub id: String,
    pub user_id: i64,
    pub topic: String,
    pub liked: bool,
    pub embedding: Option<Vec<f32>>,
    pub created_at: i64,
}

/// Inbound chat message awaiting extraction
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub user_id: i64,
    pub content: String,
    pub processed: bool,
    pub attempts: i64,
    pub created_at: i64,
}

/// Store handle shared across components
pub type SharedStore = Arc<parking_lot::Mutex<Store>>;

/// Knowledge store over a single SQLite connection
pub struct Store {
    conn: Connection,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Canonical entity-name form used for all lookups and uniqueness
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

impl Store {
    /// Open or create the knowledge database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn };
        store.init_schema()?;

        info!("Knowledge store opened: {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                embedding BLOB,
                UNIQUE(user_id, name)
            );

            CREATE INDEX IF NOT EXISTS idx_entities_user ON entities(user_id);

            CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                source_url TEXT,
                search_record_id TEXT,
                message_id TEXT,
                learned_at INTEGER NOT NULL,
                embedding BLOB
            );

            CREATE INDEX IF NOT EXISTS idx_facts_entity ON facts(entity_id);

            CREATE TABLE IF NOT EXISTS search_records (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                query TEXT NOT NULL,
                response TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                trigger_kind TEXT NOT NULL,
                extracted INTEGER NOT NULL DEFAULT 0,
                learn_prompt_id TEXT,
                entity_id TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_search_unextracted
                ON search_records(user_id, extracted);

            CREATE TABLE IF NOT EXISTS learn_prompts (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                prompt TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                searches_remaining INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS engagements (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                entity_id TEXT,
                preference_id TEXT,
                kind TEXT NOT NULL,
                valence INTEGER NOT NULL,
                strength REAL NOT NULL,
                message_id TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_engagements_entity ON engagements(entity_id);
            CREATE INDEX IF NOT EXISTS idx_engagements_user ON engagements(user_id);

            CREATE TABLE IF NOT EXISTS preferences (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                topic TEXT NOT NULL,
                liked INTEGER NOT NULL,
                embedding BLOB,
                created_at INTEGER NOT NULL,
                UNIQUE(user_id, topic)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                content TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_unprocessed
                ON messages(user_id, processed);
            "#,
        )?;

        Ok(())
    }

    // ---- entities ----

    /// Normalize the name and return the existing entity or insert a new
    /// one. A racing insert losing on UNIQUE(user_id, name) is treated as
    /// "found existing". Returns (entity, created).
    pub fn get_or_create_entity(&self, user_id: i64, name: &str) -> Result<(Entity, bool)> {
        let canonical = normalize_name(name);
        if canonical.is_empty() {
            anyhow::bail!("empty entity name");
        }

        if let Some(existing) = self.get_entity_by_name(user_id, &canonical)? {
            return Ok((existing, false));
        }

        let id = new_id();
        let ts = now();
        let inserted = self.conn.execute(
            r#"
            INSERT INTO entities (id, user_id, name, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(user_id, name) DO NOTHING
            "#,
            params![id, user_id, canonical, ts],
        )?;

        if inserted == 0 {
            // Lost the race; the row exists now
            let entity = self
                .get_entity_by_name(user_id, &canonical)?
                .ok_or_else(|| anyhow::anyhow!("entity vanished after conflict: {}", canonical))?;
            return Ok((entity, false));
        }

        debug!("Entity created: {} ({})", canonical, &id[..8]);
        Ok((
            Entity {
                id,
                user_id,
                name: canonical,
                created_at: ts,
                updated_at: ts,
                embedding: None,
            },
            true,
        ))
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let result = self.conn.query_row(
            "SELECT id, user_id, name, created_at, updated_at, embedding
             FROM entities WHERE id = ?1",
            params![id],
            Self::row_to_entity,
        );
        Self::optional(result)
    }

    pub fn get_entity_by_name(&self, user_id: i64, name: &str) -> Result<Option<Entity>> {
        let canonical = normalize_name(name);
        let result = self.conn.query_row(
            "SELECT id, user_id, name, created_at, updated_at, embedding
             FROM entities WHERE user_id = ?1 AND name = ?2",
            params![user_id, canonical],
            Self::row_to_entity,
        );
        Self::optional(result)
    }

    pub fn list_entities(&self, user_id: i64) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, name, created_at, updated_at, embedding
             FROM entities WHERE user_id = ?1 ORDER BY updated_at DESC",
        )?;
        let results = stmt
            .query_map(params![user_id], Self::row_to_entity)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// Names only, for the identification prompt
    pub fn entity_names(&self, user_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM entities WHERE user_id = ?1 ORDER BY name")?;
        let names = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    /// Every user with any state, for scheduler sweeps
    pub fn user_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id FROM entities
             UNION SELECT user_id FROM search_records
             UNION SELECT user_id FROM messages",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn set_entity_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        self.conn.execute(
            "UPDATE entities SET embedding = ?1 WHERE id = ?2",
            params![embedding_to_bytes(embedding), id],
        )?;
        Ok(())
    }

    /// Deletes the entity; facts cascade, engagements keep their weak
    /// reference (scoring skips rows whose entity is gone).
    pub fn delete_entity(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM entities WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Entities whose embedding backfill is pending
    pub fn entities_needing_embeddings(&self, user_id: i64, limit: usize) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, name, created_at, updated_at, embedding
             FROM entities WHERE user_id = ?1 AND embedding IS NULL LIMIT ?2",
        )?;
        let results = stmt
            .query_map(params![user_id, limit], Self::row_to_entity)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// Brute-force cosine over stored entity vectors; rows without an
    /// embedding are excluded until backfill catches up.
    pub fn find_similar_entities(
        &self,
        user_id: i64,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(Entity, f32)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, name, created_at, updated_at, embedding
             FROM entities WHERE user_id = ?1 AND embedding IS NOT NULL",
        )?;

        let mut scored: Vec<(Entity, f32)> = stmt
            .query_map(params![user_id], Self::row_to_entity)?
            .filter_map(|r| r.ok())
            .filter_map(|e| {
                let score = e
                    .embedding
                    .as_deref()
                    .map(|emb| cosine_similarity(query, emb))?;
                Some((e, score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    // ---- facts ----

    pub fn add_fact(
        &self,
        entity_id: &str,
        content: &str,
        source_url: Option<&str>,
        search_record_id: Option<&str>,
        message_id: Option<&str>,
        embedding: Option<&[f32]>,
    ) -> Result<Fact> {
        let id = new_id();
        let ts = now();
        self.conn.execute(
            r#"
            INSERT INTO facts (id, entity_id, content, source_url, search_record_id,
                               message_id, learned_at, embedding)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                id,
                entity_id,
                content,
                source_url,
                search_record_id,
                message_id,
                ts,
                embedding.map(embedding_to_bytes),
            ],
        )?;

        // Learning something bumps the entity's freshness
        self.conn.execute(
            "UPDATE entities SET updated_at = ?1 WHERE id = ?2",
            params![ts, entity_id],
        )?;

        debug!("Fact added to entity {}: {}", &entity_id[..8], content);
        Ok(Fact {
            id,
            entity_id: entity_id.to_string(),
            content: content.to_string(),
            source_url: source_url.map(str::to_string),
            search_record_id: search_record_id.map(str::to_string),
            message_id: message_id.map(str::to_string),
            learned_at: ts,
            embedding: embedding.map(<[f32]>::to_vec),
        })
    }

    pub fn facts_for_entity(&self, entity_id: &str) -> Result<Vec<Fact>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_id, content, source_url, search_record_id, message_id,
                    learned_at, embedding
             FROM facts WHERE entity_id = ?1 ORDER BY learned_at",
        )?;
        let results = stmt
            .query_map(params![entity_id], Self::row_to_fact)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    pub fn fact_count(&self, entity_id: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE entity_id = ?1",
            params![entity_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Facts on the entity whose stored embedding is at least `threshold`
    /// cosine-similar to the query vector.
    pub fn find_similar_facts(
        &self,
        entity_id: &str,
        query: &[f32],
        threshold: f32,
    ) -> Result<Vec<(Fact, f32)>> {
        let facts = self.facts_for_entity(entity_id)?;
        let mut hits: Vec<(Fact, f32)> = facts
            .into_iter()
            .filter_map(|f| {
                let score = f
                    .embedding
                    .as_deref()
                    .map(|emb| cosine_similarity(query, emb))?;
                (score >= threshold).then_some((f, score))
            })
            .collect();
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(hits)
    }

    pub fn set_fact_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        self.conn.execute(
            "UPDATE facts SET embedding = ?1 WHERE id = ?2",
            params![embedding_to_bytes(embedding), id],
        )?;
        Ok(())
    }

    pub fn facts_needing_embeddings(&self, limit: usize) -> Result<Vec<Fact>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_id, content, source_url, search_record_id, message_id,
                    learned_at, embedding
             FROM facts WHERE embedding IS NULL LIMIT ?1",
        )?;
        let results = stmt
            .query_map(params![limit], Self::row_to_fact)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// Cleaner only: move facts from a duplicate entity to the canonical one
    pub fn repoint_facts(&self, from_entity: &str, to_entity: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE facts SET entity_id = ?1 WHERE entity_id = ?2",
            params![to_entity, from_entity],
        )?;
        Ok(rows)
    }

    /// Cleaner only: drop a duplicate fact after a merge
    pub fn delete_fact(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM facts WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ---- search records ----

    #[allow(clippy::too_many_arguments)]
    pub fn add_search_record(
        &self,
        user_id: i64,
        query: &str,
        response: &str,
        duration_ms: i64,
        trigger: Trigger,
        learn_prompt_id: Option<&str>,
        entity_id: Option<&str>,
    ) -> Result<SearchRecord> {
        let id = new_id();
        let ts = now();
        self.conn.execute(
            r#"
            INSERT INTO search_records (id, user_id, query, response, duration_ms,
                                        trigger_kind, learn_prompt_id, entity_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                id,
                user_id,
                query,
                response,
                duration_ms,
                trigger.as_str(),
                learn_prompt_id,
                entity_id,
                ts
            ],
        )?;

        Ok(SearchRecord {
            id,
            user_id,
            query: query.to_string(),
            response: response.to_string(),
            duration_ms,
            trigger,
            extracted: false,
            learn_prompt_id: learn_prompt_id.map(str::to_string),
            entity_id: entity_id.map(str::to_string),
            attempts: 0,
            created_at: ts,
        })
    }

    /// Records still awaiting extraction, oldest first, excluding those
    /// past the attempt cap.
    pub fn unextracted_search_records(
        &self,
        user_id: i64,
        max_attempts: i64,
    ) -> Result<Vec<SearchRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, query, response, duration_ms, trigger_kind, extracted,
                    learn_prompt_id, entity_id, attempts, created_at
             FROM search_records
             WHERE user_id = ?1 AND extracted = 0 AND attempts < ?2
             ORDER BY created_at",
        )?;
        let results = stmt
            .query_map(params![user_id, max_attempts], Self::row_to_search_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// False→true exactly once; a second call is a no-op.
    pub fn mark_extracted(&self, id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE search_records SET extracted = 1 WHERE id = ?1 AND extracted = 0",
            params![id],
        )?;
        Ok(rows > 0)
    }

    pub fn bump_search_attempts(&self, id: &str) -> Result<i64> {
        self.conn.execute(
            "UPDATE search_records SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        let attempts = self.conn.query_row(
            "SELECT attempts FROM search_records WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub fn get_search_record(&self, id: &str) -> Result<Option<SearchRecord>> {
        let result = self.conn.query_row(
            "SELECT id, user_id, query, response, duration_ms, trigger_kind, extracted,
                    learn_prompt_id, entity_id, attempts, created_at
             FROM search_records WHERE id = ?1",
            params![id],
            Self::row_to_search_record,
        );
        Self::optional(result)
    }

    /// Most recent enrichment search issued for the entity; used for
    /// staleness tie-breaking and the briefing "since" date.
    pub fn last_search_time_for_entity(&self, entity_id: &str) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT MAX(created_at) FROM search_records WHERE entity_id = ?1",
            params![entity_id],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(result)
    }

    // ---- learn prompts ----

    pub fn add_learn_prompt(
        &self,
        user_id: i64,
        prompt: &str,
        searches: i64,
    ) -> Result<LearnPrompt> {
        let id = new_id();
        let ts = now();
        self.conn.execute(
            "INSERT INTO learn_prompts (id, user_id, prompt, searches_remaining,
                                        created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, user_id, prompt, searches, ts],
        )?;
        Ok(LearnPrompt {
            id,
            user_id,
            prompt: prompt.to_string(),
            completed: false,
            searches_remaining: searches,
            created_at: ts,
            updated_at: ts,
        })
    }

    pub fn decrement_learn_prompt(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE learn_prompts
             SET searches_remaining = MAX(searches_remaining - 1, 0), updated_at = ?2
             WHERE id = ?1",
            params![id, now()],
        )?;
        Ok(())
    }

    pub fn complete_learn_prompt(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE learn_prompts SET completed = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now()],
        )?;
        Ok(())
    }

    pub fn list_learn_prompts(&self, user_id: i64) -> Result<Vec<LearnPrompt>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, prompt, completed, searches_remaining, created_at, updated_at
             FROM learn_prompts WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let results = stmt
            .query_map(params![user_id], |row| {
                Ok(LearnPrompt {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    prompt: row.get(2)?,
                    completed: row.get::<_, i64>(3)? != 0,
                    searches_remaining: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// Entities reached through the provenance chain
    /// LearnPrompt -> SearchRecord -> Fact -> Entity, with fact counts.
    pub fn learn_prompt_yield(&self, prompt_id: &str) -> Result<Vec<(Entity, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.id, e.user_id, e.name, e.created_at, e.updated_at, e.embedding,
                    COUNT(f.id) AS n
             FROM search_records s
             JOIN facts f ON f.search_record_id = s.id
             JOIN entities e ON e.id = f.entity_id
             WHERE s.learn_prompt_id = ?1
             GROUP BY e.id
             ORDER BY n DESC",
        )?;
        let results = stmt
            .query_map(params![prompt_id], |row| {
                Ok((Self::row_to_entity(row)?, row.get::<_, i64>(6)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    // ---- engagements ----

    #[allow(clippy::too_many_arguments)]
    pub fn add_engagement(
        &self,
        user_id: i64,
        entity_id: Option<&str>,
        preference_id: Option<&str>,
        kind: EngagementKind,
        valence: i64,
        strength: f64,
        message_id: Option<&str>,
    ) -> Result<Engagement> {
        let id = new_id();
        let ts = now();
        self.conn.execute(
            r#"
            INSERT INTO engagements (id, user_id, entity_id, preference_id, kind,
                                     valence, strength, message_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                id,
                user_id,
                entity_id,
                preference_id,
                kind.as_str(),
                valence,
                strength,
                message_id,
                ts
            ],
        )?;
        Ok(Engagement {
            id,
            user_id,
            entity_id: entity_id.map(str::to_string),
            preference_id: preference_id.map(str::to_string),
            kind,
            valence,
            strength,
            message_id: message_id.map(str::to_string),
            created_at: ts,
        })
    }

    pub fn engagements_for_entity(&self, entity_id: &str) -> Result<Vec<Engagement>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, entity_id, preference_id, kind, valence, strength,
                    message_id, created_at
             FROM engagements WHERE entity_id = ?1 ORDER BY created_at",
        )?;
        let results = stmt
            .query_map(params![entity_id], Self::row_to_engagement)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    /// Cleaner only: move engagements to the canonical entity on merge
    pub fn repoint_engagements(&self, from_entity: &str, to_entity: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE engagements SET entity_id = ?1 WHERE entity_id = ?2",
            params![to_entity, from_entity],
        )?;
        Ok(rows)
    }

    // ---- preferences ----

    pub fn upsert_preference(
        &self,
        user_id: i64,
        topic: &str,
        liked: bool,
        embedding: Option<&[f32]>,
    ) -> Result<Preference> {
        let canonical = normalize_name(topic);
        let id = new_id();
        let ts = now();
        self.conn.execute(
            r#"
            INSERT INTO preferences (id, user_id, topic, liked, embedding, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, topic) DO UPDATE SET
                liked = excluded.liked,
                embedding = COALESCE(excluded.embedding, preferences.embedding)
            "#,
            params![
                id,
                user_id,
                canonical,
                liked as i64,
                embedding.map(embedding_to_bytes),
                ts
            ],
        )?;

        let pref = self
            .get_preference(user_id, &canonical)?
            .ok_or_else(|| anyhow::anyhow!("preference missing after upsert: {}", canonical))?;
        Ok(pref)
    }

    pub fn get_preference(&self, user_id: i64, topic: &str) -> Result<Option<Preference>> {
        let canonical = normalize_name(topic);
        let result = self.conn.query_row(
            "SELECT id, user_id, topic, liked, embedding, created_at
             FROM preferences WHERE user_id = ?1 AND topic = ?2",
            params![user_id, canonical],
            Self::row_to_preference,
        );
        Self::optional(result)
    }

    pub fn delete_preference(&self, user_id: i64, topic: &str) -> Result<Option<Preference>> {
        let existing = self.get_preference(user_id, topic)?;
        if let Some(ref pref) = existing {
            self.conn
                .execute("DELETE FROM preferences WHERE id = ?1", params![pref.id])?;
        }
        Ok(existing)
    }

    pub fn list_preferences(&self, user_id: i64) -> Result<Vec<Preference>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, topic, liked, embedding, created_at
             FROM preferences WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let results = stmt
            .query_map(params![user_id], Self::row_to_preference)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    // ---- messages ----

    pub fn add_message(&self, user_id: i64, content: &str) -> Result<StoredMessage> {
        let id = new_id();
        let ts = now();
        self.conn.execute(
            "INSERT INTO messages (id, user_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, user_id, content, ts],
        )?;
        Ok(StoredMessage {
            id,
            user_id,
            content: content.to_string(),
            processed: false,
            attempts: 0,
            created_at: ts,
        })
    }

    pub fn unprocessed_messages(
        &self,
        user_id: i64,
        max_attempts: i64,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, content, processed, attempts, created_at
             FROM messages
             WHERE user_id = ?1 AND processed = 0 AND attempts < ?2
             ORDER BY created_at",
        )?;
        let results = stmt
            .query_map(params![user_id, max_attempts], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    content: row.get(2)?,
                    processed: row.get::<_, i64>(3)? != 0,
                    attempts: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    pub fn mark_message_processed(&self, id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE messages SET processed = 1 WHERE id = ?1 AND processed = 0",
            params![id],
        )?;
        Ok(rows > 0)
    }

    pub fn bump_message_attempts(&self, id: &str) -> Result<i64> {
        self.conn.execute(
            "UPDATE messages SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        let attempts = self.conn.query_row(
            "SELECT attempts FROM messages WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    // ---- row mapping ----

    fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
        let embedding_bytes: Option<Vec<u8>> = row.get(5)?;
        Ok(Entity {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            embedding: embedding_bytes.map(|b| embedding_from_bytes(&b)),
        })
    }

    fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
        let embedding_bytes: Option<Vec<u8>> = row.get(7)?;
        Ok(Fact {
            id: row.get(0)?,
            entity_id: row.get(1)?,
            content: row.get(2)?,
            source_url: row.get(3)?,
            search_record_id: row.get(4)?,
            message_id: row.get(5)?,
            learned_at: row.get(6)?,
            embedding: embedding_bytes.map(|b| embedding_from_bytes(&b)),
        })
    }

    fn row_to_search_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchRecord> {
        let trigger_str: String = row.get(5)?;
        let trigger = Trigger::parse(&trigger_str).unwrap_or_else(|| {
            warn!("Unknown trigger in store: {}", trigger_str);
            Trigger::UserMessage
        });
        Ok(SearchRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            query: row.get(2)?,
            response: row.get(3)?,
            duration_ms: row.get(4)?,
            trigger,
            extracted: row.get::<_, i64>(6)? != 0,
            learn_prompt_id: row.get(7)?,
            entity_id: row.get(8)?,
            attempts: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn row_to_engagement(row: &rusqlite::Row<'_>) -> rusqlite::Result<Engagement> {
        let kind_str: String = row.get(4)?;
        let kind = EngagementKind::parse(&kind_str).unwrap_or(EngagementKind::Reaction);
        Ok(Engagement {
            id: row.get(0)?,
            user_id: row.get(1)?,
            entity_id: row.get(2)?,
            preference_id: row.get(3)?,
            kind,
            valence: row.get(5)?,
            strength: row.get(6)?,
            message_id: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn row_to_preference(row: &rusqlite::Row<'_>) -> rusqlite::Result<Preference> {
        let embedding_bytes: Option<Vec<u8>> = row.get(4)?;
        Ok(Preference {
            id: row.get(0)?,
            user_id: row.get(1)?,
            topic: row.get(2)?,
            liked: row.get::<_, i64>(3)? != 0,
            embedding: embedding_bytes.map(|b| embedding_from_bytes(&b)),
            created_at: row.get(5)?,
        })
    }

    fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
