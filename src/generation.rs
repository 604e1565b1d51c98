//! Structured Generation
//!
//! Typed LLM calls over Ollama. Each operation has its own response
//! schema and the identification call comes in two closed variants: the
//! full one may propose new entities, the known-only one has no `new`
//! slot at all, so autonomous extraction cannot invent entities even if
//! the model tries to.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Structured-generation failure classes
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(String),

    #[error("response did not match schema: {0}")]
    InvalidSchema(String),

    #[error("generation service unavailable")]
    Unavailable,
}

pub type GenResult<T> = Result<T, GenerationError>;

/// A known entity mentioned in the content
#[derive(Debug, Clone, Deserialize)]
pub struct KnownMatch {
    pub name: String,
    /// True when the content is primarily about this entity
    #[serde(default)]
    pub primary: bool,
}

/// A proposed new entity, pre-validation
#[derive(Debug, Clone, Deserialize)]
pub struct NewCandidate {
    pub name: String,
    #[serde(default)]
    pub tagline: String,
}

/// Full-mode identification: known matches plus new candidates
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FullIdentification {
    #[serde(default)]
    pub known: Vec<KnownMatch>,
    #[serde(default)]
    pub new: Vec<NewCandidate>,
}

/// Known-only identification: structurally incapable of carrying
/// new-entity proposals.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KnownOnlyIdentification {
    #[serde(default)]
    pub known: Vec<KnownMatch>,
}

/// One extracted fact
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedFact {
    pub content: String,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// A group of duplicate entities and the name to keep
#[derive(Debug, Clone, Deserialize)]
pub struct DuplicateGroup {
    pub canonical: String,
    pub duplicates: Vec<String>,
}

/// Structured-generation capability consumed by the core
#[async_trait]
pub trait Generator: Send + Sync {
    /// Identify known entities and propose new ones (full mode).
    async fn identify_entities_full(
        &self,
        content: &str,
        known_names: &[String],
    ) -> GenResult<FullIdentification>;

    /// Identify known entities only; the prompt never offers a "new"
    /// slot (known-only mode).
    async fn identify_entities_known_only(
        &self,
        content: &str,
        known_names: &[String],
    ) -> GenResult<KnownOnlyIdentification>;

    /// Extract new facts about one entity, excluding already-known facts
    /// and negative/absence statements.
    async fn extract_facts(
        &self,
        content: &str,
        entity_name: &str,
        known_facts: &[String],
    ) -> GenResult<Vec<ExtractedFact>>;

    /// Group duplicate entity names and pick a canonical form per group.
    async fn duplicate_groups(&self, names: &[String]) -> GenResult<Vec<DuplicateGroup>>;

    /// Turn a learn directive into 3..=max_queries search queries.
    async fn learn_queries(&self, topic: &str, max_queries: usize) -> GenResult<Vec<String>>;
}

/// Ollama generation client configuration
#[derive(Debug, Clone)]
pub struct OllamaGeneratorConfig {
    pub url: String,
    pub model: String,
    pub timeout: Duration,
    /// Retries on top of the first attempt
    pub max_retries: u32,
}

impl Default for OllamaGeneratorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            timeout: Duration::from_secs(60),
            max_retries: 2,
        }
    }
}

/// Ollama-backed structured generator
pub struct OllamaGenerator {
    config: OllamaGeneratorConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

impl OllamaGenerator {
    pub fn new(config: OllamaGeneratorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { config, client }
    }

    /// One raw completion, low temperature for schema stability
    async fn generate(&self, prompt: &str) -> GenResult<String> {
        let url = format!("{}/api/generate", self.config.url);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.config.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": 0.1,
                    "num_predict": 2048,
                }
            }))
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GenerationError::Request(format!(
                "Ollama error {}",
                response.status()
            )));
        }

        let result: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        Ok(result.response.trim().to_string())
    }

    /// Generate and parse, retrying schema-invalid responses up to the
    /// configured budget.
    async fn generate_typed<T: serde::de::DeserializeOwned>(
        &self,
        prompt: &str,
        array: bool,
    ) -> GenResult<T> {
        let mut last_err = GenerationError::Unavailable;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!("Retrying generation, attempt {}", attempt + 1);
            }
            match self.generate(prompt).await {
                Ok(text) => match parse_json_payload::<T>(&text, array) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        warn!("Schema-invalid generation response: {}", e);
                        last_err = e;
                    }
                },
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

/// Pull the first JSON object/array out of model text and deserialize it.
pub fn parse_json_payload<T: serde::de::DeserializeOwned>(
    response: &str,
    array: bool,
) -> GenResult<T> {
    let (open, close) = if array { ('[', ']') } else { ('{', '}') };

    let start = response
        .find(open)
        .ok_or_else(|| GenerationError::InvalidSchema("no JSON payload in response".into()))?;
    let end = response
        .rfind(close)
        .ok_or_else(|| GenerationError::InvalidSchema("unterminated JSON payload".into()))?;
    if end < start {
        return Err(GenerationError::InvalidSchema(
            "malformed JSON payload".into(),
        ));
    }

    serde_json::from_str(&response[start..=end])
        .map_err(|e| GenerationError::InvalidSchema(e.to_string()))
}

fn names_block(known_names: &[String]) -> String {
    if known_names.is_empty() {
        "(none yet)".to_string()
    } else {
        known_names.join(", ")
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn identify_entities_full(
        &self,
        content: &str,
        known_names: &[String],
    ) -> GenResult<FullIdentification> {
        let prompt = format!(
            r#"You track named real-world things (products, companies, people, places) for a user.

Known entities: {}

From the content below, return JSON with two disjoint lists:
- "known": entities from the known list that the content mentions. Mark at most one with "primary": true if the content is mostly about it.
- "new": named things not in the known list, each with a short "tagline".

Only include concrete named things, never generic categories or section headings.

Example: {{"known": [{{"name": "nvidia", "primary": true}}], "new": [{{"name": "KEF LS50 Meta", "tagline": "bookshelf speaker"}}]}}

Content:
{}

JSON only:"#,
            names_block(known_names),
            content
        );

        self.generate_typed(&prompt, false).await
    }

    async fn identify_entities_known_only(
        &self,
        content: &str,
        known_names: &[String],
    ) -> GenResult<KnownOnlyIdentification> {
        // No "new" slot is offered; anything else the model emits is
        // dropped by the schema.
        let prompt = format!(
            r#"You track named real-world things for a user.

Known entities: {}

From the content below, return JSON listing which known entities it mentions. Match only against the known list; do not list anything else.

Example: {{"known": [{{"name": "nvidia"}}]}}

Content:
{}

JSON only:"#,
            names_block(known_names),
            content
        );

        self.generate_typed(&prompt, false).await
    }

    async fn extract_facts(
        &self,
        content: &str,
        entity_name: &str,
        known_facts: &[String],
    ) -> GenResult<Vec<ExtractedFact>> {
        let known_block = if known_facts.is_empty() {
            "(nothing yet)".to_string()
        } else {
            known_facts
                .iter()
                .map(|f| format!("- {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let prompt = format!(
            r#"Extract new, atomic, verifiable facts about "{}" from the content below.

Already known (do NOT restate these):
{}

Rules:
- one statement per fact, specific and checkable
- skip opinions, questions, and anything already known
- never record negative or absence facts ("X does not have Y", "no information about Z")
- include "source_url" when the content names one, else omit it

Example: [{{"content": "Uses a Uni-Q coaxial driver array"}}]

Content:
{}

JSON array only (empty array if nothing new):"#,
            entity_name, known_block, content
        );

        self.generate_typed(&prompt, true).await
    }

    async fn duplicate_groups(&self, names: &[String]) -> GenResult<Vec<DuplicateGroup>> {
        let prompt = format!(
            r#"These entity names belong to one user's knowledge base:
{}

Identify groups that refer to the same real-world thing (abbreviation vs full form, casing or spelling variants). For each group pick the best canonical name from the group.

Example: [{{"canonical": "nvidia", "duplicates": ["nvidia corporation", "nvda"]}}]

Only report genuine duplicates; distinct things that merely share words are not duplicates.

JSON array only (empty array if none):"#,
            names
                .iter()
                .map(|n| format!("- {}", n))
                .collect::<Vec<_>>()
                .join("\n")
        );

        self.generate_typed(&prompt, true).await
    }

    async fn learn_queries(&self, topic: &str, max_queries: usize) -> GenResult<Vec<String>> {
        let prompt = format!(
            r#"A user wants to research: "{}"

Write 3 to {} distinct web search queries that together cover the topic: fundamentals, comparisons or alternatives, and recent developments.

JSON array of strings only:"#,
            topic, max_queries
        );

        let queries: Vec<String> = self.generate_typed(&prompt, true).await?;
        if queries.is_empty() {
            return Err(GenerationError::InvalidSchema(
                "no search queries generated".into(),
            ));
        }
        Ok(queries.into_iter().take(max_queries).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_with_surrounding_prose() {
        let text = "Sure! Here you go:\n{\"known\": [{\"name\": \"nvidia\"}]}\nHope that helps.";
        let parsed: KnownOnlyIdentification = parse_json_payload(text, false).unwrap();
        assert_eq!(parsed.known.len(), 1);
        assert_eq!(parsed.known[0].name, "nvidia");
    }

    #[test]
    fn test_parse_payload_array() {
        let text = "[{\"content\": \"Founded in 1993\"}]";
        let parsed: Vec<ExtractedFact> = parse_json_payload(text, true).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].source_url.is_none());
    }

    #[test]
    fn test_parse_payload_missing_json() {
        let err = parse_json_payload::<Vec<ExtractedFact>>("no json here", true).unwrap_err();
        assert!(matches!(err, GenerationError::InvalidSchema(_)));
    }

    #[test]
    fn test_known_only_schema_drops_new_slot() {
        // Even if the model disobeys and emits "new", the closed schema
        // cannot carry it.
        let text = r#"{"known": [{"name": "nvidia"}], "new": [{"name": "Sanofi"}]}"#;
        let parsed: KnownOnlyIdentification = parse_json_payload(text, false).unwrap();
        assert_eq!(parsed.known.len(), 1);
    }
}
