//! Shared in-process fakes for integration tests. No network, no LLM:
//! each external capability is scripted per test.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use magpie::generation::{
    DuplicateGroup, ExtractedFact, FullIdentification, GenResult, GenerationError, Generator,
    KnownOnlyIdentification,
};
use magpie::search::{SearchError, SearchOutcome, SearchTool};
use magpie::{Embedder, Store};

pub const EMBED_DIM: usize = 8;

pub fn shared_store() -> magpie::SharedStore {
    Arc::new(Mutex::new(
        Store::open_in_memory().expect("in-memory store"),
    ))
}

/// Unit vector along one axis, for scripting exact similarities
pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; EMBED_DIM];
    v[i] = 1.0;
    v
}

/// Normalized sum of axes; cosine against any single member axis is
/// 1/sqrt(n)
pub fn axes(indices: &[usize]) -> Vec<f32> {
    let mut v = vec![0.0; EMBED_DIM];
    for &i in indices {
        v[i] = 1.0;
    }
    let norm = (indices.len() as f32).sqrt();
    v.iter().map(|x| x / norm).collect()
}

/// Deterministic embedder: registered texts return their scripted
/// vector, everything else gets a hash-derived vector that is unlikely
/// to be similar to anything.
#[derive(Default)]
pub struct FakeEmbedder {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, text: &str, vector: Vec<f32>) {
        assert_eq!(vector.len(), EMBED_DIM);
        self.vectors.lock().insert(text.to_string(), vector);
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if let Some(v) = self.vectors.lock().get(text) {
            return Ok(v.clone());
        }
        let mut v = Vec::with_capacity(EMBED_DIM);
        for i in 0..EMBED_DIM {
            let mut hasher = DefaultHasher::new();
            (text, i).hash(&mut hasher);
            v.push((hasher.finish() % 1000) as f32 / 1000.0 - 0.5);
        }
        Ok(v)
    }
}

/// Scripted generator. Identification responses pop FIFO; facts are
/// keyed by entity name and filtered against the caller's known facts.
#[derive(Default)]
pub struct FakeGenerator {
    pub full: Mutex<VecDeque<FullIdentification>>,
    pub known_only: Mutex<VecDeque<KnownOnlyIdentification>>,
    pub facts: Mutex<HashMap<String, Vec<ExtractedFact>>>,
    pub groups: Mutex<Vec<DuplicateGroup>>,
    pub fail: Mutex<bool>,
    pub fail_facts_for: Mutex<Option<String>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_full(&self, identification: FullIdentification) {
        self.full.lock().push_back(identification);
    }

    pub fn push_known_only(&self, identification: KnownOnlyIdentification) {
        self.known_only.lock().push_back(identification);
    }

    pub fn set_facts(&self, entity: &str, facts: &[&str]) {
        self.facts.lock().insert(
            entity.to_string(),
            facts
                .iter()
                .map(|f| ExtractedFact {
                    content: f.to_string(),
                    source_url: None,
                })
                .collect(),
        );
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Fail the next extract_facts call for this entity, then recover
    pub fn fail_facts_once(&self, entity: &str) {
        *self.fail_facts_for.lock() = Some(entity.to_string());
    }

    fn check_fail(&self) -> GenResult<()> {
        if *self.fail.lock() {
            Err(GenerationError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn identify_entities_full(
        &self,
        _content: &str,
        _known_names: &[String],
    ) -> GenResult<FullIdentification> {
        self.check_fail()?;
        Ok(self.full.lock().pop_front().unwrap_or_default())
    }

    async fn identify_entities_known_only(
        &self,
        _content: &str,
        _known_names: &[String],
    ) -> GenResult<KnownOnlyIdentification> {
        self.check_fail()?;
        Ok(self.known_only.lock().pop_front().unwrap_or_default())
    }

    async fn extract_facts(
        &self,
        _content: &str,
        entity_name: &str,
        known_facts: &[String],
    ) -> GenResult<Vec<ExtractedFact>> {
        self.check_fail()?;
        {
            let mut fail_for = self.fail_facts_for.lock();
            if fail_for.as_deref() == Some(entity_name) {
                *fail_for = None;
                return Err(GenerationError::Unavailable);
            }
        }
        let facts = self.facts.lock().get(entity_name).cloned().unwrap_or_default();
        Ok(facts
            .into_iter()
            .filter(|f| !known_facts.contains(&f.content))
            .collect())
    }

    async fn duplicate_groups(&self, _names: &[String]) -> GenResult<Vec<DuplicateGroup>> {
        self.check_fail()?;
        Ok(self.groups.lock().clone())
    }

    async fn learn_queries(&self, topic: &str, max_queries: usize) -> GenResult<Vec<String>> {
        self.check_fail()?;
        let n = max_queries.min(3);
        Ok((1..=n).map(|i| format!("{topic} query {i}")).collect())
    }
}

/// Scripted search tool: pops canned responses, records queries, fails
/// as unavailable once exhausted.
#[derive(Default)]
pub struct FakeSearch {
    pub responses: Mutex<VecDeque<String>>,
    pub queries: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: &str) {
        self.responses.lock().push_back(response.to_string());
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl SearchTool for FakeSearch {
    async fn search(&self, query: &str) -> Result<SearchOutcome, SearchError> {
        self.queries.lock().push(query.to_string());
        match self.responses.lock().pop_front() {
            Some(response) => Ok(SearchOutcome {
                response,
                duration_ms: 5,
            }),
            None => Err(SearchError::Unavailable),
        }
    }
}
