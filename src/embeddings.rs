//! Embeddings
//!
//! The `Embedder` trait is the boundary the rest of the core sees: text
//! in, fixed-length vector out. The default implementation talks to
//! Ollama with an LRU cache in front. Vectors are persisted as
//! little-endian f32 BLOBs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::store::{Entity, Fact};

/// Embedding capability consumed by the pipeline, validator and commands
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a piece of text, or fail; callers treat failure as
    /// "store without embedding, backfill later".
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Ollama embedding client configuration
#[derive(Debug, Clone)]
pub struct OllamaEmbedderConfig {
    pub url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for OllamaEmbedderConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Ollama-backed embedder with LRU query cache
pub struct OllamaEmbedder {
    config: OllamaEmbedderConfig,
    client: reqwest::Client,
    available: AtomicBool,
    cache: Cache<String, Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(config: OllamaEmbedderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");

        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(3600))
            .build();

        Self {
            config,
            client,
            available: AtomicBool::new(true),
            cache,
        }
    }

    /// Probe Ollama; remembered so later calls fail fast
    pub async fn check_availability(&self) -> bool {
        let ok = match self
            .client
            .get(format!("{}/api/tags", self.config.url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        };
        self.available.store(ok, Ordering::Relaxed);
        ok
    }

    /// Last observed availability; rows embedded while this is false
    /// wait for the backfill pass.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.config.url);
        let response = match self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.config.model,
                "prompt": text
            }))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.available.store(false, Ordering::Relaxed);
                return Err(e).context("Failed to send embedding request");
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            self.available.store(false, Ordering::Relaxed);
            anyhow::bail!("Embedding request failed: {}", status);
        }

        let result: OllamaEmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        self.available.store(true, Ordering::Relaxed);
        Ok(result.embedding)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cache_key = text.trim().to_string();

        if let Some(cached) = self.cache.get(&cache_key).await {
            return Ok(cached);
        }

        let embedding = self.embed_uncached(text).await?;
        self.cache.insert(cache_key, embedding.clone()).await;
        Ok(embedding)
    }
}

/// Text an entity's embedding is computed over: the name plus its facts,
/// so similarity reflects what is known, not just the label.
pub fn entity_embedding_text(entity: &Entity, facts: &[Fact]) -> String {
    let mut text = entity.name.clone();
    for fact in facts {
        text.push_str(". ");
        text.push_str(&fact.content);
    }
    text
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Serialize embedding to bytes for SQLite BLOB storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize embedding from bytes
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Embed text, degrading to None on failure so the caller can store the
/// row and leave backfill to a later pass.
pub async fn try_embed(embedder: &dyn Embedder, text: &str) -> Option<Vec<f32>> {
    match embedder.embed(text).await {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Embedding failed, storing without vector: {}", e);
            None
        }
    }
}
