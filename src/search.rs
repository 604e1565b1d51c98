//! Web Search Boundary
//!
//! The core only ever consumes search result text; transport lives
//! behind this trait in the host application.

use async_trait::async_trait;
use std::time::Instant;
use tracing::warn;

/// Search failure classes surfaced to the enrichment loop and commands
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search tool unavailable")]
    Unavailable,

    #[error("search failed: {0}")]
    Failed(String),
}

/// One completed search: the text and how long it took
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub response: String,
    pub duration_ms: i64,
}

/// Web-search capability consumed by the enrichment loop and learn command
#[async_trait]
pub trait SearchTool: Send + Sync {
    async fn search(&self, query: &str) -> Result<SearchOutcome, SearchError>;
}

/// Measure a search call's wall-clock duration
pub async fn timed_search(
    tool: &dyn SearchTool,
    query: &str,
) -> Result<SearchOutcome, SearchError> {
    let started = Instant::now();
    let mut outcome = tool.search(query).await?;
    outcome.duration_ms = started.elapsed().as_millis() as i64;
    Ok(outcome)
}

/// Placeholder for hosts without a search backend; every query fails as
/// unavailable, which the loop treats as "skip this tick".
pub struct NullSearchTool;

#[async_trait]
impl SearchTool for NullSearchTool {
    async fn search(&self, query: &str) -> Result<SearchOutcome, SearchError> {
        warn!("No search backend configured, dropping query: {}", query);
        Err(SearchError::Unavailable)
    }
}
