//! Magpie
//!
//! Personal knowledge graph built up from conversation. A chat adapter
//! feeds messages and search results in; Magpie identifies the entities
//! the user cares about, extracts facts about them, scores interest
//! from engagement signals, and spends idle time researching the
//! entities the user would most want to hear about.
//!
//! # Architecture
//!
//! ```text
//! Chat adapter ──► Commands ──► Store (SQLite)
//!                     │
//!                     ├── Pipeline (identify + extract, trust-gated)
//!                     ├── Enricher (interest-driven idle research)
//!                     ├── Cleaner (duplicate merge, daily)
//!                     └── Governor (notification backoff)
//! ```

pub mod cleaner;
pub mod commands;
pub mod config;
pub mod embeddings;
pub mod enrich;
pub mod extract;
pub mod generation;
pub mod interest;
pub mod notify;
pub mod scheduler;
pub mod search;
pub mod store;
pub mod validator;

pub use cleaner::{CleanReport, Cleaner};
pub use commands::{Commands, EntityDetail, LearnStatus};
pub use config::Config;
pub use embeddings::{
    cosine_similarity, embedding_from_bytes, embedding_to_bytes, Embedder, OllamaEmbedder,
};
pub use enrich::{Enricher, QueryMode};
pub use extract::{ExtractionMode, Pipeline, PipelineStats};
pub use generation::{Generator, OllamaGenerator};
pub use interest::{interest_at, recency_decay, ScoredEntity};
pub use notify::{BackoffGovernor, Discovery, LogNotifier, Notification, Notifier};
pub use scheduler::Scheduler;
pub use search::{NullSearchTool, SearchOutcome, SearchTool};
pub use store::{SharedStore, Store, Trigger};
pub use validator::Validator;
