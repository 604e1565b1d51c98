//! Candidate Validator
//!
//! Two gates, applied in order, deciding whether an LLM-proposed entity
//! name may be created. The structural gate is cheap and deterministic
//! and rejects roughly a third of raw candidates with no false
//! positives. The semantic gate is a lower-precision second line of
//! defense: it embeds the candidate and the triggering content and
//! rejects on low cosine similarity. It is known to falsely reject
//! legitimate proper nouns with little lexical relation to the trigger,
//! which is why its threshold is configuration, not a constant.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::embeddings::{cosine_similarity, Embedder};

const MAX_NAME_WORDS: usize = 8;

static TEMPLATE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^}]*\}").unwrap());
static CONFIDENCE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\(?\s*confidence\s*[:=]\s*[\d.]+\s*\)?").unwrap());
static LIST_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d+[.)]\s").unwrap());
static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)https?://|www\.").unwrap());

/// Why a candidate was turned away
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    TooManyWords(usize),
    TemplateArtifact,
    ConfidenceLabel,
    ListMarker,
    ContainsUrl,
    MarkdownMarkup,
    EmbeddedNewline,
    LowSimilarity(f32),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::TooManyWords(n) => write!(f, "too many words ({})", n),
            Rejection::TemplateArtifact => write!(f, "unresolved template token"),
            Rejection::ConfidenceLabel => write!(f, "confidence-score label"),
            Rejection::ListMarker => write!(f, "numeric list marker"),
            Rejection::ContainsUrl => write!(f, "contains a URL"),
            Rejection::MarkdownMarkup => write!(f, "markdown emphasis markers"),
            Rejection::EmbeddedNewline => write!(f, "embedded newline"),
            Rejection::LowSimilarity(s) => write!(f, "similarity {:.2} below threshold", s),
        }
    }
}

/// Structural gate: deterministic, no false positives by design.
pub fn structural_check(name: &str) -> Result<(), Rejection> {
    let trimmed = name.trim();

    if trimmed.contains('\n') || trimmed.contains('\r') {
        return Err(Rejection::EmbeddedNewline);
    }

    let words = trimmed.split_whitespace().count();
    if words > MAX_NAME_WORDS {
        return Err(Rejection::TooManyWords(words));
    }

    if TEMPLATE_TOKEN.is_match(trimmed) {
        return Err(Rejection::TemplateArtifact);
    }
    if CONFIDENCE_LABEL.is_match(trimmed) {
        return Err(Rejection::ConfidenceLabel);
    }
    if LIST_MARKER.is_match(trimmed) {
        return Err(Rejection::ListMarker);
    }
    if URL.is_match(trimmed) {
        return Err(Rejection::ContainsUrl);
    }
    if trimmed.contains('*') || trimmed.contains('_') || trimmed.contains('`') {
        return Err(Rejection::MarkdownMarkup);
    }

    Ok(())
}

/// Candidate validator: structural gate, then semantic gate.
pub struct Validator {
    semantic_threshold: f32,
}

impl Validator {
    pub fn new(semantic_threshold: f32) -> Self {
        Self { semantic_threshold }
    }

    /// Full validation of a proposed new-entity name against the content
    /// that triggered it. Only candidates passing both gates may be
    /// created.
    pub async fn validate(
        &self,
        candidate: &str,
        trigger_content: &str,
        embedder: &dyn Embedder,
    ) -> Result<Result<(), Rejection>> {
        if let Err(rejection) = structural_check(candidate) {
            debug!("Candidate '{}' rejected: {}", candidate, rejection);
            return Ok(Err(rejection));
        }

        let candidate_emb = embedder.embed(candidate).await?;
        let trigger_emb = embedder.embed(trigger_content).await?;
        let similarity = cosine_similarity(&candidate_emb, &trigger_emb);

        if similarity < self.semantic_threshold {
            debug!(
                "Candidate '{}' rejected: similarity {:.2} < {:.2}",
                candidate, similarity, self.semantic_threshold
            );
            return Ok(Err(Rejection::LowSimilarity(similarity)));
        }

        Ok(Ok(()))
    }
}
