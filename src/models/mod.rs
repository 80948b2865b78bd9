//! # Data Models
//!
//! Input and output records for the flashcard pipeline:
//! - `VocabularyItem`: one input row, immutable after creation
//! - `Flashcard`: one generated study card row
//! - `ProcessingOutcome`: closed sum over success, cache hit, and failure
//! - `ProcessingResult`: per-item output with timings and cache provenance
//!
//! Part-of-speech tags are normalized through a static abbreviation table;
//! unrecognized tags fall back to `"unknown"`.

use crate::error::ErrorRecord;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Abbreviation table for part-of-speech tags
static TYPE_ABBREVIATIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert("n", "noun");
    table.insert("noun", "noun");
    table.insert("v", "verb");
    table.insert("verb", "verb");
    table.insert("adj", "adjective");
    table.insert("adjective", "adjective");
    table.insert("adv", "adverb");
    table.insert("adverb", "adverb");
    table.insert("phr", "phrase");
    table.insert("phrase", "phrase");
    table.insert("int", "interjection");
    table.insert("interjection", "interjection");
    table.insert("part", "particle");
    table.insert("particle", "particle");
    table.insert("num", "numeral");
    table.insert("numeral", "numeral");
    table.insert("pron", "pronoun");
    table.insert("pronoun", "pronoun");
    table.insert("det", "determiner");
    table.insert("determiner", "determiner");
    table
});

/// Normalize a part-of-speech tag via the abbreviation table
///
/// Returns the canonical name, or `"unknown"` for empty and unrecognized
/// tags. Matching is case-insensitive and ignores surrounding whitespace.
pub fn normalize_type(raw: &str) -> &'static str {
    let trimmed = raw.trim().to_lowercase();
    TYPE_ABBREVIATIONS.get(trimmed.as_str()).copied().unwrap_or("unknown")
}

// ============================================================================
// Input
// ============================================================================

/// One input vocabulary record
///
/// Immutable after creation; `position` is unique within a batch and
/// drives output ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VocabularyItem {
    /// 1-based position within the batch
    pub position: usize,

    /// The term to analyze (non-empty Unicode)
    pub term: String,

    /// Normalized part-of-speech tag
    #[serde(rename = "type")]
    pub item_type: String,
}

impl VocabularyItem {
    /// Create an item, normalizing the type tag
    pub fn new(position: usize, term: impl Into<String>, item_type: &str) -> Self {
        Self {
            position,
            term: term.into(),
            item_type: normalize_type(item_type).to_string(),
        }
    }

    /// Validate the invariants the ingress adapter enforces
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.position == 0 {
            return Err("position must be a positive integer".to_string());
        }
        if self.term.trim().is_empty() {
            return Err("term must not be empty".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Output
// ============================================================================

/// One generated flashcard row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flashcard {
    /// Position of the source vocabulary item
    pub position: usize,

    /// Source term
    pub term: String,

    /// Card index within the term (1-based)
    pub term_number: usize,

    /// Deck tab the card belongs to
    pub tab_name: String,

    /// Optional primer shown before the front
    #[serde(default)]
    pub primer: String,

    /// Card front
    pub front: String,

    /// Card back
    pub back: String,

    /// Comma-separated tags
    #[serde(default)]
    pub tags: String,

    /// Honorific register, when applicable
    #[serde(default)]
    pub honorific_level: String,
}

/// Wall-clock timings for the two stages, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    /// Stage-1 (linguistic analysis) duration
    pub stage1_ms: u64,

    /// Stage-2 (flashcard generation) duration
    pub stage2_ms: u64,
}

impl StageTimings {
    /// Combined duration across both stages
    pub fn total_ms(&self) -> u64 {
        self.stage1_ms + self.stage2_ms
    }
}

/// Token usage reported by the external service for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed
    pub input_tokens: u64,

    /// Completion tokens produced
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Total tokens for quota accounting
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Sum two usages
    pub fn add(&self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
        }
    }
}

/// Closed outcome of processing one item
///
/// Exhaustive handling at emission: there is no partially-successful
/// state, and a cache hit is distinguished from a fresh computation.
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    /// Both stages completed against the external service
    Success(Vec<Flashcard>),

    /// Served entirely from cache
    Cached(Vec<Flashcard>),

    /// Processing failed; the record captures the failure
    Failed(ErrorRecord),
}

impl ProcessingOutcome {
    /// Whether the item produced flashcards
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingOutcome::Success(_) | ProcessingOutcome::Cached(_))
    }

    /// Flashcards, when present
    pub fn flashcards(&self) -> Option<&[Flashcard]> {
        match self {
            ProcessingOutcome::Success(cards) | ProcessingOutcome::Cached(cards) => Some(cards),
            ProcessingOutcome::Failed(_) => None,
        }
    }
}

/// Per-item output record; lifetime = batch
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    /// Position of the source item
    pub position: usize,

    /// Source term
    pub term: String,

    /// Outcome of the two-stage composition
    pub outcome: ProcessingOutcome,

    /// Whether any stage was served from cache
    pub from_cache: bool,

    /// Stage timings
    pub timings: StageTimings,

    /// Token usage across both stages (zero on cache hits and failures)
    pub tokens: TokenUsage,
}

impl ProcessingResult {
    /// Failure constructor
    pub fn failed(position: usize, term: impl Into<String>, record: ErrorRecord) -> Self {
        Self {
            position,
            term: term.into(),
            outcome: ProcessingOutcome::Failed(record),
            from_cache: false,
            timings: StageTimings::default(),
            tokens: TokenUsage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, PipelineError};

    #[test]
    fn test_type_normalization() {
        assert_eq!(normalize_type("n"), "noun");
        assert_eq!(normalize_type("ADJ"), "adjective");
        assert_eq!(normalize_type(" verb "), "verb");
        assert_eq!(normalize_type("xyz"), "unknown");
        assert_eq!(normalize_type(""), "unknown");
    }

    #[test]
    fn test_item_validation() {
        assert!(VocabularyItem::new(1, "사과", "noun").validate().is_ok());
        assert!(VocabularyItem::new(0, "사과", "noun").validate().is_err());
        assert!(VocabularyItem::new(1, "   ", "noun").validate().is_err());
    }

    #[test]
    fn test_item_type_normalized_on_construction() {
        let item = VocabularyItem::new(3, "가다", "v");
        assert_eq!(item.item_type, "verb");
    }

    #[test]
    fn test_outcome_accessors() {
        let card = Flashcard {
            position: 1,
            term: "사과".to_string(),
            term_number: 1,
            tab_name: "Scene".to_string(),
            primer: String::new(),
            front: "front".to_string(),
            back: "back".to_string(),
            tags: "noun".to_string(),
            honorific_level: String::new(),
        };

        let success = ProcessingOutcome::Success(vec![card.clone()]);
        assert!(success.is_success());
        assert_eq!(success.flashcards().map(<[Flashcard]>::len), Some(1));

        let cached = ProcessingOutcome::Cached(vec![card]);
        assert!(cached.is_success());

        let record =
            PipelineError::transient(ErrorKind::Timeout, "timed out", "test").to_record();
        let failed = ProcessingOutcome::Failed(record);
        assert!(!failed.is_success());
        assert!(failed.flashcards().is_none());
    }

    #[test]
    fn test_token_usage_arithmetic() {
        let a = TokenUsage { input_tokens: 100, output_tokens: 50 };
        let b = TokenUsage { input_tokens: 10, output_tokens: 5 };
        let sum = a.add(b);
        assert_eq!(sum.total(), 165);
    }
}
