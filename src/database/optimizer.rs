//! # Query Optimizer
//!
//! Stateless SQL pattern analysis plus a bounded observation ring:
//! - Normalization: whitespace collapse, literal placeholders, keyword
//!   uppercasing, stable fingerprints
//! - N+1 detection over a sliding window of structural patterns
//! - Index suggestion heuristics from WHERE / JOIN ON / ORDER BY columns
//!
//! Advisory only: the executor feeds observations in and renders the
//! report out; nothing here mutates schema.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").unwrap());
static NUMBER_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap());
static KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(select|insert|update|delete|from|where|join|inner|left|right|outer|on|and|or|not|in|order|group|by|having|limit|offset|values|into|set|as|distinct|union|all|between|like|is|null|create|table|index|drop|alter|exists|case|when|then|else|end|replace|returning)\b",
    )
    .unwrap()
});
static WHERE_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bwhere\b(?P<clause>.*?)(?:\border\b|\bgroup\b|\blimit\b|$)").unwrap()
});
static EQUALITY_PREDICATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b([a-z_][a-z0-9_.]*)\s*=\s*\?").unwrap());
static RANGE_PREDICATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([a-z_][a-z0-9_.]*)\s*(?:<=|>=|<|>|BETWEEN)\s*\?").unwrap()
});
static ORDER_BY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\border\s+by\s+(?P<cols>[a-z0-9_.,\s]+?)(?:\blimit\b|$)").unwrap()
});
static FROM_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:from|into|update|join)\s+([a-z_][a-z0-9_]*)").unwrap()
});

/// Normalize SQL for fingerprinting
///
/// Collapses whitespace, replaces string and numeric literals with `?`,
/// and uppercases keywords. Two executions of the same logical query
/// normalize identically.
pub fn normalize(sql: &str) -> String {
    let collapsed = WHITESPACE.replace_all(sql.trim(), " ");
    let no_strings = STRING_LITERAL.replace_all(&collapsed, "?");
    let no_numbers = NUMBER_LITERAL.replace_all(&no_strings, "?");
    KEYWORD
        .replace_all(&no_numbers, |caps: &regex::Captures| {
            caps[0].to_uppercase()
        })
        .into_owned()
}

/// Stable fingerprint of the normalized form
pub fn fingerprint(sql: &str) -> String {
    let normalized = normalize(sql);
    hex::encode(&Sha256::digest(normalized.as_bytes())[..8])
}

/// Tables referenced by a statement
pub fn referenced_tables(sql: &str) -> HashSet<String> {
    FROM_TABLE
        .captures_iter(sql)
        .map(|caps| caps[1].to_lowercase())
        .collect()
}

/// Whether a statement mutates data or schema
pub fn is_mutation(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    matches!(
        head.as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "CREATE" | "DROP" | "ALTER"
    )
}

// ============================================================================
// N+1 detection
// ============================================================================

/// One aggregated N+1 finding
#[derive(Debug, Clone)]
pub struct NPlusOneFinding {
    /// Structural pattern that repeated
    pub pattern: String,

    /// Occurrences within the window
    pub occurrences: usize,

    /// Window the occurrences fell in
    pub window: Duration,

    /// First table referenced, for the report
    pub table: Option<String>,
}

/// Index suggestion for a repeated access pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSuggestion {
    /// Target table
    pub table: String,

    /// Columns in suggested order: equality, range, then order-by
    pub columns: Vec<String>,
}

impl IndexSuggestion {
    /// Render the advisory `CREATE INDEX` statement
    pub fn create_statement(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.rsplit('.').next().unwrap_or(c).to_string())
            .collect();
        format!(
            "CREATE INDEX idx_{}_{} ON {} ({})",
            self.table,
            cols.join("_"),
            self.table,
            cols.join(", ")
        )
    }
}

/// Finding severity for the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FindingSeverity {
    /// Informational pattern
    Low,
    /// Worth fixing
    Medium,
    /// Actively harmful pattern
    High,
}

/// Optimization report
#[derive(Debug, Clone, Default)]
pub struct OptimizationReport {
    /// Aggregated N+1 findings
    pub n_plus_one: Vec<NPlusOneFinding>,

    /// Suggested indexes with their statements
    pub index_suggestions: Vec<(IndexSuggestion, FindingSeverity)>,

    /// Top patterns by observation count
    pub top_patterns: Vec<(String, usize)>,
}

/// Bounded observation ring with pattern analysis
pub struct QueryOptimizer {
    /// Recent observations: (at, structural pattern)
    history: Mutex<VecDeque<(Instant, String)>>,

    /// Observation counts per pattern
    pattern_counts: Mutex<HashMap<String, usize>>,

    /// Patterns already reported this window
    reported: Mutex<HashSet<String>>,

    /// Ring capacity
    capacity: usize,

    /// Sliding window length
    window: Duration,

    /// Repetitions within the window that trigger a finding
    threshold: usize,

    /// Findings pending collection
    findings: Mutex<Vec<NPlusOneFinding>>,
}

impl QueryOptimizer {
    /// Create an optimizer
    ///
    /// `threshold` structurally-identical queries within `window` produce
    /// one aggregated finding.
    pub fn new(capacity: usize, window: Duration, threshold: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            pattern_counts: Mutex::new(HashMap::new()),
            reported: Mutex::new(HashSet::new()),
            capacity: capacity.max(8),
            window,
            threshold: threshold.max(2),
            findings: Mutex::new(Vec::new()),
        }
    }

    /// Observe one executed statement
    pub fn observe(&self, sql: &str) {
        let pattern = normalize(sql);
        let now = Instant::now();

        *self
            .pattern_counts
            .lock()
            .entry(pattern.clone())
            .or_insert(0) += 1;

        let occurrences = {
            let mut history = self.history.lock();
            history.push_back((now, pattern.clone()));
            while history.len() > self.capacity {
                history.pop_front();
            }
            while let Some((at, _)) = history.front() {
                if now.duration_since(*at) > self.window {
                    history.pop_front();
                } else {
                    break;
                }
            }
            history.iter().filter(|(_, p)| *p == pattern).count()
        };

        if occurrences >= self.threshold && self.reported.lock().insert(pattern.clone()) {
            let finding = NPlusOneFinding {
                table: referenced_tables(&pattern).into_iter().next(),
                pattern,
                occurrences,
                window: self.window,
            };
            log::warn!(
                "repeated query pattern ({} times in {:?}): {}",
                finding.occurrences,
                finding.window,
                finding.pattern
            );
            self.findings.lock().push(finding);
        }
    }

    /// Suggest an index for a statement's access pattern
    ///
    /// Column order: equality predicates, range predicates, then ORDER BY
    /// columns, deduplicated.
    pub fn suggest_index(&self, sql: &str) -> Option<IndexSuggestion> {
        let table = referenced_tables(sql).into_iter().next()?;
        let normalized = normalize(sql);

        let mut columns: Vec<String> = Vec::new();
        let mut push = |col: &str| {
            let col = col.trim().to_lowercase();
            if !col.is_empty() && !columns.contains(&col) {
                columns.push(col);
            }
        };

        if let Some(caps) = WHERE_CLAUSE.captures(&normalized) {
            let clause = &caps["clause"];
            for caps in EQUALITY_PREDICATE.captures_iter(clause) {
                push(&caps[1]);
            }
            for caps in RANGE_PREDICATE.captures_iter(clause) {
                push(&caps[1]);
            }
        }
        if let Some(caps) = ORDER_BY.captures(&normalized) {
            for col in caps["cols"].split(',') {
                push(col.split_whitespace().next().unwrap_or(""));
            }
        }

        if columns.is_empty() {
            None
        } else {
            Some(IndexSuggestion { table, columns })
        }
    }

    /// Build the advisory report and reset the reported-pattern set
    pub fn report(&self) -> OptimizationReport {
        let findings: Vec<NPlusOneFinding> = self.findings.lock().drain(..).collect();
        self.reported.lock().clear();

        let mut top_patterns: Vec<(String, usize)> = self
            .pattern_counts
            .lock()
            .iter()
            .map(|(pattern, count)| (pattern.clone(), *count))
            .collect();
        top_patterns.sort_by(|a, b| b.1.cmp(&a.1));
        top_patterns.truncate(10);

        let index_suggestions = findings
            .iter()
            .filter_map(|finding| {
                self.suggest_index(&finding.pattern).map(|suggestion| {
                    let severity = if finding.occurrences >= self.threshold * 3 {
                        FindingSeverity::High
                    } else {
                        FindingSeverity::Medium
                    };
                    (suggestion, severity)
                })
            })
            .collect();

        OptimizationReport {
            n_plus_one: findings,
            index_suggestions,
            top_patterns,
        }
    }
}
