//! # Error Analytics
//!
//! Windowed aggregation over collected error records:
//! - Totals and breakdowns by category, severity, and fingerprint
//! - Trend series at configurable bucket granularity
//! - Impact score (occurrences x severity weight x affected positions)

use crate::error::{ErrorCategory, ErrorRecord, Severity};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One bucket in a trend series
#[derive(Debug, Clone, PartialEq)]
pub struct TrendPoint {
    /// Bucket start time
    pub bucket: DateTime<Utc>,

    /// Records in the bucket
    pub count: u64,
}

/// Aggregated view over a time window
#[derive(Debug, Clone, Default)]
pub struct ErrorReport {
    /// Total records in the window
    pub total: u64,

    /// Counts by category
    pub by_category: HashMap<ErrorCategory, u64>,

    /// Counts by severity
    pub by_severity: HashMap<Severity, u64>,

    /// Counts by fingerprint, with a representative message
    pub by_fingerprint: BTreeMap<String, FingerprintGroup>,

    /// Impact score: sum over fingerprints of
    /// occurrences x severity weight x affected positions
    pub impact_score: u64,
}

impl ErrorReport {
    /// Fingerprints sorted by descending occurrence count
    pub fn top_fingerprints(&self, limit: usize) -> Vec<(&String, &FingerprintGroup)> {
        let mut groups: Vec<_> = self.by_fingerprint.iter().collect();
        groups.sort_by(|a, b| b.1.count.cmp(&a.1.count));
        groups.truncate(limit);
        groups
    }

    /// Worst category present, for exit-code selection
    pub fn worst_category(&self) -> Option<ErrorCategory> {
        // System outranks transient which outranks the rest
        for category in [
            ErrorCategory::System,
            ErrorCategory::Transient,
            ErrorCategory::Business,
            ErrorCategory::Permanent,
            ErrorCategory::Degraded,
        ] {
            if self.by_category.get(&category).copied().unwrap_or(0) > 0 {
                return Some(category);
            }
        }
        None
    }
}

/// Grouped records sharing one fingerprint
#[derive(Debug, Clone)]
pub struct FingerprintGroup {
    /// Occurrences in the window
    pub count: u64,

    /// Severity of the group (max observed)
    pub severity: Severity,

    /// Representative message (first observed)
    pub message: String,

    /// Distinct affected positions, from the `position` context key
    pub affected_positions: u64,
}

/// Windowed analytics over error records
pub struct ErrorAnalytics;

impl ErrorAnalytics {
    /// Aggregate the records that fall inside `[since, now]`
    pub fn report(records: &[ErrorRecord], since: DateTime<Utc>) -> ErrorReport {
        let mut report = ErrorReport::default();
        let mut positions: HashMap<String, HashSet<String>> = HashMap::new();

        for record in records.iter().filter(|r| r.timestamp >= since) {
            report.total += 1;
            *report.by_category.entry(record.category).or_insert(0) += 1;
            *report.by_severity.entry(record.severity).or_insert(0) += 1;

            let group = report
                .by_fingerprint
                .entry(record.fingerprint.clone())
                .or_insert_with(|| FingerprintGroup {
                    count: 0,
                    severity: record.severity,
                    message: record.message.clone(),
                    affected_positions: 0,
                });
            group.count += 1;
            group.severity = group.severity.max(record.severity);

            if let Some(position) = record.context.get("position") {
                positions
                    .entry(record.fingerprint.clone())
                    .or_default()
                    .insert(position.clone());
            }
        }

        for (fingerprint, group) in report.by_fingerprint.iter_mut() {
            group.affected_positions = positions
                .get(fingerprint)
                .map(|set| set.len() as u64)
                .unwrap_or(0);
            // A group with no position context still affected the batch once
            let affected = group.affected_positions.max(1);
            report.impact_score += group.count * group.severity.weight() as u64 * affected;
        }

        report
    }

    /// Bucketed trend series at `granularity` over `[since, now]`
    pub fn trend(
        records: &[ErrorRecord],
        since: DateTime<Utc>,
        granularity: ChronoDuration,
    ) -> Vec<TrendPoint> {
        let granularity_secs = granularity.num_seconds().max(1);
        let mut buckets: BTreeMap<i64, u64> = BTreeMap::new();

        for record in records.iter().filter(|r| r.timestamp >= since) {
            let offset = (record.timestamp - since).num_seconds() / granularity_secs;
            *buckets.entry(offset).or_insert(0) += 1;
        }

        buckets
            .into_iter()
            .map(|(offset, count)| TrendPoint {
                bucket: since + ChronoDuration::seconds(offset * granularity_secs),
                count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, PipelineError};

    fn record(message: &str, position: Option<&str>) -> ErrorRecord {
        let mut err = PipelineError::transient(ErrorKind::Network, message.to_string(), "test");
        if let Some(p) = position {
            err = err.with_context("position", p);
        }
        err.to_record()
    }

    #[test]
    fn test_report_totals_and_breakdowns() {
        let records = vec![
            record("reset", Some("1")),
            record("reset", Some("2")),
            record("other failure mode", None),
        ];
        let report = ErrorAnalytics::report(&records, Utc::now() - ChronoDuration::hours(1));

        assert_eq!(report.total, 3);
        assert_eq!(
            report.by_category.get(&ErrorCategory::Transient).copied(),
            Some(3)
        );
        // "reset" groups into one fingerprint with 2 occurrences
        let top = report.top_fingerprints(1);
        assert_eq!(top[0].1.count, 2);
        assert_eq!(top[0].1.affected_positions, 2);
    }

    #[test]
    fn test_window_excludes_old_records() {
        let mut old = record("stale", None);
        old.timestamp = Utc::now() - ChronoDuration::hours(2);
        let records = vec![old, record("fresh", None)];

        let report = ErrorAnalytics::report(&records, Utc::now() - ChronoDuration::hours(1));
        assert_eq!(report.total, 1);
    }

    #[test]
    fn test_impact_score_scales_with_positions() {
        let narrow = ErrorAnalytics::report(
            &[record("reset", Some("1"))],
            Utc::now() - ChronoDuration::hours(1),
        );
        let wide = ErrorAnalytics::report(
            &[
                record("reset", Some("1")),
                record("reset", Some("2")),
                record("reset", Some("3")),
            ],
            Utc::now() - ChronoDuration::hours(1),
        );
        assert!(wide.impact_score > narrow.impact_score);
    }

    #[test]
    fn test_trend_bucketing() {
        let since = Utc::now() - ChronoDuration::minutes(10);
        let mut a = record("a", None);
        a.timestamp = since + ChronoDuration::seconds(30);
        let mut b = record("b", None);
        b.timestamp = since + ChronoDuration::seconds(45);
        let mut c = record("c", None);
        c.timestamp = since + ChronoDuration::seconds(150);

        let trend = ErrorAnalytics::trend(&[a, b, c], since, ChronoDuration::seconds(60));
        assert_eq!(trend.len(), 2);
        assert_eq!(trend[0].count, 2);
        assert_eq!(trend[1].count, 1);
    }

    #[test]
    fn test_worst_category() {
        let mut report = ErrorReport::default();
        report.by_category.insert(ErrorCategory::Degraded, 2);
        assert_eq!(report.worst_category(), Some(ErrorCategory::Degraded));

        report.by_category.insert(ErrorCategory::System, 1);
        assert_eq!(report.worst_category(), Some(ErrorCategory::System));
    }
}
