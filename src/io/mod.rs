//! # Delimited I/O
//!
//! Ingress and egress adapters at the pipeline's edges:
//! - Ingress: CSV rows of `(position, term, type?)` validated into
//!   `VocabularyItem`s, with part-of-speech normalization
//! - Egress: one TSV row per flashcard, written in position order
//!
//! Row validation is forgiving about optional columns and strict about
//! the invariants the orchestrator relies on (positive unique positions,
//! non-empty terms).

use crate::error::{ErrorKind, PipelineError, Result};
use crate::models::{Flashcard, VocabularyItem};
use serde::Deserialize;
use std::path::Path;

/// Raw CSV row shape
#[derive(Debug, Deserialize)]
struct IngressRow {
    #[serde(default)]
    position: Option<usize>,
    term: String,
    #[serde(default, rename = "type")]
    item_type: Option<String>,
}

/// Outcome of reading an input file
#[derive(Debug)]
pub struct IngressReport {
    /// Valid items, positions normalized to `1..=N`
    pub items: Vec<VocabularyItem>,

    /// Rows skipped with their reasons
    pub skipped: Vec<(usize, String)>,
}

/// Read vocabulary items from a CSV file
///
/// Rows missing a position take their row number; rows with an empty
/// term are skipped and reported. `limit` truncates the batch.
pub fn read_vocabulary(path: &Path, limit: Option<usize>) -> Result<IngressReport> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| {
            PipelineError::permanent(
                ErrorKind::Validation,
                format!("cannot read input file {:?}: {}", path, e),
                "io",
            )
        })?;

    let mut items = Vec::new();
    let mut skipped = Vec::new();

    for (index, record) in reader.deserialize::<IngressRow>().enumerate() {
        let row_number = index + 1;
        if let Some(limit) = limit {
            if items.len() >= limit {
                break;
            }
        }

        match record {
            Ok(row) => {
                let position = row.position.unwrap_or(row_number);
                let item = VocabularyItem::new(
                    position,
                    row.term,
                    row.item_type.as_deref().unwrap_or(""),
                );
                match item.validate() {
                    Ok(()) => items.push(item),
                    Err(reason) => skipped.push((row_number, reason)),
                }
            }
            Err(e) => skipped.push((row_number, e.to_string())),
        }
    }

    // Renumber to the contiguous 1..=N the orchestrator requires,
    // keeping the rows in position order
    items.sort_by_key(|item| item.position);
    for (index, item) in items.iter_mut().enumerate() {
        item.position = index + 1;
    }

    if items.is_empty() {
        return Err(PipelineError::permanent(
            ErrorKind::Validation,
            format!("no valid vocabulary rows in {:?}", path),
            "io",
        ));
    }

    Ok(IngressReport { items, skipped })
}

/// Write flashcards as TSV, one row per card, in the order given
pub fn write_flashcards(path: &Path, cards: &[Flashcard]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| {
            PipelineError::system(
                ErrorKind::ResourceExhausted,
                format!("cannot create output file {:?}: {}", path, e),
                "io",
            )
        })?;

    writer
        .write_record([
            "position",
            "term",
            "term_number",
            "tab_name",
            "primer",
            "front",
            "back",
            "tags",
            "honorific_level",
        ])
        .and_then(|_| {
            cards.iter().try_for_each(|card| {
                writer.write_record([
                    card.position.to_string().as_str(),
                    &card.term,
                    card.term_number.to_string().as_str(),
                    &card.tab_name,
                    &card.primer,
                    &card.front,
                    &card.back,
                    &card.tags,
                    &card.honorific_level,
                ])
            })
        })
        .and_then(|_| writer.flush().map_err(csv::Error::from))
        .map_err(|e| {
            PipelineError::system(
                ErrorKind::ResourceExhausted,
                format!("write to {:?} failed: {}", path, e),
                "io",
            )
        })
}

/// Write the five-row sample vocabulary file
pub fn write_example(path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| {
        PipelineError::system(
            ErrorKind::ResourceExhausted,
            format!("cannot create {:?}: {}", path, e),
            "io",
        )
    })?;

    let rows = [
        ("1", "안녕하세요", "phrase"),
        ("2", "감사합니다", "phrase"),
        ("3", "사과", "noun"),
        ("4", "가다", "verb"),
        ("5", "예쁘다", "adjective"),
    ];
    writer
        .write_record(["position", "term", "type"])
        .and_then(|_| {
            rows.iter()
                .try_for_each(|(p, t, k)| writer.write_record([*p, *t, *k]))
        })
        .and_then(|_| writer.flush().map_err(csv::Error::from))
        .map_err(|e| {
            PipelineError::system(
                ErrorKind::ResourceExhausted,
                format!("write to {:?} failed: {}", path, e),
                "io",
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn input_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_read_valid_rows() {
        let file = input_file("position,term,type\n1,사과,noun\n2,가다,v\n");
        let report = read_vocabulary(file.path(), None).unwrap();

        assert_eq!(report.items.len(), 2);
        assert!(report.skipped.is_empty());
        assert_eq!(report.items[0].term, "사과");
        assert_eq!(report.items[1].item_type, "verb");
    }

    #[test]
    fn test_missing_position_uses_row_number() {
        let file = input_file("term,type\n사과,noun\n가다,verb\n");
        let report = read_vocabulary(file.path(), None).unwrap();
        assert_eq!(report.items[0].position, 1);
        assert_eq!(report.items[1].position, 2);
    }

    #[test]
    fn test_invalid_rows_skipped_and_renumbered() {
        let file = input_file("position,term,type\n5,사과,noun\n6,,noun\n9,가다,verb\n");
        let report = read_vocabulary(file.path(), None).unwrap();

        assert_eq!(report.skipped.len(), 1);
        // Sparse positions renumber to 1..=N
        assert_eq!(
            report.items.iter().map(|i| i.position).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_limit_truncates() {
        let file = input_file("term\na\nb\nc\nd\n");
        let report = read_vocabulary(file.path(), Some(2)).unwrap();
        assert_eq!(report.items.len(), 2);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let file = input_file("position,term,type\n");
        let err = read_vocabulary(file.path(), None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_flashcards_round_trip_as_tsv() {
        let out = NamedTempFile::new().unwrap();
        let cards = vec![Flashcard {
            position: 1,
            term: "사과".into(),
            term_number: 1,
            tab_name: "Scene".into(),
            primer: "primer".into(),
            front: "front".into(),
            back: "back".into(),
            tags: "noun".into(),
            honorific_level: String::new(),
        }];

        write_flashcards(out.path(), &cards).unwrap();
        let written = std::fs::read_to_string(out.path()).unwrap();
        let mut lines = written.lines();
        assert!(lines.next().unwrap().starts_with("position\tterm"));
        let row = lines.next().unwrap();
        assert!(row.contains("사과") && row.contains("Scene"));
    }

    #[test]
    fn test_example_file() {
        let out = NamedTempFile::new().unwrap();
        write_example(out.path()).unwrap();
        let report = read_vocabulary(out.path(), None).unwrap();
        assert_eq!(report.items.len(), 5);
    }
}
