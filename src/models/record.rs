//! Discovered catalog items and the deduplicating set that holds them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error constructing a [`Record`].
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid record url `{0}`: {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("record url `{0}` is not http(s)")]
    UnsupportedScheme(String),

    #[error("record for `{0}` has no usable filename")]
    EmptyFilename(String),
}

/// A downloadable item discovered in the catalog.
///
/// The URL is the record's identity. The filename comes from link text (or
/// the URL tail) and is not filesystem-safe until sanitized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub url: String,
    pub filename: String,
    /// Originating dataset or category label. Cosmetic only, never part of
    /// identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

impl Record {
    /// Validate and build a record. The URL must be absolute http(s); an
    /// empty filename falls back to the URL's last path segment.
    pub fn new(
        url: impl Into<String>,
        filename: impl Into<String>,
        dataset: Option<String>,
    ) -> Result<Self, RecordError> {
        let url = url.into();
        let parsed =
            url::Url::parse(&url).map_err(|e| RecordError::InvalidUrl(url.clone(), e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RecordError::UnsupportedScheme(url));
        }

        let mut filename = filename.into().trim().to_string();
        if filename.is_empty() {
            filename = parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default()
                .to_string();
        }
        if filename.is_empty() {
            return Err(RecordError::EmptyFilename(url));
        }

        Ok(Self {
            url,
            filename,
            dataset: dataset.filter(|d| !d.trim().is_empty()),
        })
    }
}

/// Insertion-ordered set of unique records keyed by URL.
///
/// Merging is last-write-wins on the mutable fields; an entry's position is
/// fixed at first appearance. Consumers must not rely on any ordering beyond
/// "the same URL never appears twice".
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    records: Vec<Record>,
    index: HashMap<String, usize>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut set = Self::new();
        set.merge(records);
        set
    }

    /// Fold records in: new URLs append at the tail, known URLs overwrite
    /// their stored record in place. Pure bookkeeping, no I/O.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Record>) {
        for record in incoming {
            match self.index.get(&record.url) {
                Some(&pos) => self.records[pos] = record,
                None => {
                    self.index.insert(record.url.clone(), self.records.len());
                    self.records.push(record);
                }
            }
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.index.contains_key(url)
    }

    pub fn get(&self, url: &str) -> Option<&Record> {
        self.index.get(url).map(|&pos| &self.records[pos])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, filename: &str) -> Record {
        Record::new(url, filename, None).unwrap()
    }

    #[test]
    fn test_record_rejects_relative_url() {
        assert!(Record::new("/files/a.pdf", "a.pdf", None).is_err());
    }

    #[test]
    fn test_record_rejects_non_http_scheme() {
        assert!(matches!(
            Record::new("ftp://example.com/a.pdf", "a.pdf", None),
            Err(RecordError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_record_filename_falls_back_to_url_tail() {
        let r = Record::new("https://example.com/files/report.pdf", "  ", None).unwrap();
        assert_eq!(r.filename, "report.pdf");
    }

    #[test]
    fn test_record_empty_dataset_becomes_none() {
        let r = Record::new("https://example.com/a.pdf", "a.pdf", Some("  ".into())).unwrap();
        assert_eq!(r.dataset, None);
    }

    #[test]
    fn test_merge_deduplicates_by_url() {
        let mut set = RecordSet::new();
        set.merge([
            record("https://example.com/1.pdf", "1.pdf"),
            record("https://example.com/2.pdf", "2.pdf"),
            record("https://example.com/1.pdf", "1.pdf"),
        ]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_merge_last_write_wins() {
        let mut set = RecordSet::new();
        set.merge([record("https://example.com/1.pdf", "first.pdf")]);
        set.merge([
            Record::new(
                "https://example.com/1.pdf",
                "second.pdf",
                Some("Data Set 2".into()),
            )
            .unwrap(),
        ]);
        assert_eq!(set.len(), 1);
        let stored = set.get("https://example.com/1.pdf").unwrap();
        assert_eq!(stored.filename, "second.pdf");
        assert_eq!(stored.dataset.as_deref(), Some("Data Set 2"));
    }

    #[test]
    fn test_merge_keeps_first_appearance_order() {
        let mut set = RecordSet::new();
        set.merge([
            record("https://example.com/a.pdf", "a.pdf"),
            record("https://example.com/b.pdf", "b.pdf"),
        ]);
        // Re-observing `a` must not move it behind `b`.
        set.merge([record("https://example.com/a.pdf", "a2.pdf")]);
        let urls: Vec<&str> = set.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://example.com/a.pdf", "https://example.com/b.pdf"]
        );
    }
}
