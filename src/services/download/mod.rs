//! Idempotent PDF download engine.
//!
//! Every attempt runs the same short-circuit decision tree against the
//! ledger and the filesystem before touching the network, so re-running a
//! batch never repeats committed work. Separated from UI concerns — callers
//! render progress from the returned tallies.

pub mod pool;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::models::Record;
use crate::scrapers::SessionFetch;
use crate::store::DownloadLedger;

/// Magic bytes every valid payload must start with. Guards against HTML
/// error pages served with 200 OK.
const PDF_MAGIC: &[u8] = b"%PDF";

/// Tri-state result of one download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// New bytes written and ledger updated.
    Downloaded,
    /// Already satisfied: in the ledger, permanently failed, or on disk.
    Skipped,
    /// Retry-eligible failure; nothing persisted.
    TransientError,
}

/// Downloads records through the authenticated session, keeping the ledger
/// and the files on disk consistent.
pub struct DownloadService {
    fetcher: Arc<dyn SessionFetch>,
    ledger: Arc<DownloadLedger>,
    downloads_dir: PathBuf,
}

impl DownloadService {
    pub fn new(
        fetcher: Arc<dyn SessionFetch>,
        ledger: Arc<DownloadLedger>,
        downloads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            ledger,
            downloads_dir: downloads_dir.into(),
        }
    }

    pub fn ledger(&self) -> &Arc<DownloadLedger> {
        &self.ledger
    }

    fn target_path(&self, filename: &str) -> PathBuf {
        self.downloads_dir.join(normalize_pdf_filename(filename))
    }

    /// Attempt one record.
    ///
    /// Decision order, cheapest checks first: downloaded-ledger hit and
    /// failed-ledger hit skip without I/O; a file already on disk is
    /// reconciled into the ledger (it may predate a crash that lost the
    /// ledger append); only then is the network consulted. A 404 is recorded
    /// as permanent — expected noise from a large catalog, not an alarming
    /// error. Any other non-2xx status or a non-PDF payload is transient and
    /// leaves no trace, so a later pass can retry.
    pub async fn attempt(&self, record: &Record) -> DownloadOutcome {
        let url = &record.url;

        if self.ledger.is_downloaded(url).await {
            info!("  skipping {} (already downloaded)", record.filename);
            return DownloadOutcome::Skipped;
        }
        if self.ledger.is_failed(url).await {
            info!("  skipping {} (permanently failed)", record.filename);
            return DownloadOutcome::Skipped;
        }

        let path = self.target_path(&record.filename);
        if path.exists() {
            self.ledger.mark_downloaded(url).await;
            info!("  {} already on disk, ledger reconciled", record.filename);
            return DownloadOutcome::Skipped;
        }

        let payload = match self.fetcher.fetch(url).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("fetch failed for {}: {}", record.filename, e);
                return DownloadOutcome::TransientError;
            }
        };

        if payload.status == 404 {
            self.ledger.mark_failed(url).await;
            info!("  {} gone (404), recorded as permanent", record.filename);
            return DownloadOutcome::Skipped;
        }
        if !payload.is_success() {
            warn!("HTTP {} for {}", payload.status, record.filename);
            return DownloadOutcome::TransientError;
        }
        if !payload.bytes.starts_with(PDF_MAGIC) {
            warn!("response for {} is not a PDF, not saving", record.filename);
            return DownloadOutcome::TransientError;
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!("could not create {}: {}", parent.display(), e);
                return DownloadOutcome::TransientError;
            }
        }
        if let Err(e) = std::fs::write(&path, &payload.bytes) {
            error!("could not write {}: {}", path.display(), e);
            return DownloadOutcome::TransientError;
        }

        self.ledger.mark_downloaded(url).await;
        info!(
            "  downloaded {} ({:.1} KB)",
            record.filename,
            payload.bytes.len() as f64 / 1024.0
        );
        DownloadOutcome::Downloaded
    }

    /// Sequential batch over a record list, honoring an optional limit.
    ///
    /// Returns the count of new downloads and the display names of genuine
    /// failures (transient errors); skips count as neither.
    pub async fn download_all(
        &self,
        records: &[Record],
        limit: Option<usize>,
    ) -> (usize, Vec<String>) {
        let records = match limit {
            Some(max) => &records[..records.len().min(max)],
            None => records,
        };

        let total = records.len();
        info!("downloading {} files", total);

        let mut downloaded = 0usize;
        let mut failed = Vec::new();

        for (i, record) in records.iter().enumerate() {
            info!("[{}/{}] {}", i + 1, total, record.filename);
            match self.attempt(record).await {
                DownloadOutcome::Downloaded => downloaded += 1,
                DownloadOutcome::Skipped => {}
                DownloadOutcome::TransientError => failed.push(record.filename.clone()),
            }
        }

        (downloaded, failed)
    }

    /// Incremental batch: filter out already-satisfied records up front,
    /// then process only the remainder.
    ///
    /// The failed set is snapshotted once per batch rather than consulted
    /// per item. Returns the count of new successes only, so progress
    /// messages reflect incremental work.
    pub async fn download_new(&self, records: &[Record]) -> usize {
        let failed = self.ledger.failed_snapshot().await;

        let mut pending = Vec::new();
        for record in records {
            if failed.contains(&record.url) {
                continue;
            }
            if self.ledger.is_downloaded(&record.url).await {
                continue;
            }
            if self.target_path(&record.filename).exists() {
                self.ledger.mark_downloaded(&record.url).await;
                continue;
            }
            pending.push(record.clone());
        }

        if pending.is_empty() {
            return 0;
        }
        info!("{} new files to download", pending.len());

        let mut downloaded = 0usize;
        for record in &pending {
            if self.attempt(record).await == DownloadOutcome::Downloaded {
                downloaded += 1;
            }
        }
        downloaded
    }
}

/// Append `.pdf` when the display name lacks it (case-insensitive). Source
/// listings sometimes omit extensions in link text.
pub fn normalize_pdf_filename(name: &str) -> String {
    let mut name = sanitize_filename(name);
    if !name.to_lowercase().ends_with(".pdf") {
        name.push_str(".pdf");
    }
    name
}

/// Make a display name safe to use as a local file name.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned
        .trim_matches(|c| c == '.' || c == ' ')
        .to_string();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    use crate::scrapers::FetchedPayload;

    /// Canned responses keyed by URL, counting every network call.
    struct MockFetcher {
        responses: HashMap<String, (u16, Vec<u8>)>,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn new(responses: HashMap<String, (u16, Vec<u8>)>) -> Self {
            Self {
                responses,
                calls: AtomicUsize::new(0),
            }
        }

        fn pdf(urls: &[&str]) -> Self {
            Self::new(
                urls.iter()
                    .map(|u| (u.to_string(), (200, b"%PDF-1.4 content".to_vec())))
                    .collect(),
            )
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl SessionFetch for MockFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<FetchedPayload> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.responses.get(url) {
                Some((status, bytes)) => Ok(FetchedPayload {
                    status: *status,
                    bytes: bytes.clone(),
                }),
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    fn record(url: &str, filename: &str) -> Record {
        Record::new(url, filename, None).unwrap()
    }

    async fn service_with(
        dir: &std::path::Path,
        fetcher: Arc<MockFetcher>,
    ) -> DownloadService {
        let ledger = Arc::new(DownloadLedger::open(dir).unwrap());
        DownloadService::new(fetcher, ledger, dir)
    }

    #[test]
    fn test_normalize_appends_pdf_extension() {
        assert_eq!(normalize_pdf_filename("report"), "report.pdf");
        assert_eq!(normalize_pdf_filename("report.PDF"), "report.PDF");
        assert_eq!(normalize_pdf_filename("a/b:c"), "a_b_c.pdf");
    }

    #[test]
    fn test_sanitize_empty_name() {
        assert_eq!(sanitize_filename("  . "), "untitled");
    }

    #[tokio::test]
    async fn test_download_success_writes_file_and_ledger() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/new.pdf";
        let fetcher = Arc::new(MockFetcher::pdf(&[url]));
        let service = service_with(dir.path(), fetcher.clone()).await;

        let outcome = service.attempt(&record(url, "new.pdf")).await;
        assert_eq!(outcome, DownloadOutcome::Downloaded);
        assert!(dir.path().join("new.pdf").exists());
        assert!(service.ledger().is_downloaded(url).await);
    }

    #[tokio::test]
    async fn test_second_attempt_skips_without_network_call() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/file.pdf";
        let fetcher = Arc::new(MockFetcher::pdf(&[url]));
        let service = service_with(dir.path(), fetcher.clone()).await;

        assert_eq!(
            service.attempt(&record(url, "file.pdf")).await,
            DownloadOutcome::Downloaded
        );
        assert_eq!(
            service.attempt(&record(url, "file.pdf")).await,
            DownloadOutcome::Skipped
        );
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_file_reconciles_ledger() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/existing.pdf";
        std::fs::write(dir.path().join("existing.pdf"), b"%PDF-1.4").unwrap();
        let fetcher = Arc::new(MockFetcher::pdf(&[url]));
        let service = service_with(dir.path(), fetcher.clone()).await;

        let outcome = service.attempt(&record(url, "existing.pdf")).await;
        assert_eq!(outcome, DownloadOutcome::Skipped);
        assert!(service.ledger().is_downloaded(url).await);
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_404_marks_permanent_and_never_retries() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/404.pdf";
        let fetcher = Arc::new(MockFetcher::new(
            [(url.to_string(), (404, Vec::new()))].into(),
        ));
        let service = service_with(dir.path(), fetcher.clone()).await;

        let outcome = service.attempt(&record(url, "404.pdf")).await;
        assert_eq!(outcome, DownloadOutcome::Skipped);
        assert!(service.ledger().is_failed(url).await);

        // Second call short-circuits before the network.
        let outcome = service.attempt(&record(url, "404.pdf")).await;
        assert_eq!(outcome, DownloadOutcome::Skipped);
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_transient_and_unrecorded() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/flaky.pdf";
        let fetcher = Arc::new(MockFetcher::new(
            [(url.to_string(), (503, Vec::new()))].into(),
        ));
        let service = service_with(dir.path(), fetcher.clone()).await;

        let outcome = service.attempt(&record(url, "flaky.pdf")).await;
        assert_eq!(outcome, DownloadOutcome::TransientError);
        assert!(!service.ledger().is_failed(url).await);
        assert!(!service.ledger().is_downloaded(url).await);

        // Still eligible on the next pass.
        service.attempt(&record(url, "flaky.pdf")).await;
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_html_masquerading_as_pdf_writes_nothing() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/fake.pdf";
        let fetcher = Arc::new(MockFetcher::new(
            [(url.to_string(), (200, b"<html>Not a PDF</html>".to_vec()))].into(),
        ));
        let service = service_with(dir.path(), fetcher).await;

        let outcome = service.attempt(&record(url, "fake.pdf")).await;
        assert_eq!(outcome, DownloadOutcome::TransientError);
        assert!(!dir.path().join("fake.pdf").exists());
    }

    #[tokio::test]
    async fn test_download_all_respects_limit_and_reports_failures() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(MockFetcher::new(
            [
                (
                    "https://example.com/1.pdf".to_string(),
                    (200, b"%PDF-1.4".to_vec()),
                ),
                (
                    "https://example.com/2.pdf".to_string(),
                    (200, b"<html>bad</html>".to_vec()),
                ),
                (
                    "https://example.com/3.pdf".to_string(),
                    (200, b"%PDF-1.4".to_vec()),
                ),
            ]
            .into(),
        ));
        let service = service_with(dir.path(), fetcher.clone()).await;

        let records = vec![
            record("https://example.com/1.pdf", "1.pdf"),
            record("https://example.com/2.pdf", "2.pdf"),
            record("https://example.com/3.pdf", "3.pdf"),
        ];

        let (downloaded, failed) = service.download_all(&records, Some(2)).await;
        assert_eq!(downloaded, 1);
        assert_eq!(failed, vec!["2.pdf".to_string()]);
        assert_eq!(fetcher.call_count(), 2, "limit bounds network calls");
    }

    #[tokio::test]
    async fn test_download_new_counts_only_new_successes() {
        let dir = tempdir().unwrap();
        let urls = [
            "https://example.com/1.pdf",
            "https://example.com/2.pdf",
            "https://example.com/3.pdf",
        ];
        let fetcher = Arc::new(MockFetcher::pdf(&urls));
        let service = service_with(dir.path(), fetcher.clone()).await;

        service.ledger().mark_downloaded(urls[0]).await;
        service.ledger().mark_failed(urls[1]).await;

        let records = vec![
            record(urls[0], "1.pdf"),
            record(urls[1], "2.pdf"),
            record(urls[2], "3.pdf"),
        ];
        let downloaded = service.download_new(&records).await;
        assert_eq!(downloaded, 1);
        assert_eq!(fetcher.call_count(), 1, "satisfied records are filtered");
    }

    #[tokio::test]
    async fn test_download_new_with_nothing_pending() {
        let dir = tempdir().unwrap();
        let url = "https://example.com/1.pdf";
        let fetcher = Arc::new(MockFetcher::pdf(&[url]));
        let service = service_with(dir.path(), fetcher.clone()).await;
        service.ledger().mark_downloaded(url).await;

        assert_eq!(service.download_new(&[record(url, "1.pdf")]).await, 0);
        assert_eq!(fetcher.call_count(), 0);
    }
}
