//! Crawl orchestration: wires collection passes to download passes.
//!
//! One enumeration unit is a search term or a dataset link. Units are
//! independent: a unit that fails is logged and skipped, and the snapshot is
//! persisted after every unit (and every Nth page inside a unit), so a crash
//! loses at most the in-flight unit's work.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::models::{Record, RecordSet};
use crate::scrapers::{gate, LinkCollector, PageDriver, SessionFetch};
use crate::services::download::pool::BackgroundDownloader;
use crate::services::download::DownloadService;
use crate::store::{DownloadLedger, SnapshotStore};

/// Marker stored in the snapshot's `letters_searched` field for scan runs.
const SCAN_MODE_MARKER: &str = "SCAN_MODE";

/// Shared context for one crawl run: the accumulated record set, the
/// durable stores, and the background downloader handle.
pub struct CrawlSession {
    settings: Settings,
    snapshot: SnapshotStore,
    records: RecordSet,
    service: Arc<DownloadService>,
    background: Option<BackgroundDownloader>,
    pages_since_save: usize,
    letters_marker: Vec<String>,
    max_pages_marker: usize,
}

impl CrawlSession {
    /// Load durable state and prepare a session around the given fetcher.
    pub fn open(settings: Settings, fetcher: Arc<dyn SessionFetch>) -> Result<Self> {
        let downloads_dir = settings.downloads_dir();
        let ledger = Arc::new(DownloadLedger::open(&downloads_dir)?);
        let snapshot = SnapshotStore::new(settings.snapshot_path());
        let records = snapshot.load();
        let service = Arc::new(DownloadService::new(fetcher, ledger, downloads_dir));

        Ok(Self {
            settings,
            snapshot,
            records,
            service,
            background: None,
            pages_since_save: 0,
            letters_marker: Vec::new(),
            max_pages_marker: 0,
        })
    }

    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    pub fn service(&self) -> &Arc<DownloadService> {
        &self.service
    }

    fn persist(&self) {
        if let Err(e) = self
            .snapshot
            .save(&self.records, &self.letters_marker, self.max_pages_marker)
        {
            error!("snapshot save failed: {}", e);
        }
    }

    /// Page-completion callback: merge the page's records, persist every Nth
    /// page, and hand anything new to the background downloader.
    fn on_page_complete(&mut self, page_records: &[Record]) {
        let fresh: Vec<Record> = page_records
            .iter()
            .filter(|r| !self.records.contains(&r.url))
            .cloned()
            .collect();
        self.records.merge(page_records.iter().cloned());

        self.pages_since_save += 1;
        if self.pages_since_save % self.settings.save_every_pages == 0 {
            self.persist();
            info!("auto-save: {} unique records", self.records.len());
        }

        if let Some(background) = &self.background {
            if !fresh.is_empty() {
                background.enqueue(&fresh);
            }
        }
    }

    /// Scan mode: enumerate the disclosure datasets, downloading new records
    /// in the background as pages complete.
    pub async fn run_scan<P: PageDriver + ?Sized>(
        &mut self,
        page: &mut P,
        skip_download: bool,
    ) -> Result<()> {
        self.letters_marker = vec![SCAN_MODE_MARKER.to_string()];
        self.max_pages_marker = 0;

        info!("scan mode: {} known records", self.records.len());
        if !skip_download {
            self.background = Some(BackgroundDownloader::start(
                self.service.clone(),
                self.settings.workers,
            ));
        }

        if let Err(e) = self.scan_datasets(page).await {
            // The only path where in-memory accumulation could be lost.
            error!("scan mode failed: {}", e);
            self.persist();
            info!("emergency save: {} records preserved", self.records.len());
        }

        if let Some(background) = self.background.take() {
            info!("waiting for background downloads to complete...");
            background.wait().await;
            let downloaded = background.stop().await;
            info!("background downloads done: {} new files", downloaded);
        }

        self.persist();
        self.report_totals().await;
        Ok(())
    }

    async fn scan_datasets<P: PageDriver + ?Sized>(&mut self, page: &mut P) -> Result<()> {
        let collector = LinkCollector::new(self.settings.base_url.clone(), self.settings.page_size);
        let section_label = self.settings.section_label.clone();

        let disclosures_url = self.settings.disclosures_url();
        info!("accessing {}...", disclosures_url);
        page.goto(&disclosures_url).await?;
        gate::pass_gates(page).await?;

        if !collector.expand_section(page, &section_label).await? {
            anyhow::bail!("could not expand '{}'", section_label);
        }

        let content = page.content().await?;
        let links = collector.dataset_links(&content, &self.settings.dataset_link_pattern());
        info!("found {} dataset links", links.len());

        for (i, link) in links.iter().enumerate() {
            self.pages_since_save = 0;
            let mut on_page = |records: &[Record]| -> Result<()> {
                self.on_page_complete(records);
                Ok(())
            };
            match collector.collect_from_dataset(page, link, &mut on_page).await {
                Ok(_) => {
                    self.persist();
                    info!(
                        "dataset complete: {} unique records ({}/{} datasets)",
                        self.records.len(),
                        i + 1,
                        links.len()
                    );
                }
                Err(e) => {
                    // Unit-level failure: later datasets still run.
                    error!("dataset {} failed: {}", link, e);
                    continue;
                }
            }
        }

        Ok(())
    }

    /// Search mode: iterate letters through the search box, then download
    /// everything inline.
    pub async fn run_search<P: PageDriver + ?Sized>(
        &mut self,
        page: &mut P,
        letters: &[String],
        max_pages: Option<usize>,
        skip_download: bool,
        limit: Option<usize>,
    ) -> Result<()> {
        self.letters_marker = letters.to_vec();
        self.max_pages_marker = max_pages.unwrap_or(0);

        info!("search mode: {} letters", letters.len());
        let catalog_url = self.settings.catalog_url();
        let collector = LinkCollector::new(self.settings.base_url.clone(), self.settings.page_size);

        for (i, letter) in letters.iter().enumerate() {
            info!("letter {} ({}/{})", letter.to_uppercase(), i + 1, letters.len());

            if let Err(e) = page.goto(&catalog_url).await {
                error!("failed to open catalog for '{}': {}", letter, e);
                continue;
            }
            if let Err(e) = gate::pass_gates(page).await {
                error!("gate passing failed for '{}': {}", letter, e);
                continue;
            }

            let mut on_page = |records: &[Record]| -> Result<()> {
                self.on_page_complete(records);
                Ok(())
            };
            match collector
                .collect_for_term(page, letter, max_pages, &mut on_page)
                .await
            {
                Ok(_) => info!("running total: {} unique records", self.records.len()),
                Err(e) => {
                    error!("letter '{}' failed: {}", letter, e);
                    continue;
                }
            }
            self.persist();
        }

        self.persist();

        if !skip_download && !self.records.is_empty() {
            let records: Vec<Record> = self.records.records().to_vec();
            let (downloaded, failed) = self.service.download_all(&records, limit).await;
            info!("downloaded: {}, failed: {}", downloaded, failed.len());
            if !failed.is_empty() {
                warn!("failed files:");
                for name in &failed {
                    warn!("  - {}", name);
                }
            }
        }

        self.report_totals().await;
        Ok(())
    }

    async fn report_totals(&self) {
        let ledger = self.service.ledger();
        info!(
            "run complete: {} unique records, {} downloaded, {} permanently failed",
            self.records.len(),
            ledger.downloaded_count().await,
            ledger.failed_count().await
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::tempdir;

    use crate::scrapers::FetchedPayload;
    use crate::store::ProgressSnapshot;

    /// Serves dataset pages; the disclosure landing page lists one dataset.
    struct FakeCatalog {
        pages: HashMap<String, String>,
        current: String,
    }

    #[async_trait]
    impl PageDriver for FakeCatalog {
        async fn goto(&mut self, url: &str) -> Result<()> {
            self.current = url.to_string();
            Ok(())
        }

        async fn content(&mut self) -> Result<String> {
            Ok(self.pages.get(&self.current).cloned().unwrap_or_default())
        }

        async fn evaluate(&mut self, _script: &str) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Bool(true))
        }

        async fn settle(&mut self, _millis: u64) {}
    }

    struct PdfFetcher;

    #[async_trait]
    impl SessionFetch for PdfFetcher {
        async fn fetch(&self, _url: &str) -> Result<FetchedPayload> {
            Ok(FetchedPayload {
                status: 200,
                bytes: b"%PDF-1.4 content".to_vec(),
            })
        }
    }

    fn test_settings(data_dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.base_url = "https://catalog.example.gov".to_string();
        settings.data_dir = Some(data_dir.to_path_buf());
        settings.workers = 2;
        settings
    }

    fn catalog_with_one_dataset(settings: &Settings) -> FakeCatalog {
        let dataset = format!("{}/data-set-1-files", settings.disclosures_url());
        let mut pages = HashMap::new();
        pages.insert(
            settings.disclosures_url(),
            format!(r##"<a href="{}">Data Set 1 Files</a>"##, dataset),
        );
        pages.insert(
            format!("{dataset}?page=0"),
            r##"<a href="/f/a.pdf">a</a><a href="/f/b.pdf">b</a><a href="/f/c.pdf">c</a>"##
                .to_string(),
        );
        FakeCatalog {
            pages,
            current: String::new(),
        }
    }

    #[tokio::test]
    async fn test_scan_collects_downloads_and_persists() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut catalog = catalog_with_one_dataset(&settings);

        let mut session = CrawlSession::open(settings.clone(), Arc::new(PdfFetcher)).unwrap();
        session.run_scan(&mut catalog, false).await.unwrap();

        assert_eq!(session.records().len(), 3);
        assert_eq!(session.service().ledger().downloaded_count().await, 3);
        assert_eq!(session.service().ledger().failed_count().await, 0);

        let snapshot: ProgressSnapshot = serde_json::from_str(
            &std::fs::read_to_string(settings.snapshot_path()).unwrap(),
        )
        .unwrap();
        assert_eq!(snapshot.total_files, 3);
        assert_eq!(snapshot.letters_searched, vec![SCAN_MODE_MARKER]);
    }

    #[tokio::test]
    async fn test_scan_resumes_from_existing_snapshot() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());

        // First pass discovers everything.
        {
            let mut catalog = catalog_with_one_dataset(&settings);
            let mut session =
                CrawlSession::open(settings.clone(), Arc::new(PdfFetcher)).unwrap();
            session.run_scan(&mut catalog, false).await.unwrap();
        }

        // Second pass re-discovers the same records: still 3 unique, and the
        // ledger short-circuits every download.
        let mut catalog = catalog_with_one_dataset(&settings);
        let mut session = CrawlSession::open(settings.clone(), Arc::new(PdfFetcher)).unwrap();
        session.run_scan(&mut catalog, false).await.unwrap();

        assert_eq!(session.records().len(), 3);
        assert_eq!(session.service().ledger().downloaded_count().await, 3);
    }

    #[tokio::test]
    async fn test_scan_survives_missing_section() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        // Landing page without the accordion: expand_section still reports
        // true (evaluate returns true) but no dataset links exist.
        let mut catalog = FakeCatalog {
            pages: HashMap::new(),
            current: String::new(),
        };

        let mut session = CrawlSession::open(settings, Arc::new(PdfFetcher)).unwrap();
        session.run_scan(&mut catalog, true).await.unwrap();
        assert_eq!(session.records().len(), 0);
    }
}
