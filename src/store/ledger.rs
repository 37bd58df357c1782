//! Append-only ledger of terminal per-item download outcomes.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::warn;

const DOWNLOADED_FILE: &str = "downloaded.txt";
const FAILED_FILE: &str = "failed_downloads.txt";

#[derive(Default)]
struct LedgerSets {
    downloaded: HashSet<String>,
    failed: HashSet<String>,
}

/// Two durable URL sets: byte-validated successes and permanent failures.
///
/// On disk each set is a newline-delimited text file, appended one URL per
/// line (URLs contain no newlines, so no escaping is needed). A URL in the
/// failed set is never retried automatically; an operator can remove a line
/// to force one.
///
/// The in-memory sets are shared across download workers, so check-then-mark
/// sequences must run while holding the lock — see
/// [`DownloadLedger::mark_downloaded`].
pub struct DownloadLedger {
    downloaded_path: PathBuf,
    failed_path: PathBuf,
    sets: Mutex<LedgerSets>,
}

impl DownloadLedger {
    /// Load the ledger files under `downloads_dir`, creating the directory
    /// if needed. Missing files are treated as empty sets.
    pub fn open(downloads_dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(downloads_dir)?;
        let downloaded_path = downloads_dir.join(DOWNLOADED_FILE);
        let failed_path = downloads_dir.join(FAILED_FILE);
        let sets = LedgerSets {
            downloaded: read_url_lines(&downloaded_path),
            failed: read_url_lines(&failed_path),
        };
        Ok(Self {
            downloaded_path,
            failed_path,
            sets: Mutex::new(sets),
        })
    }

    pub async fn is_downloaded(&self, url: &str) -> bool {
        self.sets.lock().await.downloaded.contains(url)
    }

    pub async fn is_failed(&self, url: &str) -> bool {
        self.sets.lock().await.failed.contains(url)
    }

    /// Record a validated success. Returns false when the URL was already
    /// present (another worker won the race); the file is appended only for
    /// the winner, keeping the ledger free of duplicate lines.
    pub async fn mark_downloaded(&self, url: &str) -> bool {
        let mut sets = self.sets.lock().await;
        if !sets.downloaded.insert(url.to_string()) {
            return false;
        }
        append_line(&self.downloaded_path, url);
        true
    }

    /// Record a permanent failure (e.g. HTTP 404).
    pub async fn mark_failed(&self, url: &str) -> bool {
        let mut sets = self.sets.lock().await;
        if !sets.failed.insert(url.to_string()) {
            return false;
        }
        append_line(&self.failed_path, url);
        true
    }

    /// Copy of the permanent-failure set, taken once per batch rather than
    /// locking per item.
    pub async fn failed_snapshot(&self) -> HashSet<String> {
        self.sets.lock().await.failed.clone()
    }

    pub async fn downloaded_count(&self) -> usize {
        self.sets.lock().await.downloaded.len()
    }

    pub async fn failed_count(&self) -> usize {
        self.sets.lock().await.failed.len()
    }
}

fn read_url_lines(path: &Path) -> HashSet<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect(),
        Err(_) => HashSet::new(),
    }
}

fn append_line(path: &Path, url: &str) {
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", url));
    if let Err(e) = result {
        warn!("could not append to {}: {}", path.display(), e);
    }
}
