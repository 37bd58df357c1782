//! Index-state reconciliation for the downstream QA subsystem.
//!
//! Files the download engine has committed are handed to the indexing
//! collaborator by content hash. This module tracks which file contents have
//! been indexed so repeat runs only process new or changed documents, and
//! prunes entries whose files have been removed. The embedding and
//! vector-store side lives entirely behind [`DocumentIndexer`].

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// State file kept next to the downloaded documents.
pub const INDEX_STATE_FILE: &str = ".index_state.json";

/// Metadata for one indexed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub hash: String,
    pub indexed_at: String,
    pub chunk_count: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexState {
    #[serde(default)]
    indexed_files: BTreeMap<String, IndexEntry>,
    #[serde(default)]
    last_sync: Option<String>,
}

/// Downstream indexing collaborator.
#[async_trait]
pub trait DocumentIndexer: Send + Sync {
    /// Ingest one file's content, returning how many chunks were indexed.
    async fn index_document(&self, path: &Path, sha256: &str) -> Result<usize>;

    /// Drop a previously indexed file from the store.
    async fn remove_document(&self, filename: &str, sha256: &str) -> Result<()>;
}

/// Outcome tallies of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub indexed: usize,
    pub skipped: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Work a reconciliation pass would perform, without performing it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub new_files: Vec<String>,
    pub changed_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub up_to_date: usize,
}

/// Reconciles the download directory against the index-state file.
pub struct IndexSync {
    downloads_dir: PathBuf,
    state_path: PathBuf,
}

impl IndexSync {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        let downloads_dir = downloads_dir.into();
        let state_path = downloads_dir.join(INDEX_STATE_FILE);
        Self {
            downloads_dir,
            state_path,
        }
    }

    fn load_state(&self) -> IndexState {
        match std::fs::read_to_string(&self.state_path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!("index state unreadable ({}), rebuilding", e);
                IndexState::default()
            }),
            Err(_) => IndexState::default(),
        }
    }

    fn save_state(&self, state: &IndexState) -> Result<()> {
        let data = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.state_path, data)
            .with_context(|| format!("writing {}", self.state_path.display()))?;
        Ok(())
    }

    /// Diff the download directory against recorded index state. Read-only:
    /// used to report pending work before an indexing backend runs.
    pub fn plan(&self) -> Result<SyncPlan> {
        let state = self.load_state();
        let mut plan = SyncPlan::default();

        let mut pdf_files = list_pdf_files(&self.downloads_dir)?;
        pdf_files.sort();

        for path in &pdf_files {
            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let hash = match file_sha256(path) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("could not hash {}: {}", filename, e);
                    continue;
                }
            };
            match state.indexed_files.get(&filename) {
                None => plan.new_files.push(filename),
                Some(entry) if entry.hash != hash => plan.changed_files.push(filename),
                Some(_) => plan.up_to_date += 1,
            }
        }

        let present: Vec<String> = pdf_files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        plan.deleted_files = state
            .indexed_files
            .keys()
            .filter(|name| !present.contains(name))
            .cloned()
            .collect();

        Ok(plan)
    }

    /// Index new and changed files, prune deleted ones.
    ///
    /// `force` re-indexes every file regardless of recorded hashes. Per-file
    /// indexing failures are logged and tallied; they do not stop the pass.
    pub async fn sync(&self, indexer: &dyn DocumentIndexer, force: bool) -> Result<SyncSummary> {
        let mut state = self.load_state();
        let mut summary = SyncSummary::default();

        let mut pdf_files = list_pdf_files(&self.downloads_dir)?;
        pdf_files.sort();
        info!("sync: {} files in {}", pdf_files.len(), self.downloads_dir.display());

        for path in &pdf_files {
            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let hash = match file_sha256(path) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("could not hash {}: {}", filename, e);
                    summary.failed += 1;
                    continue;
                }
            };

            let unchanged = state
                .indexed_files
                .get(&filename)
                .is_some_and(|entry| entry.hash == hash);
            if unchanged && !force {
                summary.skipped += 1;
                continue;
            }

            match indexer.index_document(path, &hash).await {
                Ok(chunk_count) => {
                    state.indexed_files.insert(
                        filename,
                        IndexEntry {
                            hash,
                            indexed_at: Utc::now().to_rfc3339(),
                            chunk_count,
                        },
                    );
                    summary.indexed += 1;
                }
                Err(e) => {
                    warn!("indexing {} failed: {}", filename, e);
                    summary.failed += 1;
                }
            }
        }

        // Prune entries whose files are gone.
        let present: Vec<String> = pdf_files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
            .collect();
        let stale: Vec<String> = state
            .indexed_files
            .keys()
            .filter(|name| !present.contains(name))
            .cloned()
            .collect();
        for filename in stale {
            if let Some(entry) = state.indexed_files.remove(&filename) {
                if let Err(e) = indexer.remove_document(&filename, &entry.hash).await {
                    warn!("could not remove {} from index: {}", filename, e);
                }
                summary.removed += 1;
            }
        }

        state.last_sync = Some(Utc::now().to_rfc3339());
        self.save_state(&state)?;

        info!(
            "sync complete: {} indexed, {} skipped, {} removed, {} failed",
            summary.indexed, summary.skipped, summary.removed, summary.failed
        );
        Ok(summary)
    }
}

fn list_pdf_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(files),
    };
    for entry in entries {
        let path = entry?.path();
        let is_pdf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
        if path.is_file() && is_pdf {
            files.push(path);
        }
    }
    Ok(files)
}

/// SHA-256 of a file's content, streamed in 8 KiB chunks.
fn file_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Counts calls; every document indexes into 2 chunks.
    #[derive(Default)]
    struct StubIndexer {
        indexed: AtomicUsize,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl DocumentIndexer for StubIndexer {
        async fn index_document(&self, _path: &Path, _sha256: &str) -> Result<usize> {
            self.indexed.fetch_add(1, Ordering::Relaxed);
            Ok(2)
        }

        async fn remove_document(&self, _filename: &str, _sha256: &str) -> Result<()> {
            self.removed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sync_indexes_new_files_once() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF-1.4 a").unwrap();
        std::fs::write(dir.path().join("b.pdf"), b"%PDF-1.4 b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let sync = IndexSync::new(dir.path());
        let indexer = StubIndexer::default();

        let first = sync.sync(&indexer, false).await.unwrap();
        assert_eq!(first.indexed, 2);
        assert_eq!(first.skipped, 0);

        let second = sync.sync(&indexer, false).await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(indexer.indexed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_sync_reindexes_changed_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, b"%PDF-1.4 v1").unwrap();

        let sync = IndexSync::new(dir.path());
        let indexer = StubIndexer::default();
        sync.sync(&indexer, false).await.unwrap();

        std::fs::write(&path, b"%PDF-1.4 v2").unwrap();
        let summary = sync.sync(&indexer, false).await.unwrap();
        assert_eq!(summary.indexed, 1);
    }

    #[tokio::test]
    async fn test_sync_prunes_deleted_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, b"%PDF-1.4 a").unwrap();

        let sync = IndexSync::new(dir.path());
        let indexer = StubIndexer::default();
        sync.sync(&indexer, false).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        let summary = sync.sync(&indexer, false).await.unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(indexer.removed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_plan_reports_pending_work_without_mutating() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF-1.4 a").unwrap();

        let sync = IndexSync::new(dir.path());
        let plan = sync.plan().unwrap();
        assert_eq!(plan.new_files, vec!["a.pdf".to_string()]);
        assert_eq!(plan.up_to_date, 0);

        // Planning alone records nothing.
        let plan_again = sync.plan().unwrap();
        assert_eq!(plan_again.new_files.len(), 1);

        let indexer = StubIndexer::default();
        sync.sync(&indexer, false).await.unwrap();
        let after = sync.plan().unwrap();
        assert!(after.new_files.is_empty());
        assert_eq!(after.up_to_date, 1);
    }

    #[tokio::test]
    async fn test_sync_force_reindexes_unchanged() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF-1.4 a").unwrap();

        let sync = IndexSync::new(dir.path());
        let indexer = StubIndexer::default();
        sync.sync(&indexer, false).await.unwrap();

        let summary = sync.sync(&indexer, true).await.unwrap();
        assert_eq!(summary.indexed, 1);
        assert_eq!(summary.skipped, 0);
    }
}
