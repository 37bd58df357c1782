//! Atomic JSON snapshot of the discovered record set.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{Record, RecordSet};

/// On-disk snapshot format.
///
/// `letters_searched` carries either the searched letters or a mode marker
/// (e.g. `["SCAN_MODE"]`) so an operator can tell how the snapshot was
/// produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total_files: usize,
    #[serde(default)]
    pub letters_searched: Vec<String>,
    #[serde(default)]
    pub max_pages_per_letter: usize,
    #[serde(default)]
    pub files: Vec<Record>,
}

/// Persists the record set as a single JSON file via atomic replace.
///
/// The snapshot is advisory at startup: any unreadable state yields an empty
/// set so a run can always begin. It is never deleted by the program.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load previously discovered records, or an empty set.
    ///
    /// Container setups sometimes mount a directory where the file belongs;
    /// the directory is removed so the next save can succeed.
    pub fn load(&self) -> RecordSet {
        if self.path.is_dir() {
            warn!(
                "snapshot path {} is a directory, removing it",
                self.path.display()
            );
            if let Err(e) = fs::remove_dir_all(&self.path) {
                warn!("could not remove {}: {}", self.path.display(), e);
                return RecordSet::new();
            }
        }

        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(_) => return RecordSet::new(),
        };

        match serde_json::from_str::<ProgressSnapshot>(&data) {
            Ok(snapshot) => {
                info!(
                    "resuming: loaded {} records from {}",
                    snapshot.files.len(),
                    self.path.display()
                );
                RecordSet::from_records(snapshot.files)
            }
            Err(e) => {
                warn!(
                    "snapshot {} is unreadable ({}), starting from empty",
                    self.path.display(),
                    e
                );
                RecordSet::new()
            }
        }
    }

    /// Write the snapshot with write-temp-then-rename so a crash never
    /// leaves a half-written file at the destination.
    pub fn save(
        &self,
        records: &RecordSet,
        letters_searched: &[String],
        max_pages_per_letter: usize,
    ) -> anyhow::Result<()> {
        let snapshot = ProgressSnapshot {
            total_files: records.len(),
            letters_searched: letters_searched.to_vec(),
            max_pages_per_letter,
            files: records.records().to_vec(),
        };

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, &snapshot)?;
        tmp.write_all(b"\n")?;
        tmp.flush()?;
        tmp.persist(&self.path)?;

        info!(
            "snapshot saved: {} records -> {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }
}
