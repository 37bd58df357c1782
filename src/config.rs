//! Runtime configuration.
//!
//! Settings load from an optional TOML file plus environment overrides
//! (`.env` is read at startup, CLI flags carry `env` bindings) and are
//! passed explicitly to the components that need them — nothing reads
//! configuration at import time.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scrapers::BrowserSessionConfig;

/// Main configuration for the catalog scraper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Catalog origin.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the searchable catalog page.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,

    /// Path of the disclosures landing page (scan mode).
    #[serde(default = "default_disclosures_path")]
    pub disclosures_path: String,

    /// Accordion section on the disclosures page that lists the datasets.
    #[serde(default = "default_section_label")]
    pub section_label: String,

    /// Letters iterated in search mode.
    #[serde(default = "default_alphabet")]
    pub alphabet: String,

    /// Cap on result pages per letter (search mode). None means unlimited.
    #[serde(default)]
    pub max_pages_per_letter: Option<usize>,

    /// Cap on files downloaded per run. None means unlimited.
    #[serde(default)]
    pub max_downloads: Option<usize>,

    /// Results the catalog renders per page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Persist the snapshot every N completed pages.
    #[serde(default = "default_save_every_pages")]
    pub save_every_pages: usize,

    /// Background download workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Per-request timeout for downloads, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Route downloads through the in-page fetch primitive instead of the
    /// cookie-jar HTTP client. Slower (serialized with navigation) but
    /// passes origin checks that block direct clients.
    #[serde(default)]
    pub in_page_fetch: bool,

    #[serde(default)]
    pub browser: BrowserSessionConfig,

    /// Data directory. Defaults to the platform-local data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_base_url() -> String {
    "https://www.justice.gov".to_string()
}

fn default_catalog_path() -> String {
    "/epstein".to_string()
}

fn default_disclosures_path() -> String {
    "/epstein/doj-disclosures".to_string()
}

fn default_section_label() -> String {
    "Epstein Files Transparency Act".to_string()
}

fn default_alphabet() -> String {
    "abcdefghijklmnopqrstuvwxyz".to_string()
}

fn default_page_size() -> usize {
    10
}

fn default_save_every_pages() -> usize {
    10
}

fn default_workers() -> usize {
    3
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            catalog_path: default_catalog_path(),
            disclosures_path: default_disclosures_path(),
            section_label: default_section_label(),
            alphabet: default_alphabet(),
            max_pages_per_letter: None,
            max_downloads: None,
            page_size: default_page_size(),
            save_every_pages: default_save_every_pages(),
            workers: default_workers(),
            request_timeout_secs: default_request_timeout_secs(),
            in_page_fetch: false,
            browser: BrowserSessionConfig::default(),
            data_dir: None,
        }
    }
}

impl Settings {
    /// Load settings from an explicit TOML file, from `pdfacquire.toml` in
    /// the working directory if present, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let local = PathBuf::from("pdfacquire.toml");
                local.exists().then_some(local)
            }
        };

        match path {
            Some(path) => {
                let data = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&data)
                    .with_context(|| format!("parsing config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join("pdfacquire"))
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir().join("downloads")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.downloads_dir().join("catalog_urls.json")
    }

    pub fn catalog_url(&self) -> String {
        format!("{}{}", self.base_url, self.catalog_path)
    }

    pub fn disclosures_url(&self) -> String {
        format!("{}{}", self.base_url, self.disclosures_path)
    }

    /// Href fragment identifying dataset pages under the disclosures path.
    pub fn dataset_link_pattern(&self) -> String {
        format!("{}/data-set-", self.disclosures_path)
    }

    pub fn letters(&self) -> Vec<String> {
        self.alphabet.chars().map(|c| c.to_string()).collect()
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}
