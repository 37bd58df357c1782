//! CLI commands implementation.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;

use crate::config::Settings;
use crate::services::sync::IndexSync;
use crate::store::{DownloadLedger, SnapshotStore};

use super::progress::phase_spinner;

#[derive(Parser)]
#[command(name = "pdfacquire")]
#[command(about = "Incremental catalog PDF acquisition and research system")]
#[command(version)]
pub struct Cli {
    /// Data directory
    #[arg(long, global = true, env = "PDFACQUIRE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "PDFACQUIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the disclosure datasets and download new documents (default)
    Scan {
        /// Collect links only, skip downloading
        #[arg(long)]
        skip_download: bool,
        /// Number of download workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Search the catalog letter by letter, then download
    Search {
        /// Letters to search (default: the full alphabet)
        #[arg(short, long)]
        letters: Option<String>,
        /// Max result pages per letter (0 = unlimited)
        #[arg(short, long, default_value = "0")]
        max_pages: usize,
        /// Limit number of downloads (0 = unlimited)
        #[arg(long, default_value = "0")]
        limit: usize,
        /// Collect links only, skip downloading
        #[arg(long)]
        skip_download: bool,
    },

    /// Show pending work for the downstream index
    Sync,

    /// Show snapshot and ledger counts
    Status,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = Some(data_dir);
    }

    let command = cli.command.unwrap_or(Commands::Scan {
        skip_download: false,
        workers: None,
    });

    match command {
        Commands::Scan {
            skip_download,
            workers,
        } => {
            if let Some(workers) = workers {
                settings.workers = workers;
            }
            cmd_scan(settings, skip_download).await
        }
        Commands::Search {
            letters,
            max_pages,
            limit,
            skip_download,
        } => {
            let letters: Vec<String> = match letters {
                Some(letters) => letters.chars().map(|c| c.to_string()).collect(),
                None => settings.letters(),
            };
            let max_pages = (max_pages > 0)
                .then_some(max_pages)
                .or(settings.max_pages_per_letter);
            let limit = (limit > 0).then_some(limit).or(settings.max_downloads);
            cmd_search(settings, letters, max_pages, limit, skip_download).await
        }
        Commands::Sync => cmd_sync(settings),
        Commands::Status => cmd_status(settings).await,
    }
}

#[cfg(feature = "browser")]
async fn cmd_scan(settings: Settings, skip_download: bool) -> Result<()> {
    use crate::scrapers::{gate, BrowserSession, PageDriver, SharedSession};
    use crate::services::crawl::CrawlSession;

    let browser = BrowserSession::launch(settings.browser.clone()).await?;
    let mut shared = SharedSession::new(browser);

    // The first navigation establishes the verified session the download
    // client's cookies come from; the crawl re-checks gates as it goes.
    shared.goto(&settings.disclosures_url()).await?;
    gate::pass_gates(&mut shared).await?;

    let fetcher = session_fetcher(&settings, &shared).await?;
    let mut session = CrawlSession::open(settings, fetcher)?;
    let result = session.run_scan(&mut shared, skip_download).await;
    shared.close().await;
    result?;

    println!(
        "{} {} unique records",
        style("done:").green().bold(),
        session.records().len()
    );
    Ok(())
}

#[cfg(feature = "browser")]
async fn cmd_search(
    settings: Settings,
    letters: Vec<String>,
    max_pages: Option<usize>,
    limit: Option<usize>,
    skip_download: bool,
) -> Result<()> {
    use crate::scrapers::{gate, BrowserSession, PageDriver, SharedSession};
    use crate::services::crawl::CrawlSession;

    let browser = BrowserSession::launch(settings.browser.clone()).await?;
    let mut shared = SharedSession::new(browser);

    shared.goto(&settings.catalog_url()).await?;
    gate::pass_gates(&mut shared).await?;

    let fetcher = session_fetcher(&settings, &shared).await?;
    let mut session = CrawlSession::open(settings, fetcher)?;
    let result = session
        .run_search(&mut shared, &letters, max_pages, skip_download, limit)
        .await;
    shared.close().await;
    result?;

    println!(
        "{} {} unique records",
        style("done:").green().bold(),
        session.records().len()
    );
    Ok(())
}

/// Pick the download fetcher: cookie-jar HTTP by default, the in-page fetch
/// primitive when configured (for origin checks that block direct clients).
#[cfg(feature = "browser")]
async fn session_fetcher(
    settings: &Settings,
    shared: &crate::scrapers::SharedSession,
) -> Result<std::sync::Arc<dyn crate::scrapers::SessionFetch>> {
    use std::sync::Arc;

    use crate::scrapers::AuthenticatedClient;

    if settings.in_page_fetch {
        Ok(Arc::new(
            shared.in_page_fetcher(Some(settings.disclosures_url())),
        ))
    } else {
        let cookies = shared.cookies().await?;
        Ok(Arc::new(AuthenticatedClient::from_cookies(
            &cookies,
            settings.request_timeout(),
        )?))
    }
}

#[cfg(not(feature = "browser"))]
async fn cmd_scan(_settings: Settings, _skip_download: bool) -> Result<()> {
    anyhow::bail!("Browser support not compiled. Rebuild with: cargo build --features browser")
}

#[cfg(not(feature = "browser"))]
async fn cmd_search(
    _settings: Settings,
    _letters: Vec<String>,
    _max_pages: Option<usize>,
    _limit: Option<usize>,
    _skip_download: bool,
) -> Result<()> {
    anyhow::bail!("Browser support not compiled. Rebuild with: cargo build --features browser")
}

fn cmd_sync(settings: Settings) -> Result<()> {
    let spinner = phase_spinner("hashing downloaded files...");
    let plan = IndexSync::new(settings.downloads_dir()).plan()?;
    spinner.finish_and_clear();

    println!("{}", style("index reconciliation").bold());
    println!("  new:        {}", plan.new_files.len());
    println!("  changed:    {}", plan.changed_files.len());
    println!("  deleted:    {}", plan.deleted_files.len());
    println!("  up to date: {}", plan.up_to_date);

    for name in plan.new_files.iter().chain(&plan.changed_files) {
        println!("    {}", name);
    }
    Ok(())
}

async fn cmd_status(settings: Settings) -> Result<()> {
    let records = SnapshotStore::new(settings.snapshot_path()).load();
    let ledger = DownloadLedger::open(&settings.downloads_dir())?;

    println!("{}", style("pdfacquire status").bold());
    println!("  records discovered: {}", records.len());
    println!("  downloaded:         {}", ledger.downloaded_count().await);
    println!("  permanently failed: {}", ledger.failed_count().await);
    println!("  downloads dir:      {}", settings.downloads_dir().display());
    Ok(())
}
