//! Durable crawl state: the record snapshot and the download ledger.

mod ledger;
mod snapshot;

pub use ledger::DownloadLedger;
pub use snapshot::{ProgressSnapshot, SnapshotStore};
