//! Background download worker pool.
//!
//! Records are queued while collection is still running; a small fixed set
//! of workers drains the queue through the shared [`DownloadService`]. The
//! stop signal is a `watch` channel checked between items — never a sentinel
//! queue value — so workers finish the item in hand and exit cleanly.
//! Call [`BackgroundDownloader::wait`] before [`BackgroundDownloader::stop`]
//! when queued work must drain first.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::debug;

use super::{DownloadOutcome, DownloadService};
use crate::models::Record;

pub struct BackgroundDownloader {
    queue_tx: mpsc::UnboundedSender<Record>,
    stop_tx: watch::Sender<bool>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    downloaded: Arc<AtomicUsize>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl BackgroundDownloader {
    /// Spawn `workers` tasks draining a shared queue.
    pub fn start(service: Arc<DownloadService>, workers: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Record>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (stop_tx, stop_rx) = watch::channel(false);
        let pending = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        let downloaded = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let queue_rx = queue_rx.clone();
            let mut stop_rx = stop_rx.clone();
            let service = service.clone();
            let pending = pending.clone();
            let drained = drained.clone();
            let downloaded = downloaded.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let record = {
                        let mut rx = queue_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = stop_rx.changed() => break,
                            record = rx.recv() => match record {
                                Some(record) => record,
                                None => break,
                            },
                        }
                    };

                    let outcome = service.attempt(&record).await;
                    if outcome == DownloadOutcome::Downloaded {
                        downloaded.fetch_add(1, Ordering::Relaxed);
                    }
                    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        drained.notify_waiters();
                    }
                }
                debug!("download worker {} exiting", worker_id);
            }));
        }

        Self {
            queue_tx,
            stop_tx,
            pending,
            drained,
            downloaded,
            handles,
        }
    }

    /// Queue records for download. Safe to call while workers are running.
    pub fn enqueue(&self, records: &[Record]) {
        for record in records {
            self.pending.fetch_add(1, Ordering::SeqCst);
            if self.queue_tx.send(record.clone()).is_err() {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Block until every queued record has been processed.
    pub async fn wait(&self) {
        loop {
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// New downloads completed so far.
    pub fn downloaded_count(&self) -> usize {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Signal workers to finish their current item and exit, then join
    /// them. Returns the total count of new downloads.
    pub async fn stop(self) -> usize {
        let Self {
            queue_tx,
            stop_tx,
            downloaded,
            handles,
            ..
        } = self;

        let _ = stop_tx.send(true);
        drop(queue_tx);
        for handle in handles {
            let _ = handle.await;
        }
        downloaded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    use crate::scrapers::{FetchedPayload, SessionFetch};
    use crate::store::DownloadLedger;

    /// Always serves a valid PDF, counting calls.
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionFetch for CountingFetcher {
        async fn fetch(&self, _url: &str) -> anyhow::Result<FetchedPayload> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(FetchedPayload {
                status: 200,
                bytes: b"%PDF-1.4 content".to_vec(),
            })
        }
    }

    fn record(i: usize) -> Record {
        Record::new(
            format!("https://example.com/{i}.pdf"),
            format!("{i}.pdf"),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_counts_downloads() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(DownloadLedger::open(dir.path()).unwrap());
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let service = Arc::new(DownloadService::new(fetcher, ledger.clone(), dir.path()));

        let pool = BackgroundDownloader::start(service, 3);
        let records: Vec<Record> = (0..8).map(record).collect();
        pool.enqueue(&records);
        pool.wait().await;

        assert_eq!(pool.downloaded_count(), 8);
        let total = pool.stop().await;
        assert_eq!(total, 8);
        assert_eq!(ledger.downloaded_count().await, 8);
    }

    #[tokio::test]
    async fn test_pool_skips_duplicate_enqueues() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(DownloadLedger::open(dir.path()).unwrap());
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let service = Arc::new(DownloadService::new(
            fetcher.clone(),
            ledger,
            dir.path(),
        ));

        let pool = BackgroundDownloader::start(service, 2);
        let one = vec![record(1)];
        pool.enqueue(&one);
        pool.wait().await;
        pool.enqueue(&one);
        pool.wait().await;

        assert_eq!(pool.stop().await, 1);
        assert_eq!(fetcher.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let dir = tempdir().unwrap();
        let ledger = Arc::new(DownloadLedger::open(dir.path()).unwrap());
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
        });
        let service = Arc::new(DownloadService::new(fetcher, ledger, dir.path()));

        let pool = BackgroundDownloader::start(service, 2);
        pool.wait().await;
        assert_eq!(pool.stop().await, 0);
    }
}
