//! Age-based eviction

use crate::store::ItemStore;
use crate::types::{DeleteOutcome, SweepReport};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Periodically removes items older than a maximum age
pub struct Sweeper {
    store: ItemStore,
    max_age: Duration,
    interval: Duration,
    /// Running total of items this sweeper removed
    swept: Arc<AtomicU64>,
}

impl Sweeper {
    pub fn new(store: ItemStore, max_age: Duration, interval: Duration) -> Self {
        Self {
            store,
            max_age,
            interval,
            swept: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn with_counter(mut self, swept: Arc<AtomicU64>) -> Self {
        self.swept = swept;
        self
    }

    pub fn swept_total(&self) -> u64 {
        self.swept.load(Ordering::Relaxed)
    }

    /// Run one sweep cycle.
    ///
    /// Each expired item is deleted in its own task. The cycle waits at
    /// most one interval for them; slower deletes (typically ones waiting
    /// for a reader to finish) keep running in the background.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let items = match self.store.list().await {
            Ok(items) => items,
            Err(e) => {
                warn!(stash_dir = ?self.store.root(), error = %e, "Failed to scan stash directory");
                return report;
            }
        };
        report.scanned = items.len();

        let now = Utc::now();
        let mut deletes = JoinSet::new();
        for item in items {
            let age = now
                .signed_duration_since(item.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age <= self.max_age {
                continue;
            }

            report.expired += 1;
            let store = self.store.clone();
            let swept = self.swept.clone();
            deletes.spawn(async move {
                let result = store.delete(&item.id).await;
                if let Ok(DeleteOutcome::Removed) = result {
                    swept.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %item.id, age_ms = age.as_millis() as u64, "Swept expired item");
                }
                (item.id, result)
            });
        }

        let deadline = sleep(self.interval);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = deletes.join_next() => match joined {
                    None => break,
                    Some(Ok((_, Ok(DeleteOutcome::Removed)))) => report.removed += 1,
                    Some(Ok((_, Ok(_)))) => {}
                    Some(Ok((id, Err(e)))) => {
                        report.failed += 1;
                        warn!(id = %id, error = %e, "Failed to delete expired item, retrying next sweep");
                    }
                    Some(Err(e)) => {
                        report.failed += 1;
                        warn!(error = %e, "Delete task failed");
                    }
                },
                _ = &mut deadline => {
                    debug!(pending = deletes.len(), "Leaving slow deletes to finish in the background");
                    deletes.detach_all();
                    break;
                }
            }
        }

        report
    }

    /// Start sweeping in the background. The first cycle runs immediately.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(
                stash_dir = ?self.store.root(),
                max_age_ms = self.max_age.as_millis() as u64,
                interval_ms = self.interval.as_millis() as u64,
                "Sweeper started"
            );

            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.sweep_once().await;
                        if report.expired > 0 {
                            info!(
                                scanned = report.scanned,
                                expired = report.expired,
                                removed = report.removed,
                                failed = report.failed,
                                "Sweep cycle finished"
                            );
                        } else {
                            debug!(scanned = report.scanned, "Sweep cycle found nothing to remove");
                        }
                    }
                    // Fires on shutdown and when the handle is dropped
                    _ = shutdown_rx.changed() => break,
                }
            }

            info!("Sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running sweeper. Dropping it stops the loop.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the loop and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
