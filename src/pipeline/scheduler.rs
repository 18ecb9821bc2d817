//! Periodic stale-entity sweep.
//!
//! Each cycle enqueues every entity that was never synced or whose last sync
//! is older than the staleness threshold, waits until the worker has drained
//! the queue, then force-rebuilds the archives of categories that received
//! new course works during the cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{ArchiveOutcome, SyncConfig};
use crate::pipeline::archive::ArchiveManager;
use crate::pipeline::worker::RefreshWorker;
use crate::storage::Persistence;
use crate::utils::log::summary;

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub enqueued: usize,
    /// Archive rebuilds triggered after the queue drained
    pub archives: Vec<(String, ArchiveOutcome)>,
    /// Stopped before the queue drained
    pub cancelled: bool,
}

impl CycleReport {
    fn log(&self) {
        if self.enqueued == 0 && self.archives.is_empty() {
            log::debug!("Sync cycle: nothing stale");
            return;
        }
        let mut items = vec![("Refreshed", self.enqueued.to_string())];
        for (category, outcome) in &self.archives {
            items.push((category.as_str(), outcome.message.clone()));
        }
        summary("Sync cycle", &items);
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct RecordSyncScheduler {
    store: Arc<dyn Persistence>,
    worker: Arc<RefreshWorker>,
    archives: Arc<ArchiveManager>,
    period: Duration,
    stale_after: Duration,
    error_backoff: Duration,
    running: Mutex<Option<Running>>,
}

impl RecordSyncScheduler {
    pub fn new(
        store: Arc<dyn Persistence>,
        worker: Arc<RefreshWorker>,
        archives: Arc<ArchiveManager>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            worker,
            archives,
            period: config.period(),
            stale_after: config.stale_after(),
            error_backoff: config.error_backoff(),
            running: Mutex::new(None),
        }
    }

    /// Spawn the scheduler loop and the supervised worker.
    ///
    /// Returns `false` if already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            log::warn!("Sync scheduler is already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&self.worker).run_supervised(cancel.clone()));
        let scheduler = tokio::spawn(Arc::clone(self).run_loop(cancel.clone()));

        *running = Some(Running {
            cancel,
            handles: vec![scheduler, worker],
        });
        log::info!(
            "Sync scheduler started (period {}s, stale after {}s)",
            self.period.as_secs(),
            self.stale_after.as_secs()
        );
        true
    }

    /// Cancel both loops and wait for them.
    ///
    /// An entity or archive already in progress is finished first.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                log::error!("Sync task ended abnormally: {}", e);
            }
        }
        self.discard_abandoned().await;
        log::info!("Sync scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// One cycle with a temporary worker, for callers that do not `start()`.
    pub async fn run_once(&self) -> Result<CycleReport> {
        if self.is_running().await {
            return Err(AppError::validation(
                "scheduler is running; its own loop already syncs",
            ));
        }

        let cancel = CancellationToken::new();
        let mut worker = {
            let worker = Arc::clone(&self.worker);
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(&cancel).await })
        };

        let cycle = self.run_cycle(&cancel);
        tokio::pin!(cycle);

        let report = tokio::select! {
            report = &mut cycle => report,
            ended = &mut worker => {
                // Nobody consumes the queue anymore, so the cycle cannot drain
                cancel.cancel();
                let err = match ended {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => AppError::validation("refresh worker stopped mid-cycle"),
                    Err(e) => AppError::validation(format!("refresh worker ended abnormally: {e}")),
                };
                log::error!("Sync cycle aborted: {}", err);
                self.discard_abandoned().await;
                return Err(err);
            }
        };

        cancel.cancel();
        match worker.await {
            Ok(Err(e)) => log::error!("Refresh worker failed: {}", e),
            Err(e) => log::error!("Refresh worker ended abnormally: {}", e),
            Ok(Ok(())) => {}
        }
        report
    }

    /// Drop queue items of an interrupted cycle so the next cycle does not
    /// fetch them twice. Call only once the worker has stopped.
    async fn discard_abandoned(&self) {
        let discarded = self.worker.queue().discard_pending().await;
        if discarded > 0 {
            log::info!("Dropped {} queued entit(ies) of the interrupted cycle", discarded);
        }
    }

    /// Enqueue stale entities, wait for the drain, refresh touched archives.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let stale_after = TimeDelta::from_std(self.stale_after)
            .map_err(|e| AppError::config(format!("stale threshold out of range: {e}")))?;
        let threshold = Utc::now() - stale_after;

        let stale = self.store.list_stale_entities(threshold).await?;
        let mut report = CycleReport {
            enqueued: stale.len(),
            ..CycleReport::default()
        };
        if stale.is_empty() {
            return Ok(report);
        }

        log::info!("Queueing {} stale entit(ies)", stale.len());
        let queue = self.worker.queue();
        for entity in stale {
            queue.push(entity);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                report.cancelled = true;
                return Ok(report);
            }
            _ = queue.join() => {}
        }

        for category in self.worker.take_touched_categories().await {
            let outcome = self.archives.get_or_create_archive(&category, true).await;
            report.archives.push((category, outcome));
        }
        Ok(report)
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let pause = match self.run_cycle(&cancel).await {
                Ok(report) => {
                    report.log();
                    self.period
                }
                Err(e) => {
                    log::error!(
                        "Sync cycle failed: {}; retrying in {}s",
                        e,
                        self.error_backoff.as_secs()
                    );
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}
