//! Single-consumer refresh loop: fetch, diff, persist, notify.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{
    ArchiveSourceItem, Attachment, ChangeEvent, EntitySnapshot, StaleEntity, SyncConfig,
};
use crate::pipeline::diff::diff;
use crate::pipeline::notify::{DispatchOutcome, NotificationDispatcher};
use crate::pipeline::queue::SyncQueue;
use crate::services::{FetchOutcome, SnapshotProvider};
use crate::storage::Persistence;

/// Result of processing one queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Refreshed {
        changes: Vec<ChangeEvent>,
        /// `None` when no notification was attempted
        dispatch: Option<DispatchOutcome>,
    },
    /// The provider did not recognize the entity
    Unknown,
}

pub struct RefreshWorker {
    store: Arc<dyn Persistence>,
    provider: Arc<dyn SnapshotProvider>,
    dispatcher: NotificationDispatcher,
    queue: Arc<SyncQueue>,
    fetch_timeout: Duration,
    politeness_delay: Duration,
    supervisor_cooldown: Duration,
    touched: Mutex<BTreeSet<String>>,
}

impl RefreshWorker {
    pub fn new(
        store: Arc<dyn Persistence>,
        provider: Arc<dyn SnapshotProvider>,
        dispatcher: NotificationDispatcher,
        queue: Arc<SyncQueue>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            provider,
            dispatcher,
            queue,
            fetch_timeout: config.fetch_timeout(),
            politeness_delay: config.politeness_delay(),
            supervisor_cooldown: config.supervisor_cooldown(),
            touched: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Categories that received new source items since the last call.
    pub async fn take_touched_categories(&self) -> Vec<String> {
        std::mem::take(&mut *self.touched.lock().await)
            .into_iter()
            .collect()
    }

    /// Refresh one entity.
    pub async fn process(&self, entity: &StaleEntity) -> Result<ItemOutcome> {
        let id = entity.entity_id.as_str();
        let previous = self.store.read_snapshot(id).await?;

        let fetched =
            match tokio::time::timeout(self.fetch_timeout, self.provider.fetch_snapshot(id)).await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(AppError::Timeout {
                        entity: id.to_string(),
                        secs: self.fetch_timeout.as_secs_f64(),
                    });
                }
            };

        let fetched = match fetched {
            FetchOutcome::Found(fetched) => fetched,
            FetchOutcome::Unknown => {
                log::warn!("Provider does not know entity {}; skipped", id);
                return Ok(ItemOutcome::Unknown);
            }
        };

        let snapshot = EntitySnapshot::refreshed(previous.as_ref(), entity, &fetched, Utc::now());
        self.store.upsert_snapshot(&snapshot).await?;

        if let Err(e) = self.record_attachments(id, &fetched.attachments).await {
            if e.is_structural() {
                return Err(e);
            }
            log::warn!("Could not record course works of {}: {}", id, e);
        }

        let changes = diff(previous.as_ref(), &snapshot);
        log::debug!("{}: {} change(s)", id, changes.len());

        let dispatch = match snapshot.target.address() {
            Some(address) if !changes.is_empty() => Some(
                self.dispatcher
                    .dispatch(address, &snapshot.display_name, &changes)
                    .await,
            ),
            Some(_) => None,
            None => {
                if !changes.is_empty() {
                    log::debug!("{} has no live owner; notification suppressed", id);
                }
                None
            }
        };

        Ok(ItemOutcome::Refreshed { changes, dispatch })
    }

    /// Record downloaded attachments as archive source items.
    async fn record_attachments(&self, entity_id: &str, attachments: &[Attachment]) -> Result<()> {
        let now = Utc::now();
        let mut items = Vec::new();
        for attachment in attachments {
            let Some(path) = attachment.path.as_deref() else {
                continue;
            };
            let path = PathBuf::from(path);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => items.push(ArchiveSourceItem {
                    path,
                    byte_size: meta.len(),
                    entity_id: entity_id.to_string(),
                    category: attachment.category.trim().to_string(),
                    semester: attachment.semester.clone(),
                    contributed_at: now,
                }),
                _ => log::debug!("Attachment {} is not on disk", path.display()),
            }
        }

        let inserted = self.store.record_source_items(&items).await?;
        if !inserted.is_empty() {
            let mut touched = self.touched.lock().await;
            touched.extend(inserted.into_iter().map(|item| item.category));
        }
        Ok(())
    }

    /// Consume the queue until cancelled.
    ///
    /// Per-entity failures are logged and the loop moves on; structural
    /// failures end the loop with an error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        log::info!("Refresh worker started");
        loop {
            let entity = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.queue.pop() => match next {
                    Some(entity) => entity,
                    None => break,
                },
            };

            let result = self.process(&entity).await;
            self.queue.task_done();

            if let Err(e) = result {
                if e.is_structural() {
                    return Err(e);
                }
                log::error!("Refresh of {} failed: {}", entity.entity_id, e);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.politeness_delay) => {}
            }
        }
        log::info!("Refresh worker stopped");
        Ok(())
    }

    /// Run the loop, restarting it after a cooldown whenever it fails.
    pub async fn run_supervised(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            match self.run(&cancel).await {
                Ok(()) => return,
                Err(e) => {
                    log::error!(
                        "Refresh worker crashed: {}; restarting in {}s",
                        e,
                        self.supervisor_cooldown.as_secs()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.supervisor_cooldown) => {}
                    }
                }
            }
        }
    }
}
