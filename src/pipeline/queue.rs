//! FIFO work queue with drain tracking.
//!
//! Every pushed item counts as outstanding until the consumer calls
//! [`SyncQueue::task_done`]; [`SyncQueue::join`] resolves once nothing is
//! outstanding.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};

use crate::models::StaleEntity;

pub struct SyncQueue {
    tx: mpsc::UnboundedSender<StaleEntity>,
    rx: Mutex<mpsc::UnboundedReceiver<StaleEntity>>,
    outstanding: AtomicUsize,
    drained: Notify,
}

impl SyncQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Append an item.
    pub fn push(&self, entity: StaleEntity) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(entity).is_err() {
            // Receiver lives in self, so this only happens mid-drop
            self.task_done();
        }
    }

    /// Wait for the next item. Cancel-safe.
    pub async fn pop(&self) -> Option<StaleEntity> {
        self.rx.lock().await.recv().await
    }

    /// Mark one popped item as fully processed.
    pub fn task_done(&self) {
        let previous = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Drop every item not yet popped, marking each done. Returns how many.
    ///
    /// Only call when no consumer is running; a consumer blocked in
    /// [`SyncQueue::pop`] holds the receiver.
    pub async fn discard_pending(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
            self.task_done();
        }
        discarded
    }

    /// Items pushed but not yet marked done.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every pushed item has been marked done.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::new()
    }
}
