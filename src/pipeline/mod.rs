//! Background sync pipeline.
//!
//! - `scheduler`: periodic sweep feeding stale entities to the worker
//! - `worker`: fetch, diff, persist and notify, one entity at a time
//! - `diff`: change detection between two snapshots
//! - `notify`: change message rendering and delivery
//! - `archive`: size-bounded course-work archives per category

pub mod archive;
pub mod diff;
pub mod notify;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use archive::{ArchiveManager, ArchiveState, PartWriter, ZipPartWriter};
pub use diff::diff;
pub use notify::{DispatchOutcome, NotificationDispatcher};
pub use queue::SyncQueue;
pub use scheduler::{CycleReport, RecordSyncScheduler};
pub use worker::{ItemOutcome, RefreshWorker};
