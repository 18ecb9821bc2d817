//! Service layer for the sync application.
//!
//! This module contains the external collaborators:
//! - Snapshot fetching (`SnapshotProvider`, `HttpSnapshotProvider`)
//! - Message delivery (`Messenger`, `TelegramMessenger`)

mod messenger;
mod provider;

pub use messenger::{Messenger, TelegramMessenger};
pub use provider::{FetchOutcome, HttpSnapshotProvider, SnapshotProvider, UNKNOWN_NAME};
