// src/models/mod.rs

//! Domain models for the sync application.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod archive;
mod change;
mod config;
mod snapshot;

// Re-export all public types
pub use archive::{ArchiveDescriptor, ArchiveOutcome, ArchivePart, ArchiveSourceItem};
pub use change::ChangeEvent;
pub use config::{
    ArchiveConfig, Config, LoggingConfig, ProviderConfig, StorageConfig, SyncConfig,
    TelegramConfig,
};
pub use snapshot::{
    Attachment, AttributeMap, EntitySnapshot, FetchedSnapshot, NOT_ENROLLED, PLACEHOLDER_TARGETS,
    RoutingTarget, StaleEntity, attribute_key, is_sentinel, split_attribute_key,
};
