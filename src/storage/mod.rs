//! Storage abstractions for snapshot and archive persistence.
//!
//! Each trait method is one short logical transaction. Callers never hold a
//! storage lock across a network call.
//!
//! ## Documents
//!
//! ```text
//! storage/
//! ├── snapshots.json        # entity id -> EntitySnapshot
//! ├── source_items.json     # contributed course-work files
//! └── archives.json         # category -> ArchiveDescriptor
//! ```

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{ArchiveDescriptor, ArchiveSourceItem, EntitySnapshot, StaleEntity};

// Re-export for convenience
pub use local::LocalStore;

/// Normalized lookup key for a category: trimmed and lowercased.
pub fn category_key(category: &str) -> String {
    category.trim().to_lowercase()
}

/// Trait for persistence backends.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load the stored snapshot of an entity.
    async fn read_snapshot(&self, entity_id: &str) -> Result<Option<EntitySnapshot>>;

    /// Insert or replace an entity snapshot.
    async fn upsert_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()>;

    /// Number of tracked entities.
    async fn count_entities(&self) -> Result<usize>;

    /// Entities never synced or last synced at or before `threshold`.
    async fn list_stale_entities(&self, threshold: DateTime<Utc>) -> Result<Vec<StaleEntity>>;

    /// Source items recorded for a category.
    async fn list_source_items(&self, category: &str) -> Result<Vec<ArchiveSourceItem>>;

    /// Contribution time of the newest source item in a category.
    async fn latest_source_timestamp(&self, category: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .list_source_items(category)
            .await?
            .iter()
            .map(|item| item.contributed_at)
            .max())
    }

    /// Record contributed items, returning the ones that were not known yet.
    async fn record_source_items(
        &self,
        items: &[ArchiveSourceItem],
    ) -> Result<Vec<ArchiveSourceItem>>;

    /// Load the stored archive descriptor of a category.
    async fn read_archive_descriptor(&self, category: &str) -> Result<Option<ArchiveDescriptor>>;

    /// Replace the archive descriptor of `descriptor.category`.
    async fn write_archive_descriptor(&self, descriptor: &ArchiveDescriptor) -> Result<()>;
}
