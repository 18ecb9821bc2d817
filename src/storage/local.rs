//! Local filesystem storage implementation.
//!
//! Keeps every collection in one pretty-printed JSON document under the
//! storage root. Writes go to a temp file that is renamed over the target, so
//! a crash never leaves a half-written document behind.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── snapshots.json
//! ├── source_items.json
//! └── archives.json
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{ArchiveDescriptor, ArchiveSourceItem, EntitySnapshot, StaleEntity};
use crate::storage::{Persistence, category_key};

const SNAPSHOTS: &str = "snapshots.json";
const SOURCE_ITEMS: &str = "source_items.json";
const ARCHIVES: &str = "archives.json";

type SnapshotDoc = BTreeMap<String, EntitySnapshot>;
type ArchiveDoc = BTreeMap<String, ArchiveDescriptor>;

/// Local filesystem storage backend.
pub struct LocalStore {
    root_dir: PathBuf,
    // Serializes read-modify-write cycles on the documents
    lock: Mutex<()>,
}

impl LocalStore {
    /// Open (and create if needed) a store rooted at the given directory.
    pub async fn open(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        tokio::fs::create_dir_all(&root_dir).await.map_err(|e| {
            AppError::storage_unavailable(format!(
                "cannot create storage root {}: {e}",
                root_dir.display()
            ))
        })?;
        Ok(Self {
            root_dir,
            lock: Mutex::new(()),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Fail structurally when the storage root has disappeared.
    async fn ensure_root(&self) -> Result<()> {
        match tokio::fs::metadata(&self.root_dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(AppError::storage_unavailable(format!(
                "storage root {} is not a directory",
                self.root_dir.display()
            ))),
            Err(e) => Err(AppError::storage_unavailable(format!(
                "storage root {} is unreachable: {e}",
                self.root_dir.display()
            ))),
        }
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Write JSON data.
    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read a JSON document, falling back to its default when absent.
    async fn read_doc<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(T::default()),
        }
    }

    /// Source paths are stored with forward slashes only.
    fn normalize_path(path: &Path) -> PathBuf {
        PathBuf::from(path.to_string_lossy().replace('\\', "/"))
    }
}

#[async_trait]
impl Persistence for LocalStore {
    async fn read_snapshot(&self, entity_id: &str) -> Result<Option<EntitySnapshot>> {
        let _guard = self.lock.lock().await;
        self.ensure_root().await?;

        let mut snapshots: SnapshotDoc = self.read_doc(SNAPSHOTS).await?;
        Ok(snapshots.remove(entity_id))
    }

    async fn upsert_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.ensure_root().await?;

        let mut snapshots: SnapshotDoc = self.read_doc(SNAPSHOTS).await?;
        snapshots.insert(snapshot.entity_id.clone(), snapshot.clone());
        self.write_json(SNAPSHOTS, &snapshots).await?;

        log::debug!("Snapshot stored for {}", snapshot.entity_id);
        Ok(())
    }

    async fn count_entities(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        self.ensure_root().await?;

        let snapshots: SnapshotDoc = self.read_doc(SNAPSHOTS).await?;
        Ok(snapshots.len())
    }

    async fn list_stale_entities(&self, threshold: DateTime<Utc>) -> Result<Vec<StaleEntity>> {
        let _guard = self.lock.lock().await;
        self.ensure_root().await?;

        let snapshots: SnapshotDoc = self.read_doc(SNAPSHOTS).await?;
        let mut stale: Vec<&EntitySnapshot> = snapshots
            .values()
            .filter(|s| s.last_synced.is_none_or(|t| t <= threshold))
            .collect();

        // Never-synced first, then oldest first
        stale.sort_by(|a, b| {
            a.last_synced
                .cmp(&b.last_synced)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        Ok(stale.into_iter().map(StaleEntity::from).collect())
    }

    async fn list_source_items(&self, category: &str) -> Result<Vec<ArchiveSourceItem>> {
        let _guard = self.lock.lock().await;
        self.ensure_root().await?;

        let key = category_key(category);
        let items: Vec<ArchiveSourceItem> = self.read_doc(SOURCE_ITEMS).await?;
        Ok(items
            .into_iter()
            .filter(|item| category_key(&item.category) == key)
            .collect())
    }

    async fn record_source_items(
        &self,
        items: &[ArchiveSourceItem],
    ) -> Result<Vec<ArchiveSourceItem>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.lock.lock().await;
        self.ensure_root().await?;

        let mut stored: Vec<ArchiveSourceItem> = self.read_doc(SOURCE_ITEMS).await?;
        let mut known: HashSet<(String, String, PathBuf)> = stored
            .iter()
            .map(|i| (i.entity_id.clone(), category_key(&i.category), i.path.clone()))
            .collect();

        let mut inserted = Vec::new();
        for item in items {
            let mut item = item.clone();
            item.path = Self::normalize_path(&item.path);

            let identity = (
                item.entity_id.clone(),
                category_key(&item.category),
                item.path.clone(),
            );
            if known.insert(identity) {
                inserted.push(item);
            }
        }

        if !inserted.is_empty() {
            stored.extend(inserted.iter().cloned());
            self.write_json(SOURCE_ITEMS, &stored).await?;
            log::info!("Recorded {} new source item(s)", inserted.len());
        }

        Ok(inserted)
    }

    async fn read_archive_descriptor(&self, category: &str) -> Result<Option<ArchiveDescriptor>> {
        let _guard = self.lock.lock().await;
        self.ensure_root().await?;

        let mut archives: ArchiveDoc = self.read_doc(ARCHIVES).await?;
        Ok(archives.remove(&category_key(category)))
    }

    async fn write_archive_descriptor(&self, descriptor: &ArchiveDescriptor) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.ensure_root().await?;

        let mut archives: ArchiveDoc = self.read_doc(ARCHIVES).await?;
        archives.insert(category_key(&descriptor.category), descriptor.clone());
        self.write_json(ARCHIVES, &archives).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::TempDir;

    use super::*;
    use crate::models::{ArchivePart, RoutingTarget};

    fn source_item(entity: &str, category: &str, path: &str) -> ArchiveSourceItem {
        ArchiveSourceItem {
            path: PathBuf::from(path),
            byte_size: 10,
            entity_id: entity.to_string(),
            category: category.to_string(),
            semester: None,
            contributed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).await.unwrap();

        store.write_bytes("test.txt", b"hello").await.unwrap();
        let data = store.read_bytes("test.txt").await.unwrap();
        assert_eq!(data, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).await.unwrap();

        assert!(store.read_bytes("nope.txt").await.unwrap().is_none());
        assert!(store.read_snapshot("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).await.unwrap();

        let mut snapshot =
            EntitySnapshot::registered("42", RoutingTarget::new("1001"), Some("A-1".into()));
        snapshot
            .attributes
            .insert("Algorithms (module 1)".into(), Some("8".into()));
        store.upsert_snapshot(&snapshot).await.unwrap();

        let loaded = store.read_snapshot("42").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_stale_entities_ordering() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).await.unwrap();
        let now = Utc::now();

        let mut fresh = EntitySnapshot::registered("fresh", RoutingTarget::new("1"), None);
        fresh.last_synced = Some(now);
        let mut old = EntitySnapshot::registered("old", RoutingTarget::new("2"), None);
        old.last_synced = Some(now - Duration::hours(2));
        let never = EntitySnapshot::registered("never", RoutingTarget::placeholder(), None);

        for s in [&fresh, &old, &never] {
            store.upsert_snapshot(s).await.unwrap();
        }

        let stale = store
            .list_stale_entities(now - Duration::minutes(5))
            .await
            .unwrap();
        let ids: Vec<&str> = stale.iter().map(|s| s.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["never", "old"]);
        assert!(stale[0].target.is_placeholder());
        assert_eq!(store.count_entities().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_record_source_items_dedupes_and_normalizes() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).await.unwrap();

        let first = store
            .record_source_items(&[source_item("1", "Algorithms", "course_works\\lab1.pdf")])
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].path, PathBuf::from("course_works/lab1.pdf"));

        let again = store
            .record_source_items(&[
                source_item("1", " algorithms ", "course_works/lab1.pdf"),
                source_item("2", "Algorithms", "course_works/lab2.pdf"),
            ])
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].entity_id, "2");

        let listed = store.list_source_items("ALGORITHMS").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(store.latest_source_timestamp("Algorithms").await.unwrap().is_some());
        assert!(store.latest_source_timestamp("Physics").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archive_descriptor_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).await.unwrap();

        let descriptor = ArchiveDescriptor {
            category: "Algorithms".into(),
            parts: vec![ArchivePart {
                path: tmp.path().join("Algorithms.zip"),
                byte_size: 100,
                entry_count: 2,
                sha256: "ab".into(),
            }],
            item_count: 2,
            total_bytes: 100,
            built_at: Utc::now(),
        };
        store.write_archive_descriptor(&descriptor).await.unwrap();

        let loaded = store.read_archive_descriptor("algorithms").await.unwrap();
        assert_eq!(loaded, Some(descriptor));
    }

    #[tokio::test]
    async fn test_missing_root_is_structural() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("db");
        let store = LocalStore::open(&root).await.unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let err = store.read_snapshot("42").await.unwrap_err();
        assert!(err.is_structural());
    }
}
