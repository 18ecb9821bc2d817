//! Size-bounded course-work archives.
//!
//! Every category (discipline) gets one archive built from the source items
//! recorded for it. When the items do not fit under the part cap they are
//! packed greedily, in recorded order, into several parts named
//! `<category>.part{i}of{N}.zip`; otherwise a single `<category>.zip` is
//! written.
//!
//! A build runs in three steps:
//!
//! 1. Survey: drop items whose file is gone, read sizes from disk, drop items
//!    that alone exceed the cap.
//! 2. Stage: write every part into a fresh staging directory. Any failure
//!    removes the staging directory and leaves the stored descriptor and the
//!    previous parts alone.
//! 3. Promote: move staged parts into the archive directory, store the new
//!    descriptor, then delete old parts that are no longer referenced.
//!
//! Builds of one category are serialized; a caller that waited for another
//! build re-checks freshness first.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::{AppError, Result};
use crate::models::{
    ArchiveConfig, ArchiveDescriptor, ArchiveOutcome, ArchivePart, ArchiveSourceItem,
};
use crate::storage::{Persistence, category_key};
use crate::utils::fs::{remove_file_if_exists, safe_component, sha256_file};
use crate::utils::log::format_bytes;

/// Lifecycle state of a category's archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    /// Never built
    Absent,
    Fresh,
    /// A part is missing or newer source items exist
    Stale,
}

/// One file to put into a part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartEntry {
    /// Name inside the archive
    pub name: String,
    pub source: PathBuf,
}

/// Writes one archive part. Called from a blocking thread.
pub trait PartWriter: Send + Sync {
    /// Write `entries` into a new archive at `dest` and return its size in bytes.
    fn write_part(&self, dest: &Path, entries: &[PartEntry]) -> Result<u64>;
}

/// Deflate-compressed ZIP parts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipPartWriter;

impl PartWriter for ZipPartWriter {
    fn write_part(&self, dest: &Path, entries: &[PartEntry]) -> Result<u64> {
        let mut zip = ZipWriter::new(File::create(dest)?);
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for entry in entries {
            zip.start_file(entry.name.as_str(), options)?;
            let mut source = File::open(&entry.source)?;
            io::copy(&mut source, &mut zip)?;
        }

        let file = zip.finish()?;
        Ok(file.metadata()?.len())
    }
}

/// A surviving source item with its on-disk size.
#[derive(Debug, Clone)]
struct SourceFile {
    item: ArchiveSourceItem,
    size: u64,
}

/// A part written to the staging directory.
struct StagedPart {
    staged: PathBuf,
    part: ArchivePart,
}

/// Builds and caches per-category archives.
pub struct ArchiveManager {
    store: Arc<dyn Persistence>,
    archive_dir: PathBuf,
    max_part_bytes: u64,
    writer: Arc<dyn PartWriter>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArchiveManager {
    /// Create a manager writing ZIP parts into `config.dir`.
    pub fn new(store: Arc<dyn Persistence>, config: &ArchiveConfig) -> Self {
        Self {
            store,
            archive_dir: config.dir.clone(),
            max_part_bytes: config.max_part_bytes,
            writer: Arc::new(ZipPartWriter),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the part writer.
    pub fn with_writer(mut self, writer: Arc<dyn PartWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn max_part_bytes(&self) -> u64 {
        self.max_part_bytes
    }

    /// Return the category's archive, rebuilding it when stale, absent or forced.
    ///
    /// Never fails: errors end up in [`ArchiveOutcome::message`].
    pub async fn get_or_create_archive(&self, category: &str, force: bool) -> ArchiveOutcome {
        log::info!(
            "Archive requested for '{}' (force={})",
            category.trim(),
            force
        );

        let lock = self.category_lock(category).await;
        let _guard = lock.lock().await;

        match self.build(category.trim(), force).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Archive build for '{}' failed: {}", category.trim(), e);
                ArchiveOutcome::failed(e.to_string())
            }
        }
    }

    /// Current lifecycle state of a category's archive.
    pub async fn status(&self, category: &str) -> Result<ArchiveState> {
        Ok(self.assess(category.trim()).await?.0)
    }

    async fn category_lock(&self, category: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(category_key(category)).or_default())
    }

    async fn assess(&self, category: &str) -> Result<(ArchiveState, Option<ArchiveDescriptor>)> {
        let Some(descriptor) = self.store.read_archive_descriptor(category).await? else {
            return Ok((ArchiveState::Absent, None));
        };
        let latest = self.store.latest_source_timestamp(category).await?;
        let state = if descriptor.is_fresh(latest) {
            ArchiveState::Fresh
        } else {
            ArchiveState::Stale
        };
        Ok((state, Some(descriptor)))
    }

    async fn build(&self, category: &str, force: bool) -> Result<ArchiveOutcome> {
        let (state, previous) = self.assess(category).await?;
        match (&previous, state) {
            (Some(descriptor), ArchiveState::Fresh) if !force => {
                log::info!("Archive for '{}' is up to date", category);
                return Ok(ArchiveOutcome::unchanged(
                    descriptor.part_paths(),
                    "archive is up to date",
                ));
            }
            (Some(_), ArchiveState::Stale) => {
                log::info!("Archive for '{}' is stale, rebuilding", category)
            }
            _ => {}
        }

        // Items contributed after this instant make the new archive stale
        let started = Utc::now();

        let items = self.store.list_source_items(category).await?;
        let present = Self::survey(items).await;
        if present.is_empty() {
            log::warn!("No files to archive for '{}'", category);
            return Ok(ArchiveOutcome::failed("nothing to archive"));
        }

        let files = self.drop_oversized(present);
        if files.is_empty() {
            log::error!("Every file for '{}' exceeds the part size cap", category);
            return Ok(ArchiveOutcome::failed("all files exceed the part size cap"));
        }

        let item_count = files.len();
        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        log::info!(
            "Archiving {} file(s) for '{}', {} in total",
            item_count,
            category,
            format_bytes(total_bytes)
        );

        let buckets = pack_greedy(files, self.max_part_bytes, |f| f.size);
        let promotion = self.write_parts(category, buckets).await?;

        let descriptor = ArchiveDescriptor {
            category: category.to_string(),
            parts: promotion.parts.clone(),
            item_count,
            total_bytes,
            built_at: started,
        };
        if let Err(e) = self.store.write_archive_descriptor(&descriptor).await {
            promotion.roll_back().await;
            return Err(e);
        }
        promotion.commit().await;
        if let Some(previous) = previous {
            Self::remove_unreferenced(&previous, &descriptor).await;
        }

        let message = if descriptor.parts.len() == 1 {
            format!("Archive created. Files: {}", item_count)
        } else {
            format!(
                "Created {} archive parts. Files: {}",
                descriptor.parts.len(),
                item_count
            )
        };
        log::info!("{} ('{}')", message, category);
        Ok(ArchiveOutcome::rebuilt(descriptor.part_paths(), message))
    }

    /// Keep items whose file still exists, with sizes read from disk.
    async fn survey(items: Vec<ArchiveSourceItem>) -> Vec<SourceFile> {
        let mut seen = HashSet::new();
        let mut files = Vec::with_capacity(items.len());
        for item in items {
            if !seen.insert(item.path.clone()) {
                continue;
            }
            match tokio::fs::metadata(&item.path).await {
                Ok(meta) if meta.is_file() => files.push(SourceFile {
                    size: meta.len(),
                    item,
                }),
                _ => log::debug!("Source file missing on disk: {}", item.path.display()),
            }
        }
        files
    }

    fn drop_oversized(&self, files: Vec<SourceFile>) -> Vec<SourceFile> {
        let cap = self.max_part_bytes;
        files
            .into_iter()
            .filter(|f| {
                let fits = f.size <= cap;
                if !fits {
                    log::warn!(
                        "{} is {} and exceeds the {} part cap; skipped",
                        f.item.path.display(),
                        format_bytes(f.size),
                        format_bytes(cap)
                    );
                }
                fits
            })
            .collect()
    }

    /// Stage every part, then move them into the archive directory.
    ///
    /// Files the new parts replace are parked in the staging directory until
    /// the caller commits or rolls back.
    async fn write_parts(
        &self,
        category: &str,
        buckets: Vec<Vec<SourceFile>>,
    ) -> Result<Promotion> {
        let staging = self.archive_dir.join(format!(
            ".staging-{}-{}",
            archive_base_name(category),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        tokio::fs::create_dir_all(&staging).await?;

        let staged = match self.stage(category, &staging, buckets).await {
            Ok(staged) => staged,
            Err(e) => {
                discard_staging(&staging).await;
                return Err(e);
            }
        };

        let mut promotion = Promotion {
            staging,
            parts: Vec::with_capacity(staged.len()),
            replaced: Vec::new(),
        };
        for StagedPart { staged: from, part } in staged {
            if let Err(e) = promotion.promote(&from, part).await {
                promotion.roll_back().await;
                return Err(AppError::archive(category, e));
            }
        }
        Ok(promotion)
    }

    async fn stage(
        &self,
        category: &str,
        staging: &Path,
        buckets: Vec<Vec<SourceFile>>,
    ) -> Result<Vec<StagedPart>> {
        let names = part_file_names(category, buckets.len());
        let total = buckets.len();
        let mut staged = Vec::with_capacity(total);

        for (index, (bucket, name)) in buckets.into_iter().zip(names).enumerate() {
            let number = index + 1;
            let entries = part_entries(&bucket);
            let dest = staging.join(&name);
            log::info!(
                "Writing part {}/{} for '{}' ({} file(s))",
                number,
                total,
                category,
                entries.len()
            );

            let writer = Arc::clone(&self.writer);
            let target = dest.clone();
            let entry_count = entries.len();
            let written = tokio::task::spawn_blocking(move || {
                let size = writer.write_part(&target, &entries)?;
                let digest = sha256_file(&target)?;
                Ok::<_, AppError>((size, digest))
            })
            .await
            .map_err(|e| AppError::archive(category, e))
            .and_then(|r| r);

            let (byte_size, sha256) = written.map_err(|e| {
                AppError::archive(
                    category,
                    format!("failed to write part {number} of {total}: {e}"),
                )
            })?;

            if byte_size > self.max_part_bytes {
                return Err(AppError::archive(
                    category,
                    format!(
                        "part {number} of {total} is {byte_size} bytes, above the {} byte cap",
                        self.max_part_bytes
                    ),
                ));
            }

            staged.push(StagedPart {
                staged: dest,
                part: ArchivePart {
                    path: self.archive_dir.join(&name),
                    byte_size,
                    entry_count,
                    sha256,
                },
            });
        }

        Ok(staged)
    }

    async fn remove_unreferenced(previous: &ArchiveDescriptor, current: &ArchiveDescriptor) {
        let keep: HashSet<&Path> = current.parts.iter().map(|p| p.path.as_path()).collect();
        for part in &previous.parts {
            if keep.contains(part.path.as_path()) {
                continue;
            }
            match remove_file_if_exists(&part.path).await {
                Ok(()) => log::info!("Removed outdated part {}", part.path.display()),
                Err(e) => log::warn!(
                    "Could not remove outdated part {}: {}",
                    part.path.display(),
                    e
                ),
            }
        }
    }
}

/// Parts moved into the archive directory but not yet referenced by a
/// stored descriptor.
struct Promotion {
    staging: PathBuf,
    parts: Vec<ArchivePart>,
    /// (parked copy in staging, original location) of overwritten files
    replaced: Vec<(PathBuf, PathBuf)>,
}

impl Promotion {
    async fn promote(&mut self, staged: &Path, part: ArchivePart) -> io::Result<()> {
        if tokio::fs::try_exists(&part.path).await? {
            let name = part.path.file_name().unwrap_or_default();
            let parked = self
                .staging
                .join(format!(".previous-{}", name.to_string_lossy()));
            tokio::fs::rename(&part.path, &parked).await?;
            self.replaced.push((parked, part.path.clone()));
        }
        tokio::fs::rename(staged, &part.path).await?;
        self.parts.push(part);
        Ok(())
    }

    /// Put the archive directory back the way it was.
    async fn roll_back(self) {
        for part in &self.parts {
            if let Err(e) = remove_file_if_exists(&part.path).await {
                log::error!("Could not remove new part {}: {}", part.path.display(), e);
            }
        }
        for (parked, original) in &self.replaced {
            if let Err(e) = tokio::fs::rename(parked, original).await {
                log::error!("Could not restore {}: {}", original.display(), e);
            }
        }
        discard_staging(&self.staging).await;
    }

    /// Drop the parked files once the new descriptor is stored.
    async fn commit(self) {
        discard_staging(&self.staging).await;
    }
}

async fn discard_staging(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await {
        if e.kind() != io::ErrorKind::NotFound {
            log::error!(
                "Could not remove staging directory {}: {}",
                staging.display(),
                e
            );
        }
    }
}

/// File-name stem for a category: trimmed, with whitespace and path
/// separators replaced by `_`.
pub fn archive_base_name(category: &str) -> String {
    safe_component(category)
}

/// Part file names: `<base>.zip` for one part, `<base>.part{i}of{N}.zip` otherwise.
pub fn part_file_names(category: &str, count: usize) -> Vec<String> {
    let base = archive_base_name(category);
    if count == 1 {
        return vec![format!("{base}.zip")];
    }
    (1..=count)
        .map(|i| format!("{base}.part{i}of{count}.zip"))
        .collect()
}

/// Pack items in order, closing a bucket when the next item would push it over `cap`.
///
/// Items larger than `cap` must be removed beforehand.
pub fn pack_greedy<T>(items: Vec<T>, cap: u64, size: impl Fn(&T) -> u64) -> Vec<Vec<T>> {
    let mut buckets = Vec::new();
    let mut current = Vec::new();
    let mut current_size = 0u64;

    for item in items {
        let item_size = size(&item);
        if !current.is_empty() && current_size + item_size > cap {
            buckets.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += item_size;
        current.push(item);
    }

    if !current.is_empty() {
        buckets.push(current);
    }
    buckets
}

/// Archive entry names for a bucket; base-name clashes get the owner's id as prefix.
fn part_entries(bucket: &[SourceFile]) -> Vec<PartEntry> {
    let mut used = HashSet::new();
    bucket
        .iter()
        .map(|file| {
            let mut name = file.item.entry_name();
            if !used.insert(name.clone()) {
                name = format!("{}_{}", file.item.entity_id, name);
                let mut n = 2;
                while !used.insert(name.clone()) {
                    name = format!("{}_{}_{}", file.item.entity_id, n, file.item.entry_name());
                    n += 1;
                }
            }
            PartEntry {
                name,
                source: file.item.path.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use tempfile::TempDir;

    use super::*;
    use crate::models::{EntitySnapshot, StaleEntity};
    use crate::storage::LocalStore;

    const KIB: u64 = 1024;

    /// Counts calls and optionally fails on the n-th (1-based).
    struct FlakyWriter {
        calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl FlakyWriter {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PartWriter for FlakyWriter {
        fn write_part(&self, dest: &Path, entries: &[PartEntry]) -> Result<u64> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(call) {
                std::fs::write(dest, b"partial")?;
                return Err(AppError::Io(io::Error::other("disk full")));
            }
            ZipPartWriter.write_part(dest, entries)
        }
    }

    struct Fixture {
        tmp: TempDir,
        store: Arc<LocalStore>,
        writer: Arc<FlakyWriter>,
        manager: ArchiveManager,
    }

    async fn fixture(cap: u64, fail_on: Option<usize>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(tmp.path().join("db")).await.unwrap());
        let writer = Arc::new(FlakyWriter::new(fail_on));
        let config = ArchiveConfig {
            dir: tmp.path().join("archives"),
            max_part_bytes: cap,
        };
        let manager =
            ArchiveManager::new(store.clone(), &config).with_writer(writer.clone());
        Fixture {
            tmp,
            store,
            writer,
            manager,
        }
    }

    impl Fixture {
        /// Create a compressible file and record it as a source item.
        async fn add_file(&self, category: &str, name: &str, size: u64) -> PathBuf {
            self.add_file_at(category, name, size, Utc::now()).await
        }

        async fn add_file_at(
            &self,
            category: &str,
            name: &str,
            size: u64,
            at: DateTime<Utc>,
        ) -> PathBuf {
            let dir = self.tmp.path().join("course_works");
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            std::fs::write(&path, vec![b'a'; size as usize]).unwrap();
            self.store
                .record_source_items(&[ArchiveSourceItem {
                    path: path.clone(),
                    byte_size: size,
                    entity_id: format!("owner-{name}"),
                    category: category.to_string(),
                    semester: None,
                    contributed_at: at,
                }])
                .await
                .unwrap();
            path
        }

        fn archive_files(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(self.manager.archive_dir())
                .map(|rd| {
                    rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            names.sort();
            names
        }
    }

    fn zip_entries(path: &Path) -> Vec<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    #[test]
    fn test_pack_greedy_scenario() {
        let mb = 1024 * 1024;
        let buckets = pack_greedy(vec![20 * mb, 20 * mb, 10 * mb], 45 * mb, |s| *s);
        assert_eq!(buckets, vec![vec![20 * mb, 20 * mb], vec![10 * mb]]);
    }

    #[test]
    fn test_pack_greedy_exact_fit_and_order() {
        let buckets = pack_greedy(vec![5, 5, 10, 1, 9, 3], 10, |s| *s);
        assert_eq!(buckets, vec![vec![5, 5], vec![10], vec![1, 9], vec![3]]);
        for bucket in &buckets {
            assert!(bucket.iter().sum::<u64>() <= 10);
        }
    }

    #[test]
    fn test_pack_greedy_empty() {
        assert!(pack_greedy(Vec::<u64>::new(), 10, |s| *s).is_empty());
    }

    #[test]
    fn test_part_file_names() {
        assert_eq!(part_file_names("Algorithms", 1), vec!["Algorithms.zip"]);
        assert_eq!(
            part_file_names("Algorithms", 2),
            vec!["Algorithms.part1of2.zip", "Algorithms.part2of2.zip"]
        );
        assert_eq!(
            part_file_names(" Data Bases ", 1),
            vec!["Data_Bases.zip"]
        );
    }

    #[test]
    fn test_archive_base_name_strips_separators() {
        assert_eq!(archive_base_name("CAD/CAM systems"), "CAD_CAM_systems");
    }

    #[tokio::test]
    async fn test_scenario_two_parts() {
        let fx = fixture(45 * KIB, None).await;
        fx.add_file("Algorithms", "a.pdf", 20 * KIB).await;
        fx.add_file("Algorithms", "b.pdf", 20 * KIB).await;
        fx.add_file("Algorithms", "c.pdf", 10 * KIB).await;

        let outcome = fx.manager.get_or_create_archive("Algorithms", false).await;
        assert!(outcome.rebuilt, "{}", outcome.message);

        let parts = outcome.parts.unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with("Algorithms.part1of2.zip"));
        assert!(parts[1].ends_with("Algorithms.part2of2.zip"));
        assert_eq!(zip_entries(&parts[0]), vec!["a.pdf", "b.pdf"]);
        assert_eq!(zip_entries(&parts[1]), vec!["c.pdf"]);

        for part in &parts {
            assert!(std::fs::metadata(part).unwrap().len() <= 45 * KIB);
        }

        let descriptor = fx
            .store
            .read_archive_descriptor("Algorithms")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(descriptor.item_count, 3);
        assert_eq!(descriptor.total_bytes, 50 * KIB);
        assert_eq!(descriptor.parts[0].entry_count, 2);
        assert_eq!(descriptor.parts[0].sha256.len(), 64);
    }

    #[tokio::test]
    async fn test_single_archive_when_under_cap() {
        let fx = fixture(45 * KIB, None).await;
        fx.add_file("Algorithms", "a.pdf", 10 * KIB).await;
        fx.add_file("Algorithms", "b.pdf", 10 * KIB).await;

        let outcome = fx.manager.get_or_create_archive("Algorithms", false).await;
        let parts = outcome.parts.unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].ends_with("Algorithms.zip"));
        assert_eq!(outcome.message, "Archive created. Files: 2");
    }

    #[tokio::test]
    async fn test_second_request_is_idempotent() {
        let fx = fixture(45 * KIB, None).await;
        fx.add_file("Algorithms", "a.pdf", 10 * KIB).await;

        let first = fx.manager.get_or_create_archive("Algorithms", false).await;
        let writes = fx.writer.calls();
        let second = fx.manager.get_or_create_archive("Algorithms", false).await;

        assert!(first.rebuilt);
        assert!(!second.rebuilt);
        assert_eq!(first.parts, second.parts);
        assert_eq!(fx.writer.calls(), writes);
        assert_eq!(
            fx.manager.status("Algorithms").await.unwrap(),
            ArchiveState::Fresh
        );
    }

    #[tokio::test]
    async fn test_force_rebuilds_fresh_archive() {
        let fx = fixture(45 * KIB, None).await;
        fx.add_file("Algorithms", "a.pdf", 10 * KIB).await;

        fx.manager.get_or_create_archive("Algorithms", false).await;
        let forced = fx.manager.get_or_create_archive("Algorithms", true).await;
        assert!(forced.rebuilt);
        assert_eq!(fx.writer.calls(), 2);
    }

    #[tokio::test]
    async fn test_newer_source_item_makes_archive_stale() {
        let fx = fixture(45 * KIB, None).await;
        fx.add_file("Algorithms", "a.pdf", 10 * KIB).await;
        fx.manager.get_or_create_archive("Algorithms", false).await;

        fx.add_file_at("Algorithms", "b.pdf", 10 * KIB, Utc::now() + Duration::seconds(5))
            .await;
        assert_eq!(
            fx.manager.status("Algorithms").await.unwrap(),
            ArchiveState::Stale
        );

        let outcome = fx.manager.get_or_create_archive("Algorithms", false).await;
        assert!(outcome.rebuilt);
        assert_eq!(zip_entries(&outcome.parts.unwrap()[0]), vec!["a.pdf", "b.pdf"]);
    }

    #[tokio::test]
    async fn test_missing_part_triggers_rebuild() {
        let fx = fixture(45 * KIB, None).await;
        fx.add_file("Algorithms", "a.pdf", 10 * KIB).await;

        let first = fx.manager.get_or_create_archive("Algorithms", false).await;
        std::fs::remove_file(&first.parts.unwrap()[0]).unwrap();

        let second = fx.manager.get_or_create_archive("Algorithms", false).await;
        assert!(second.rebuilt);
        assert!(second.parts.unwrap()[0].is_file());
    }

    #[tokio::test]
    async fn test_nothing_to_archive() {
        let fx = fixture(45 * KIB, None).await;
        assert_eq!(
            fx.manager.status("Algorithms").await.unwrap(),
            ArchiveState::Absent
        );

        let outcome = fx.manager.get_or_create_archive("Algorithms", false).await;
        assert_eq!(outcome, ArchiveOutcome::failed("nothing to archive"));

        let path = fx.add_file("Algorithms", "a.pdf", 10 * KIB).await;
        std::fs::remove_file(path).unwrap();
        let outcome = fx.manager.get_or_create_archive("Algorithms", false).await;
        assert!(outcome.parts.is_none());
        assert!(!outcome.rebuilt);
        assert!(fx.store.read_archive_descriptor("Algorithms").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_items_are_dropped_individually() {
        let fx = fixture(45 * KIB, None).await;
        fx.add_file("Algorithms", "huge.pdf", 50 * KIB).await;
        fx.add_file("Algorithms", "small.pdf", 5 * KIB).await;

        let outcome = fx.manager.get_or_create_archive("Algorithms", false).await;
        let parts = outcome.parts.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(zip_entries(&parts[0]), vec!["small.pdf"]);
    }

    #[tokio::test]
    async fn test_all_items_oversized() {
        let fx = fixture(4 * KIB, None).await;
        fx.add_file("Algorithms", "huge.pdf", 5 * KIB).await;

        let outcome = fx.manager.get_or_create_archive("Algorithms", false).await;
        assert_eq!(
            outcome,
            ArchiveOutcome::failed("all files exceed the part size cap")
        );
    }

    #[tokio::test]
    async fn test_failed_part_cleans_up_and_keeps_descriptor() {
        let fx = fixture(25 * KIB, Some(3)).await;
        fx.add_file("Algorithms", "a.pdf", 20 * KIB).await;

        // Call 1 builds the prior single-part archive
        let prior = fx.manager.get_or_create_archive("Algorithms", false).await;
        assert!(prior.rebuilt);
        let before = fx
            .store
            .read_archive_descriptor("Algorithms")
            .await
            .unwrap();
        let files_before = fx.archive_files();

        fx.add_file("Algorithms", "b.pdf", 20 * KIB).await;
        fx.add_file("Algorithms", "c.pdf", 20 * KIB).await;

        // Calls 2..4 would write parts 1..3; part 2 (call 3) fails
        let outcome = fx.manager.get_or_create_archive("Algorithms", true).await;
        assert!(outcome.parts.is_none());
        assert!(!outcome.rebuilt);
        assert!(outcome.message.contains("part 2 of 3"), "{}", outcome.message);

        assert_eq!(fx.archive_files(), files_before);
        assert_eq!(
            fx.store.read_archive_descriptor("Algorithms").await.unwrap(),
            before
        );
        assert!(prior.parts.unwrap()[0].is_file());
    }

    /// Delegates to a local store; descriptor writes fail while `fail` is set.
    struct FlakyDescriptors {
        inner: Arc<LocalStore>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Persistence for FlakyDescriptors {
        async fn read_snapshot(&self, entity_id: &str) -> Result<Option<EntitySnapshot>> {
            self.inner.read_snapshot(entity_id).await
        }

        async fn upsert_snapshot(&self, snapshot: &EntitySnapshot) -> Result<()> {
            self.inner.upsert_snapshot(snapshot).await
        }

        async fn count_entities(&self) -> Result<usize> {
            self.inner.count_entities().await
        }

        async fn list_stale_entities(&self, threshold: DateTime<Utc>) -> Result<Vec<StaleEntity>> {
            self.inner.list_stale_entities(threshold).await
        }

        async fn list_source_items(&self, category: &str) -> Result<Vec<ArchiveSourceItem>> {
            self.inner.list_source_items(category).await
        }

        async fn record_source_items(
            &self,
            items: &[ArchiveSourceItem],
        ) -> Result<Vec<ArchiveSourceItem>> {
            self.inner.record_source_items(items).await
        }

        async fn read_archive_descriptor(
            &self,
            category: &str,
        ) -> Result<Option<ArchiveDescriptor>> {
            self.inner.read_archive_descriptor(category).await
        }

        async fn write_archive_descriptor(&self, descriptor: &ArchiveDescriptor) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Io(io::Error::other("disk full")));
            }
            self.inner.write_archive_descriptor(descriptor).await
        }
    }

    #[tokio::test]
    async fn test_failed_descriptor_write_restores_replaced_part() {
        let fx = fixture(45 * KIB, None).await;
        let store = Arc::new(FlakyDescriptors {
            inner: fx.store.clone(),
            fail: AtomicBool::new(false),
        });
        let manager = ArchiveManager::new(
            store.clone(),
            &ArchiveConfig {
                dir: fx.manager.archive_dir().to_path_buf(),
                max_part_bytes: 45 * KIB,
            },
        );

        fx.add_file("Algorithms", "a.pdf", 10 * KIB).await;
        let first = manager.get_or_create_archive("Algorithms", false).await;
        let part = first.parts.unwrap()[0].clone();
        let before = fx
            .store
            .read_archive_descriptor("Algorithms")
            .await
            .unwrap()
            .unwrap();

        // Same part name, new content; storing the descriptor fails
        fx.add_file("Algorithms", "b.pdf", 10 * KIB).await;
        store.fail.store(true, Ordering::SeqCst);
        let outcome = manager.get_or_create_archive("Algorithms", true).await;
        assert!(outcome.parts.is_none());

        assert_eq!(
            fx.store.read_archive_descriptor("Algorithms").await.unwrap(),
            Some(before.clone())
        );
        assert_eq!(sha256_file(&part).unwrap(), before.parts[0].sha256);
        assert_eq!(zip_entries(&part), vec!["a.pdf"]);
        assert_eq!(fx.archive_files(), vec!["Algorithms.zip"]);
    }

    #[tokio::test]
    async fn test_shrinking_to_single_part_removes_old_parts() {
        let fx = fixture(25 * KIB, None).await;
        let a = fx.add_file("Algorithms", "a.pdf", 20 * KIB).await;
        fx.add_file("Algorithms", "b.pdf", 20 * KIB).await;

        let first = fx.manager.get_or_create_archive("Algorithms", false).await;
        assert_eq!(first.parts.unwrap().len(), 2);

        std::fs::remove_file(a).unwrap();
        let second = fx.manager.get_or_create_archive("Algorithms", true).await;
        assert_eq!(second.parts.unwrap().len(), 1);
        assert_eq!(fx.archive_files(), vec!["Algorithms.zip"]);
    }

    #[tokio::test]
    async fn test_concurrent_requests_build_once() {
        let fx = fixture(45 * KIB, None).await;
        fx.add_file("Algorithms", "a.pdf", 10 * KIB).await;

        let (a, b) = tokio::join!(
            fx.manager.get_or_create_archive("Algorithms", false),
            fx.manager.get_or_create_archive("algorithms ", false),
        );

        assert_eq!(fx.writer.calls(), 1);
        assert!(a.rebuilt ^ b.rebuilt);
        assert_eq!(a.parts, b.parts);
    }

    #[test]
    fn test_colliding_entry_names_get_owner_prefix() {
        let item = |entity: &str, path: &str| SourceFile {
            item: ArchiveSourceItem {
                path: PathBuf::from(path),
                byte_size: 1,
                entity_id: entity.to_string(),
                category: "Algorithms".into(),
                semester: None,
                contributed_at: Utc::now(),
            },
            size: 1,
        };
        let entries = part_entries(&[item("1", "x/report.pdf"), item("2", "y/report.pdf")]);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["report.pdf", "2_report.pdf"]);
    }
}
