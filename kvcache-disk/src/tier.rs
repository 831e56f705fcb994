//! # Disk tier (C6)
//!
//! Composes the manifest store (C4) and blob store (C5) under a single
//! lock, decides inline-vs-file placement, and runs the periodic
//! cost/count/age/free-disk trimmer. Mirrors `kvcache_memory::MemoryTier`
//! in shape: an `Arc<Inner>` handle, an atomics-backed config cell, a
//! background trimmer thread holding only a `Weak` reference, and both
//! blocking and completion-callback forms of every operation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use kvcache_common::{CacheError, DiskSpaceProbe, HostSignals, TierLock, UnknownDiskSpace};

use crate::blobstore::BlobStore;
use crate::config::{DiskTierConfig, PlacementMode};
use crate::manifest::{now_secs, ManifestStore};
use crate::registry;
use crate::worker::WorkerPool;

const TRIM_STEP_TIMEOUT: Duration = Duration::from_millis(5);
const TRIM_BATCH: u32 = 16;

type FileNameHook = dyn Fn(&str) -> Option<String> + Send + Sync;

struct ConfigCell {
    inline_threshold: AtomicU64,
    count_limit: AtomicU64,
    cost_limit: AtomicU64,
    age_limit_secs: AtomicU64,
    free_disk_space_limit: AtomicU64,
    auto_trim_interval_secs: AtomicU64,
    error_logs_enabled: AtomicBool,
}

impl ConfigCell {
    fn from(config: &DiskTierConfig) -> Self {
        ConfigCell {
            inline_threshold: AtomicU64::new(config.inline_threshold),
            count_limit: AtomicU64::new(config.count_limit),
            cost_limit: AtomicU64::new(config.cost_limit),
            age_limit_secs: AtomicU64::new(duration_to_secs(config.age_limit)),
            free_disk_space_limit: AtomicU64::new(config.free_disk_space_limit),
            auto_trim_interval_secs: AtomicU64::new(config.auto_trim_interval.as_secs()),
            error_logs_enabled: AtomicBool::new(config.error_logs_enabled),
        }
    }
}

fn duration_to_secs(d: Duration) -> u64 {
    if d == Duration::MAX {
        u64::MAX
    } else {
        d.as_secs()
    }
}

struct DiskState {
    /// `None` once `on_will_terminate` has closed the connection; every
    /// operation below treats that as "fail, as if the process had
    /// already exited" per §7's host-lifecycle error kind.
    manifest: Option<ManifestStore>,
    blobstore: BlobStore,
}

/// Shared internals behind the handle returned by `DiskTier::open`;
/// registered in the global registry (C8) keyed by canonical path.
pub struct DiskTierInner {
    state: TierLock<DiskState>,
    config: ConfigCell,
    placement_mode: PlacementMode,
    custom_file_name: Option<Box<FileNameHook>>,
    space_probe: Arc<dyn DiskSpaceProbe>,
    worker_pool: WorkerPool,
    root: PathBuf,
    registry_key: PathBuf,
    host_signals: parking_lot::RwLock<Option<Arc<dyn HostSignals>>>,
}

impl Drop for DiskTierInner {
    fn drop(&mut self) {
        registry::deregister(&self.registry_key);
    }
}

impl DiskTierInner {
    pub(crate) fn open(
        path: &Path,
        registry_key: PathBuf,
        config: DiskTierConfig,
    ) -> Result<Self, kvcache_common::CacheError> {
        std::fs::create_dir_all(path).map_err(|e| kvcache_common::CacheError::io(path, e))?;

        let manifest_path = path.join("manifest.sqlite");
        let manifest = match ManifestStore::open(&manifest_path, config.error_logs_enabled) {
            Ok(store) => store,
            Err(_) => {
                reset_manifest_files(path);
                ManifestStore::open(&manifest_path, config.error_logs_enabled)?
            }
        };
        let blobstore = BlobStore::open(path)?;

        Ok(DiskTierInner {
            state: TierLock::new(DiskState {
                manifest: Some(manifest),
                blobstore,
            }),
            config: ConfigCell::from(&config),
            placement_mode: config.placement_mode,
            custom_file_name: None,
            space_probe: Arc::new(UnknownDiskSpace),
            worker_pool: WorkerPool::new(),
            root: path.to_path_buf(),
            registry_key,
            host_signals: parking_lot::RwLock::new(None),
        })
    }
}

/// On open failure, attempt the full reset the error-handling design
/// calls for: close (implicit, the failed open never held a connection),
/// move the existing database files to trash, then let the caller retry
/// `ManifestStore::open` against a clean slate.
fn reset_manifest_files(root: &Path) {
    for name in ["manifest.sqlite", "manifest.sqlite-wal", "manifest.sqlite-shm"] {
        let path = root.join(name);
        if path.exists() {
            let trash = root.join("trash");
            let _ = std::fs::create_dir_all(&trash);
            let _ = std::fs::rename(&path, trash.join(name));
        }
    }
}

/// Handle to a disk tier. Cloning shares the same underlying instance;
/// opening the same path from elsewhere in the process returns a clone
/// of this same handle via the global registry (C8).
pub struct DiskTier {
    inner: Arc<DiskTierInner>,
}

impl Clone for DiskTier {
    fn clone(&self) -> Self {
        DiskTier {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl DiskTier {
    pub fn open(path: &Path, config: DiskTierConfig) -> Result<Self, kvcache_common::CacheError> {
        let inner = registry::acquire(path, config)?;
        Ok(DiskTier { inner })
    }

    pub(crate) fn inner(&self) -> Arc<DiskTierInner> {
        Arc::clone(&self.inner)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn set_custom_file_name(&mut self, hook: impl Fn(&str) -> Option<String> + Send + Sync + 'static) {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.custom_file_name = Some(Box::new(hook));
        }
    }

    pub fn set_disk_space_probe(&mut self, probe: Arc<dyn DiskSpaceProbe>) {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.space_probe = probe;
        }
    }

    pub fn set_count_limit(&self, limit: u64) {
        self.inner.config.count_limit.store(limit, Ordering::Relaxed);
    }

    pub fn set_cost_limit(&self, limit: u64) {
        self.inner.config.cost_limit.store(limit, Ordering::Relaxed);
    }

    pub fn set_age_limit(&self, age: Duration) {
        self.inner
            .config
            .age_limit_secs
            .store(duration_to_secs(age), Ordering::Relaxed);
    }

    pub fn set_free_disk_space_limit(&self, limit: u64) {
        self.inner
            .config
            .free_disk_space_limit
            .store(limit, Ordering::Relaxed);
    }

    pub fn set_auto_trim_interval(&self, interval: Duration) {
        self.inner
            .config
            .auto_trim_interval_secs
            .store(interval.as_secs(), Ordering::Relaxed);
    }

    /// Registers the user-provided hook invoked alongside this tier's own
    /// reaction to a host lifecycle signal.
    pub fn set_host_signals(&self, hook: Arc<dyn HostSignals>) {
        *self.inner.host_signals.write() = Some(hook);
    }

    fn filename_for(&self, key: &str) -> String {
        match &self.inner.custom_file_name {
            Some(hook) => hook(key).unwrap_or_else(|| default_filename(key)),
            None => default_filename(key),
        }
    }

    fn should_place_external(&self, len: usize) -> bool {
        match self.inner.placement_mode {
            PlacementMode::SqliteOnly => false,
            PlacementMode::FileOnly => true,
            PlacementMode::Mixed => {
                len as u64 > self.inner.config.inline_threshold.load(Ordering::Relaxed)
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let state = self.inner.state.lock();
        let Some(manifest) = state.manifest.as_ref() else { return false };
        manifest.get(key, true).is_some()
    }

    /// Reads the entry, self-healing against blob loss: if an external
    /// file is missing, the manifest row is deleted and this returns
    /// `None`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.inner.state.lock();
        let manifest = state.manifest.as_ref()?;
        let entry = manifest.get(key, false)?;

        let bytes = match entry.filename {
            Some(filename) => match state.blobstore.read(&filename) {
                Ok(bytes) => bytes,
                Err(_) => {
                    tracing::debug!(key, error = %CacheError::MissingBlob, "self-healing manifest row");
                    manifest.delete(key);
                    return None;
                }
            },
            None => entry.inline_data.unwrap_or_default(),
        };

        manifest.touch(key);
        Some(bytes)
    }

    /// `set(key, bytes)`: empty key or empty bytes fail silently. For
    /// external placement, the file is written before the manifest row so
    /// a row never outlives its blob.
    pub fn set(&self, key: &str, bytes: &[u8]) -> bool {
        if key.is_empty() || bytes.is_empty() {
            let reason = if key.is_empty() { "empty key" } else { "empty value" };
            tracing::debug!(
                error = %CacheError::InvalidInput { reason },
                "rejected set"
            );
            return false;
        }

        let external = self.should_place_external(bytes.len());
        let filename = if external { Some(self.filename_for(key)) } else { None };

        let state = self.inner.state.lock();
        let Some(manifest) = state.manifest.as_ref() else { return false };

        let previous_filename = manifest.get(key, true).and_then(|e| e.filename);

        if external {
            let name = filename.as_deref().expect("external placement always names a file");
            if state.blobstore.write(name, bytes).is_err() {
                return false;
            }
            if !manifest.save(key, None, Some(name), bytes.len() as u64, None) {
                state.blobstore.delete(name);
                return false;
            }
            if let Some(old) = previous_filename {
                if old != name {
                    state.blobstore.delete(&old);
                }
            }
        } else {
            if !manifest.save(key, Some(bytes), None, bytes.len() as u64, None) {
                return false;
            }
            if let Some(old) = previous_filename {
                state.blobstore.delete(&old);
            }
        }

        true
    }

    pub fn remove(&self, key: &str) -> bool {
        let state = self.inner.state.lock();
        let Some(manifest) = state.manifest.as_ref() else { return false };
        if let Some(filename) = manifest.get(key, true).and_then(|e| e.filename) {
            state.blobstore.delete(&filename);
        }
        manifest.delete(key)
    }

    pub fn remove_all(&self) {
        let state = self.inner.state.lock();
        let Some(manifest) = state.manifest.as_ref() else { return };
        state.blobstore.move_all_to_trash();
        manifest.delete_larger_than(0);
        manifest.checkpoint();
    }

    pub fn total_count(&self) -> u64 {
        let state = self.inner.state.lock();
        state.manifest.as_ref().map(|m| m.total_count()).unwrap_or(0)
    }

    pub fn total_size(&self) -> u64 {
        let state = self.inner.state.lock();
        state.manifest.as_ref().map(|m| m.total_size()).unwrap_or(0)
    }

    /// Deletes oldest-first rows (and their blobs) in batches until
    /// `total_size() <= target` or a batch yields nothing / a deletion
    /// fails.
    pub fn trim_to_cost(&self, target: u64) {
        self.trim_while(|state| {
            state.manifest.as_ref().map(|m| m.total_size() > target).unwrap_or(false)
        });
    }

    pub fn trim_to_count(&self, target: u64) {
        self.trim_while(|state| {
            state.manifest.as_ref().map(|m| m.total_count() > target).unwrap_or(false)
        });
    }

    pub fn trim_older_than(&self, age: Duration) {
        if age.is_zero() {
            self.remove_all();
            return;
        }
        let cutoff = now_secs() - age.as_secs() as i64;
        let state = self.inner.state.lock();
        let Some(manifest) = state.manifest.as_ref() else { return };
        let doomed = manifest.list_size_info_oldest_first(u32::MAX);
        for row in doomed {
            let entry = match manifest.get(&row.key, true) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.last_access_time < cutoff {
                if let Some(filename) = row.filename {
                    state.blobstore.delete(&filename);
                }
                manifest.delete(&row.key);
            }
        }
        manifest.checkpoint();
    }

    pub fn trim_to_free_disk(&self) {
        let limit = self.inner.config.free_disk_space_limit.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }
        let Some(free) = self.inner.space_probe.available_bytes(&self.inner.root) else {
            return;
        };
        if free >= limit {
            return;
        }
        let needed = limit - free;
        let total = self.total_size();
        let target = total.saturating_sub(needed);
        self.trim_to_cost(target);
    }

    /// Staircase trim loop: each iteration takes a short-lived lock,
    /// checks whether `over` still holds, and deletes one batch of
    /// oldest-first rows before releasing the lock so readers/writers can
    /// interleave between batches.
    fn trim_while(&self, over: impl Fn(&DiskState) -> bool) {
        loop {
            let Some(state) = self.inner.state.try_lock_for(TRIM_STEP_TIMEOUT) else {
                continue;
            };
            let Some(manifest) = state.manifest.as_ref() else { return };
            if !over(&state) {
                manifest.checkpoint();
                return;
            }
            let batch = manifest.list_size_info_oldest_first(TRIM_BATCH);
            if batch.is_empty() {
                manifest.checkpoint();
                return;
            }
            for row in batch {
                if let Some(filename) = row.filename {
                    state.blobstore.delete(&filename);
                }
                if !manifest.delete(&row.key) {
                    manifest.checkpoint();
                    return;
                }
            }
        }
    }

    /// Closes the manifest store in response to a process-termination
    /// signal. The connection is dropped for real: every operation above
    /// checks `state.manifest` and fails (`false`/`None`/`0`) once it is
    /// `None`, so calls made after this return behave as if the process
    /// had already exited, per §7's host-lifecycle error kind.
    pub fn on_will_terminate(&self) {
        let mut state = self.inner.state.lock();
        if let Some(manifest) = state.manifest.take() {
            manifest.close();
        }
        drop(state);
        if let Some(hook) = self.inner.host_signals.read().clone() {
            hook.will_terminate();
        }
    }

    // -- completion-callback forms --------------------------------------

    pub fn get_with_completion(&self, key: &str, callback: impl FnOnce(Option<Vec<u8>>) + Send + 'static) {
        let tier = self.clone();
        let key = key.to_string();
        self.inner.worker_pool.execute(Box::new(move || {
            let result = tier.get(&key);
            callback(result);
        }));
    }

    pub fn set_with_completion(&self, key: &str, bytes: Vec<u8>, callback: impl FnOnce(bool) + Send + 'static) {
        let tier = self.clone();
        let key = key.to_string();
        self.inner.worker_pool.execute(Box::new(move || {
            let result = tier.set(&key, &bytes);
            callback(result);
        }));
    }

    pub fn remove_with_completion(&self, key: &str, callback: impl FnOnce(bool) + Send + 'static) {
        let tier = self.clone();
        let key = key.to_string();
        self.inner.worker_pool.execute(Box::new(move || {
            let result = tier.remove(&key);
            callback(result);
        }));
    }

    // -- suspendable forms: a oneshot wrapped around the completion form --

    pub async fn get_async(&self, key: &str) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.get_with_completion(key, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(None)
    }

    pub async fn set_async(&self, key: &str, bytes: Vec<u8>) -> bool {
        let (tx, rx) = oneshot::channel();
        self.set_with_completion(key, bytes, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(false)
    }

    pub async fn remove_async(&self, key: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        self.remove_with_completion(key, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(false)
    }
}

fn default_filename(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Self-rescheduling background trimmer. Holds only a `Weak` reference so
/// a dropped disk tier simply lets this loop exit on its next wakeup
/// rather than requiring an explicit cancellation handle.
pub(crate) fn spawn_trimmer(weak: Weak<DiskTierInner>) {
    std::thread::Builder::new()
        .name("kvcache-disk-trimmer".to_string())
        .spawn(move || loop {
            let Some(inner) = weak.upgrade() else { return };
            let interval_secs = inner.config.auto_trim_interval_secs.load(Ordering::Relaxed);
            drop(inner);

            std::thread::sleep(Duration::from_secs(interval_secs.max(1)));

            let Some(inner) = weak.upgrade() else { return };
            let tier = DiskTier { inner: Arc::clone(&inner) };

            let cost_limit = inner.config.cost_limit.load(Ordering::Relaxed);
            let count_limit = inner.config.count_limit.load(Ordering::Relaxed);
            let age_limit_secs = inner.config.age_limit_secs.load(Ordering::Relaxed);
            drop(inner);

            tier.trim_to_cost(cost_limit);
            tier.trim_to_count(count_limit);
            if age_limit_secs != u64::MAX {
                tier.trim_older_than(Duration::from_secs(age_limit_secs));
            }
            tier.trim_to_free_disk();
        })
        .expect("failed to spawn kvcache-disk-trimmer thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (tempfile::TempDir, DiskTier) {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), DiskTierConfig::default()).unwrap();
        (dir, tier)
    }

    #[test]
    fn set_then_get_roundtrips_inline() {
        let (_dir, tier) = open();
        assert!(tier.set("k", b"hello"));
        assert_eq!(tier.get("k"), Some(b"hello".to_vec()));
    }

    #[test]
    fn external_placement_uses_sha256_filename() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DiskTierConfig::default();
        config.inline_threshold = 1024;
        let tier = DiskTier::open(dir.path(), config).unwrap();

        let bytes = vec![0xABu8; 4096];
        assert!(tier.set("big", &bytes));

        let expected_name = default_filename("big");
        assert!(dir.path().join("data").join(&expected_name).is_file());
        assert_eq!(tier.get("big"), Some(bytes));
    }

    #[test]
    fn remove_clears_manifest_and_blob() {
        let (_dir, tier) = open();
        tier.set("k", b"v");
        assert!(tier.remove("k"));
        assert!(tier.get("k").is_none());
    }

    #[test]
    fn missing_blob_self_heals_to_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DiskTierConfig::default();
        config.inline_threshold = 0;
        let tier = DiskTier::open(dir.path(), config).unwrap();

        tier.set("big", b"some bytes");
        let filename = default_filename("big");
        std::fs::remove_file(dir.path().join("data").join(&filename)).unwrap();

        assert!(tier.get("big").is_none());
        assert_eq!(tier.total_count(), 0);
    }

    #[test]
    fn will_terminate_closes_manifest_and_fails_subsequent_ops() {
        let (_dir, tier) = open();
        tier.set("k", b"v");
        tier.on_will_terminate();
        assert!(!tier.set("k2", b"v2"));
        assert_eq!(tier.get("k"), None);
        assert_eq!(tier.total_count(), 0);
    }

    #[test]
    fn will_terminate_invokes_host_signals_hook() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use kvcache_common::HostSignals;

        struct Flag(Arc<AtomicBool>);
        impl HostSignals for Flag {
            fn will_terminate(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let (_dir, tier) = open();
        let called = Arc::new(AtomicBool::new(false));
        tier.set_host_signals(Arc::new(Flag(called.clone())));
        tier.on_will_terminate();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn trim_to_count_evicts_oldest_first() {
        let (_dir, tier) = open();
        for key in ["a", "b", "c", "d"] {
            tier.set(key, b"v");
            std::thread::sleep(Duration::from_millis(1100));
        }
        tier.trim_to_count(2);
        assert_eq!(tier.total_count(), 2);
        assert!(tier.get("a").is_none());
        assert!(tier.get("d").is_some());
    }
}
