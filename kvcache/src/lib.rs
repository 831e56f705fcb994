//! # kvcache
//!
//! The facade (C7): a two-tier key-value cache pairing a bounded
//! in-memory LRU (`kvcache_memory`) with a SQLite + flat-file disk tier
//! (`kvcache_disk`). Values are `Bytes` so promotion from disk into
//! memory is a cheap refcount bump rather than a copy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use kvcache_common::{CacheError, HostSignals};
use kvcache_disk::{DiskTier, DiskTierConfig};
use kvcache_memory::{MemoryTier, MemoryTierConfig};

/// Two-tier cache bound to a name and a root directory.
///
/// Read path: memory first; on miss, disk; on disk hit, the value is
/// promoted into memory before returning. Write and remove paths go
/// through memory first, then disk.
#[derive(Clone)]
pub struct Cache {
    name: String,
    memory: MemoryTier<String, Bytes>,
    disk: DiskTier,
}

impl Cache {
    /// Opens (or attaches to) the cache named `name` under the
    /// platform's per-user caches directory.
    pub fn open(name: &str) -> Result<Self, CacheError> {
        Self::open_at(&default_root(name), name)
    }

    /// Opens (or attaches to) the cache rooted at `path`, with `name`
    /// being the last path component by convention.
    pub fn open_path(path: &Path) -> Result<Self, CacheError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::open_at(path, &name)
    }

    fn open_at(path: &Path, name: &str) -> Result<Self, CacheError> {
        let disk = DiskTier::open(path, DiskTierConfig::default())?;
        let memory = MemoryTier::new(MemoryTierConfig::default());
        tracing::debug!(name, root = %path.display(), "cache opened");
        Ok(Cache {
            name: name.to_string(),
            memory,
            disk,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct handle to the memory tier, for tests and callers that want
    /// to bypass the facade's promotion logic.
    pub fn memory(&self) -> &MemoryTier<String, Bytes> {
        &self.memory
    }

    /// Direct handle to the disk tier.
    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    pub fn contains(&self, key: &str) -> bool {
        self.memory.contains(&key.to_string()) || self.disk.contains(key)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.memory.get(&key.to_string()) {
            return Some(value);
        }
        let bytes = self.disk.get(key)?;
        let value = Bytes::from(bytes);
        self.memory.update(key.to_string(), Some(value.clone()), value.len() as u64);
        Some(value)
    }

    pub fn set(&self, key: &str, value: impl Into<Bytes>) -> bool {
        let value = value.into();
        self.memory
            .update(key.to_string(), Some(value.clone()), value.len() as u64);
        self.disk.set(key, &value)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.memory.remove(&key.to_string());
        self.disk.remove(key)
    }

    pub fn remove_all(&self) {
        self.memory.remove_all();
        self.disk.remove_all();
    }

    /// Registers the hook both tiers invoke on their respective host
    /// lifecycle signal, alongside each tier's own built-in reaction.
    pub fn set_host_signals(&self, hook: Arc<dyn HostSignals>) {
        self.memory.set_host_signals(hook.clone());
        self.disk.set_host_signals(hook);
    }

    /// Forward the host's memory-warning notification to the memory tier.
    pub fn on_memory_warning(&self) {
        self.memory.on_memory_warning();
    }

    /// Forward the host's background-entry notification to the memory tier.
    pub fn on_entered_background(&self) {
        self.memory.on_entered_background();
    }

    /// Forward the host's termination notification to the disk tier, which
    /// closes its manifest store; subsequent disk operations fail until a
    /// fresh `Cache` is opened.
    pub fn on_will_terminate(&self) {
        self.disk.on_will_terminate();
    }

    // -- completion-callback forms ---------------------------------------

    /// Checks memory synchronously first so a concurrently-written fresher
    /// value is never clobbered by a stale disk read's promotion.
    pub fn get_with_completion(&self, key: &str, callback: impl FnOnce(Option<Bytes>) + Send + 'static) {
        if let Some(value) = self.memory.get(&key.to_string()) {
            callback(Some(value));
            return;
        }
        let memory = self.memory.clone();
        let key_owned = key.to_string();
        self.disk.get_with_completion(key, move |bytes| {
            let Some(bytes) = bytes else {
                callback(None);
                return;
            };
            let value = Bytes::from(bytes);
            if !memory.contains(&key_owned) {
                memory.update(key_owned, Some(value.clone()), value.len() as u64);
            }
            callback(Some(value));
        });
    }

    pub fn set_with_completion(&self, key: &str, value: impl Into<Bytes>, callback: impl FnOnce(bool) + Send + 'static) {
        let value = value.into();
        self.memory
            .update(key.to_string(), Some(value.clone()), value.len() as u64);
        self.disk.set_with_completion(key, value.to_vec(), callback);
    }

    pub fn remove_with_completion(&self, key: &str, callback: impl FnOnce(bool) + Send + 'static) {
        self.memory.remove(&key.to_string());
        self.disk.remove_with_completion(key, callback);
    }

    // -- suspendable forms -------------------------------------------------

    pub async fn get_async(&self, key: &str) -> Option<Bytes> {
        if let Some(value) = self.memory.get(&key.to_string()) {
            return Some(value);
        }
        let bytes = self.disk.get_async(key).await?;
        let value = Bytes::from(bytes);
        if !self.memory.contains(&key.to_string()) {
            self.memory
                .update(key.to_string(), Some(value.clone()), value.len() as u64);
        }
        Some(value)
    }

    pub async fn set_async(&self, key: &str, value: impl Into<Bytes>) -> bool {
        let value = value.into();
        self.memory
            .update(key.to_string(), Some(value.clone()), value.len() as u64);
        self.disk.set_async(key, value.to_vec()).await
    }

    pub async fn remove_async(&self, key: &str) -> bool {
        self.memory.remove(&key.to_string());
        self.disk.remove_async(key).await
    }
}

fn default_root(name: &str) -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_visible_through_both_tiers_and_the_facade() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_path(&dir.path().join("T1")).unwrap();
        cache.set("a", Bytes::from_static(b"hello"));

        assert_eq!(cache.memory().get(&"a".to_string()), Some(Bytes::from_static(b"hello")));
        assert_eq!(cache.disk().get("a"), Some(b"hello".to_vec()));
        assert_eq!(cache.get("a"), Some(Bytes::from_static(b"hello")));
    }

    #[test]
    fn set_then_remove_then_get_is_absent_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_path(&dir.path().join("T")).unwrap();
        cache.set("k", Bytes::from_static(b"v"));
        cache.remove("k");
        assert!(cache.get("k").is_none());
        assert!(!cache.memory().contains(&"k".to_string()));
        assert!(!cache.disk().contains("k"));
    }

    #[test]
    fn will_terminate_closes_disk_tier_but_leaves_memory_readable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open_path(&dir.path().join("T3")).unwrap();
        cache.set("k", Bytes::from_static(b"v"));
        cache.on_will_terminate();

        assert_eq!(cache.memory().get(&"k".to_string()), Some(Bytes::from_static(b"v")));
        assert!(!cache.disk().contains("k"));
        assert!(!cache.disk().set("k2", b"v2"));
    }

    #[test]
    fn disk_only_read_promotes_into_memory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("T2");
        let payload = vec![7u8; 10 * 1024];
        {
            let cache = Cache::open_path(&root).unwrap();
            cache.set("k", Bytes::from(payload.clone()));
        }
        // Simulate process restart: fresh facade over the same root.
        let cache2 = Cache::open_path(&root).unwrap();
        assert!(!cache2.memory().contains(&"k".to_string()));
        assert_eq!(cache2.get("k"), Some(Bytes::from(payload)));
        assert!(cache2.memory().contains(&"k".to_string()));
    }
}
