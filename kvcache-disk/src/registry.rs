//! # Global registry (C8)
//!
//! A process-wide map from canonical path to a weak handle on a live
//! disk tier. Enforces the single-writer-per-directory invariant the
//! manifest store requires: two callers opening the same path get back
//! the same instance rather than two competing SQLite connections.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use kvcache_common::CacheError;

use crate::config::DiskTierConfig;
use crate::tier::DiskTierInner;

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<DiskTierInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<DiskTierInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn canonical_key(path: &Path) -> PathBuf {
    std::fs::create_dir_all(path).ok();
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Returns the live disk tier for `path`, constructing one if none
/// exists or the previous instance has been dropped.
pub(crate) fn acquire(
    path: &Path,
    config: DiskTierConfig,
) -> Result<Arc<DiskTierInner>, CacheError> {
    let key = canonical_key(path);
    let mut table = registry().lock().expect("registry poisoned");

    if let Some(existing) = table.get(&key).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    let inner = Arc::new(DiskTierInner::open(path, key.clone(), config)?);
    table.insert(key, Arc::downgrade(&inner));
    crate::tier::spawn_trimmer(Arc::downgrade(&inner));
    Ok(inner)
}

pub(crate) fn deregister(key: &Path) {
    if let Some(mut table) = registry().try_lock().ok() {
        if let Some(weak) = table.get(key) {
            if weak.upgrade().is_none() {
                table.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::DiskTier;

    #[test]
    fn opening_same_path_twice_shares_instance() {
        let dir = tempfile::tempdir().unwrap();
        let a = DiskTier::open(dir.path(), DiskTierConfig::default()).unwrap();
        let b = DiskTier::open(dir.path(), DiskTierConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&a.inner(), &b.inner()));
    }
}
