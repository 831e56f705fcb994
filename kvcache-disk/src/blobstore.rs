//! # Blob store (C5)
//!
//! Flat directory of externally-placed entry files plus a sibling
//! `trash/` directory. Deletes never block on the filesystem: a file is
//! first renamed into `trash/`, then the trash directory is emptied by a
//! dedicated background worker, keeping unlink cost off the caller's
//! path exactly like the memory tier keeps value drops off its lock.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use kvcache_common::CacheError;

const DATA_DIR: &str = "data";
const TRASH_DIR: &str = "trash";

/// On-disk layout for externally-placed entry files: `<root>/data/<name>`
/// plus a `<root>/trash/` staging area for asynchronous deletes.
pub struct BlobStore {
    data_dir: PathBuf,
    trash_dir: PathBuf,
    trash_worker: TrashWorker,
}

impl BlobStore {
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        let data_dir = root.join(DATA_DIR);
        let trash_dir = root.join(TRASH_DIR);
        std::fs::create_dir_all(&data_dir).map_err(|e| CacheError::io(data_dir.clone(), e))?;
        std::fs::create_dir_all(&trash_dir).map_err(|e| CacheError::io(trash_dir.clone(), e))?;
        Ok(BlobStore {
            data_dir,
            trash_dir,
            trash_worker: TrashWorker::new(),
        })
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    pub fn write(&self, filename: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(filename);
        std::fs::write(&path, bytes).map_err(|e| CacheError::io(path, e))
    }

    pub fn read(&self, filename: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path_for(filename);
        std::fs::read(&path).map_err(|e| CacheError::io(path, e))
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path_for(filename).is_file()
    }

    pub fn file_size(&self, filename: &str) -> Option<u64> {
        std::fs::metadata(self.path_for(filename))
            .ok()
            .map(|meta| meta.len())
    }

    /// Moves `filename` into `trash/` so the caller's delete returns
    /// immediately; the trash worker unlinks it later. Falls back to a
    /// direct remove if the rename fails (e.g. cross-device trash dir).
    pub fn delete(&self, filename: &str) {
        let src = self.path_for(filename);
        if !src.is_file() {
            return;
        }
        let dest = self.trash_dir.join(filename);
        match std::fs::rename(&src, &dest) {
            Ok(()) => self.trash_worker.dispatch(dest),
            Err(_) => {
                let _ = std::fs::remove_file(&src);
            }
        }
    }

    /// Moves every file under `data/` into `trash/` in one pass, used by
    /// `remove_all`. Synchronous (renames are cheap); the actual unlinks
    /// still happen on the trash worker.
    pub fn move_all_to_trash(&self) {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let src = entry.path();
            if let Some(name) = src.file_name() {
                let dest = self.trash_dir.join(name);
                if std::fs::rename(&src, &dest).is_ok() {
                    self.trash_worker.dispatch(dest);
                }
            }
        }
    }

    /// Schedules an immediate sweep of anything already sitting in
    /// `trash/` (e.g. left behind by a prior process that crashed before
    /// the worker finished).
    pub fn empty_trash_in_background(&self) {
        self.trash_worker.sweep_existing(&self.trash_dir);
    }
}

/// Background unlinker: a single worker thread draining a channel of
/// paths to remove, so `delete`/`remove_all` never block on the
/// filesystem's unlink syscall.
struct TrashWorker {
    sender: mpsc::Sender<PathBuf>,
    _handle: JoinHandle<()>,
}

impl TrashWorker {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<PathBuf>();
        let handle = thread::Builder::new()
            .name("kvcache-disk-trash".to_string())
            .spawn(move || {
                for path in receiver {
                    if let Err(err) = std::fs::remove_file(&path) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            tracing::debug!(?path, %err, "failed to empty trash entry");
                        }
                    }
                }
            })
            .expect("failed to spawn kvcache-disk-trash thread");
        TrashWorker {
            sender,
            _handle: handle,
        }
    }

    fn dispatch(&self, path: PathBuf) {
        let _ = self.sender.send(path);
    }

    fn sweep_existing(&self, trash_dir: &Path) {
        let entries = match std::fs::read_dir(trash_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            self.dispatch(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        store.write("a.bin", b"hello").unwrap();
        assert_eq!(store.read("a.bin").unwrap(), b"hello");
        assert_eq!(store.file_size("a.bin"), Some(5));
    }

    #[test]
    fn delete_removes_from_data_dir_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        store.write("a.bin", b"hello").unwrap();
        store.delete("a.bin");
        assert!(!store.exists("a.bin"));
    }

    #[test]
    fn delete_missing_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        store.delete("missing.bin");
    }

    #[test]
    fn move_all_to_trash_clears_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        store.write("a.bin", b"1").unwrap();
        store.write("b.bin", b"2").unwrap();
        store.move_all_to_trash();
        assert!(!store.exists("a.bin"));
        assert!(!store.exists("b.bin"));
    }
}
