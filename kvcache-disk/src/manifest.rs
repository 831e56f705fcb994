//! # Manifest store (C4)
//!
//! A single SQLite database holding one `manifest` table: entry metadata
//! (key, optional external filename, size, inline bytes, modification
//! time, last-access time, extended bytes) plus an index on
//! `last_access_time` for oldest-first eviction scans.
//!
//! Not thread-safe on its own — the disk tier (C6) serializes all access
//! to one manifest store behind its own lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::{params_from_iter, Connection, OptionalExtension};

use kvcache_common::CacheError;

const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const MAX_RETRY_COUNT: u32 = 8;

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS manifest (
    key TEXT PRIMARY KEY,
    filename TEXT,
    size INTEGER,
    inline_data BLOB,
    modification_time INTEGER,
    last_access_time INTEGER,
    extended_data BLOB)";
const CREATE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS last_access_time_idx ON manifest(last_access_time)";

/// A manifest row, fully materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
    pub inline_data: Option<Vec<u8>>,
    pub modification_time: i64,
    pub last_access_time: i64,
    pub extended_data: Option<Vec<u8>>,
}

/// An eviction candidate row as returned by oldest-first listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeInfo {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Process-wide open-failure rate limiter, keyed by canonical path.
///
/// A store that fails to open refuses further attempts until either
/// `MIN_RETRY_INTERVAL` has elapsed or the failure counter is still below
/// `MAX_RETRY_COUNT`; a successful open clears both.
struct RetryState {
    last_failure: Option<Instant>,
    failures: u32,
}

fn retry_table() -> &'static Mutex<HashMap<PathBuf, RetryState>> {
    static TABLE: OnceLock<Mutex<HashMap<PathBuf, RetryState>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn retry_allowed(path: &Path) -> bool {
    let table = retry_table().lock().expect("retry table poisoned");
    match table.get(path) {
        None => true,
        Some(state) => {
            state.failures < MAX_RETRY_COUNT
                || state
                    .last_failure
                    .map(|t| t.elapsed() >= MIN_RETRY_INTERVAL)
                    .unwrap_or(true)
        }
    }
}

fn record_open_failure(path: &Path) {
    let mut table = retry_table().lock().expect("retry table poisoned");
    let entry = table.entry(path.to_path_buf()).or_insert(RetryState {
        last_failure: None,
        failures: 0,
    });
    entry.failures += 1;
    entry.last_failure = Some(Instant::now());
}

fn record_open_success(path: &Path) {
    let mut table = retry_table().lock().expect("retry table poisoned");
    table.remove(path);
}

/// SQLite-backed manifest of disk-tier entries.
pub struct ManifestStore {
    conn: Connection,
    error_logs_enabled: bool,
}

impl ManifestStore {
    /// Opens (creating if absent) the manifest database at `path`.
    ///
    /// Returns `Err` immediately without touching the filesystem if a
    /// prior failure for this exact path is still within the rate-limit
    /// window.
    pub fn open(path: &Path, error_logs_enabled: bool) -> Result<Self, CacheError> {
        if !retry_allowed(path) {
            return Err(CacheError::DatabaseOpen {
                path: path.to_path_buf(),
                reason: "rate-limited after repeated open failures".to_string(),
            });
        }

        match Self::open_once(path, error_logs_enabled) {
            Ok(store) => {
                record_open_success(path);
                Ok(store)
            }
            Err(err) => {
                record_open_failure(path);
                Err(err)
            }
        }
    }

    fn open_once(path: &Path, error_logs_enabled: bool) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.execute(CREATE_TABLE_SQL, [])?;
        conn.execute(CREATE_INDEX_SQL, [])?;
        Ok(ManifestStore {
            conn,
            error_logs_enabled,
        })
    }

    fn log_failure(&self, op: &str, err: &rusqlite::Error) {
        if self.error_logs_enabled {
            tracing::debug!(operation = op, error = %err, "manifest operation failed");
        }
    }

    /// INSERT OR REPLACE. Sets both `modification_time` and
    /// `last_access_time` to now; `inline_data` is null whenever
    /// `filename` is set (placement is mutually exclusive).
    pub fn save(
        &self,
        key: &str,
        inline_data: Option<&[u8]>,
        filename: Option<&str>,
        size: u64,
        extended_data: Option<&[u8]>,
    ) -> bool {
        let now = now_secs();
        let result = self
            .conn
            .prepare_cached(
                "INSERT OR REPLACE INTO manifest
                    (key, filename, size, inline_data, modification_time, last_access_time, extended_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6)",
            )
            .and_then(|mut stmt| {
                stmt.execute(rusqlite::params![
                    key,
                    filename,
                    size as i64,
                    inline_data,
                    now,
                    extended_data,
                ])
            });
        match result {
            Ok(_) => true,
            Err(err) => {
                self.log_failure("save", &err);
                false
            }
        }
    }

    pub fn touch(&self, key: &str) -> bool {
        let result = self
            .conn
            .prepare_cached("UPDATE manifest SET last_access_time = ?1 WHERE key = ?2")
            .and_then(|mut stmt| stmt.execute(rusqlite::params![now_secs(), key]));
        match result {
            Ok(_) => true,
            Err(err) => {
                self.log_failure("touch", &err);
                false
            }
        }
    }

    pub fn touch_many(&self, keys: &[String]) -> bool {
        if keys.is_empty() {
            return true;
        }
        let sql = format!(
            "UPDATE manifest SET last_access_time = ? WHERE key IN ({})",
            placeholders(keys.len())
        );
        let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(keys.len() + 1);
        let now = now_secs();
        params.push(&now);
        for key in keys {
            params.push(key);
        }
        match self.conn.execute(&sql, params.as_slice()) {
            Ok(_) => true,
            Err(err) => {
                self.log_failure("touch_many", &err);
                false
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        let result = self
            .conn
            .prepare_cached("DELETE FROM manifest WHERE key = ?1")
            .and_then(|mut stmt| stmt.execute([key]));
        match result {
            Ok(_) => true,
            Err(err) => {
                self.log_failure("delete", &err);
                false
            }
        }
    }

    pub fn delete_many(&self, keys: &[String]) -> bool {
        if keys.is_empty() {
            return true;
        }
        let sql = format!(
            "DELETE FROM manifest WHERE key IN ({})",
            placeholders(keys.len())
        );
        match self
            .conn
            .execute(&sql, params_from_iter(keys.iter()))
        {
            Ok(_) => true,
            Err(err) => {
                self.log_failure("delete_many", &err);
                false
            }
        }
    }

    pub fn delete_larger_than(&self, size: u64) -> bool {
        let result = self
            .conn
            .prepare_cached("DELETE FROM manifest WHERE size > ?1")
            .and_then(|mut stmt| stmt.execute([size as i64]));
        match result {
            Ok(_) => true,
            Err(err) => {
                self.log_failure("delete_larger_than", &err);
                false
            }
        }
    }

    pub fn delete_older_than(&self, cutoff_secs: i64) -> bool {
        let result = self
            .conn
            .prepare_cached("DELETE FROM manifest WHERE last_access_time < ?1")
            .and_then(|mut stmt| stmt.execute([cutoff_secs]));
        match result {
            Ok(_) => true,
            Err(err) => {
                self.log_failure("delete_older_than", &err);
                false
            }
        }
    }

    pub fn get(&self, key: &str, exclude_inline: bool) -> Option<ManifestEntry> {
        let sql = if exclude_inline {
            "SELECT key, filename, size, NULL, modification_time, last_access_time, extended_data
             FROM manifest WHERE key = ?1"
        } else {
            "SELECT key, filename, size, inline_data, modification_time, last_access_time, extended_data
             FROM manifest WHERE key = ?1"
        };
        let result = self
            .conn
            .prepare_cached(sql)
            .and_then(|mut stmt| stmt.query_row([key], row_to_entry).optional());
        match result {
            Ok(entry) => entry,
            Err(err) => {
                self.log_failure("get", &err);
                None
            }
        }
    }

    pub fn get_many(&self, keys: &[String], exclude_inline: bool) -> Vec<ManifestEntry> {
        if keys.is_empty() {
            return Vec::new();
        }
        let inline_column = if exclude_inline { "NULL" } else { "inline_data" };
        let sql = format!(
            "SELECT key, filename, size, {inline_column}, modification_time, last_access_time, extended_data
             FROM manifest WHERE key IN ({})",
            placeholders(keys.len())
        );
        let mut stmt = match self.conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(err) => {
                self.log_failure("get_many", &err);
                return Vec::new();
            }
        };
        let rows = stmt.query_map(params_from_iter(keys.iter()), row_to_entry);
        match rows {
            Ok(rows) => rows.filter_map(Result::ok).collect(),
            Err(err) => {
                self.log_failure("get_many", &err);
                Vec::new()
            }
        }
    }

    pub fn get_value(&self, key: &str) -> Option<Vec<u8>> {
        self.conn
            .prepare_cached("SELECT inline_data FROM manifest WHERE key = ?1")
            .and_then(|mut stmt| {
                stmt.query_row([key], |row| row.get::<_, Option<Vec<u8>>>(0))
                    .optional()
            })
            .ok()
            .flatten()
            .flatten()
    }

    pub fn get_filename(&self, key: &str) -> Option<String> {
        self.conn
            .prepare_cached("SELECT filename FROM manifest WHERE key = ?1")
            .and_then(|mut stmt| {
                stmt.query_row([key], |row| row.get::<_, Option<String>>(0))
                    .optional()
            })
            .ok()
            .flatten()
            .flatten()
    }

    pub fn get_filenames(&self, keys: &[String]) -> Vec<(String, String)> {
        if keys.is_empty() {
            return Vec::new();
        }
        let sql = format!(
            "SELECT key, filename FROM manifest WHERE key IN ({}) AND filename IS NOT NULL",
            placeholders(keys.len())
        );
        let mut stmt = match self.conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };
        let rows = stmt.query_map(params_from_iter(keys.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        });
        match rows {
            Ok(rows) => rows.filter_map(Result::ok).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Oldest-first eviction candidates, used directly by the disk tier's
    /// cost/count trim loops.
    pub fn list_size_info_oldest_first(&self, limit: u32) -> Vec<SizeInfo> {
        let mut stmt = match self.conn.prepare_cached(
            "SELECT key, filename, size FROM manifest ORDER BY last_access_time ASC LIMIT ?1",
        ) {
            Ok(stmt) => stmt,
            Err(err) => {
                self.log_failure("list_size_info_oldest_first", &err);
                return Vec::new();
            }
        };
        let rows = stmt.query_map([limit], |row| {
            Ok(SizeInfo {
                key: row.get(0)?,
                filename: row.get(1)?,
                size: row.get::<_, i64>(2)? as u64,
            })
        });
        match rows {
            Ok(rows) => rows.filter_map(Result::ok).collect(),
            Err(err) => {
                self.log_failure("list_size_info_oldest_first", &err);
                Vec::new()
            }
        }
    }

    pub fn total_count(&self) -> u64 {
        self.conn
            .prepare_cached("SELECT COUNT(*) FROM manifest")
            .and_then(|mut stmt| stmt.query_row([], |row| row.get::<_, i64>(0)))
            .unwrap_or(0) as u64
    }

    pub fn total_size(&self) -> u64 {
        self.conn
            .prepare_cached("SELECT COALESCE(SUM(size), 0) FROM manifest")
            .and_then(|mut stmt| stmt.query_row([], |row| row.get::<_, i64>(0)))
            .unwrap_or(0) as u64
    }

    pub fn checkpoint(&self) -> bool {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")
            .is_ok()
    }

    pub fn close(self) {
        let _ = self.conn.close();
    }
}

fn placeholders(count: usize) -> String {
    std::iter::repeat("?").take(count).collect::<Vec<_>>().join(",")
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManifestEntry> {
    Ok(ManifestEntry {
        key: row.get(0)?,
        filename: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        inline_data: row.get(3)?,
        modification_time: row.get(4)?,
        last_access_time: row.get(5)?,
        extended_data: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ManifestStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.sqlite");
        let store = ManifestStore::open(&path, true).unwrap();
        (dir, store)
    }

    #[test]
    fn save_and_get_inline() {
        let (_dir, store) = store();
        assert!(store.save("k", Some(b"value"), None, 5, None));
        let entry = store.get("k", false).unwrap();
        assert_eq!(entry.inline_data.as_deref(), Some(&b"value"[..]));
        assert!(entry.filename.is_none());
    }

    #[test]
    fn save_external_clears_inline_column() {
        let (_dir, store) = store();
        assert!(store.save("k", None, Some("abc.bin"), 10, None));
        let entry = store.get("k", false).unwrap();
        assert!(entry.inline_data.is_none());
        assert_eq!(entry.filename.as_deref(), Some("abc.bin"));
    }

    #[test]
    fn delete_removes_row() {
        let (_dir, store) = store();
        store.save("k", Some(b"v"), None, 1, None);
        assert!(store.delete("k"));
        assert!(store.get("k", false).is_none());
    }

    #[test]
    fn touch_updates_last_access_only() {
        let (_dir, store) = store();
        store.save("k", Some(b"v"), None, 1, None);
        let before = store.get("k", true).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        store.touch("k");
        let after = store.get("k", true).unwrap();
        assert_eq!(before.modification_time, after.modification_time);
        assert!(after.last_access_time >= before.last_access_time);
    }

    #[test]
    fn list_oldest_first_orders_by_access() {
        let (_dir, store) = store();
        store.save("a", Some(b"1"), None, 1, None);
        std::thread::sleep(Duration::from_millis(1100));
        store.save("b", Some(b"2"), None, 1, None);
        let rows = store.list_size_info_oldest_first(10);
        assert_eq!(rows[0].key, "a");
        assert_eq!(rows[1].key, "b");
    }

    #[test]
    fn totals_reflect_rows() {
        let (_dir, store) = store();
        store.save("a", Some(b"12345"), None, 5, None);
        store.save("b", Some(b"12"), None, 2, None);
        assert_eq!(store.total_count(), 2);
        assert_eq!(store.total_size(), 7);
    }

    #[test]
    fn delete_many_removes_all_listed() {
        let (_dir, store) = store();
        store.save("a", Some(b"1"), None, 1, None);
        store.save("b", Some(b"2"), None, 1, None);
        store.save("c", Some(b"3"), None, 1, None);
        assert!(store.delete_many(&["a".to_string(), "b".to_string()]));
        assert_eq!(store.total_count(), 1);
    }
}
