//! Disk tier configuration (mirrors `kvcache_memory::MemoryTierConfig` in
//! shape: one struct of tunables plus a `Default` matching the spec's
//! defaults).

use std::time::Duration;

/// How `DiskTier::set` decides between an inline SQLite blob and an
/// externally-placed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementMode {
    /// Always inline, regardless of size.
    SqliteOnly,
    /// Always external; requires a resolvable filename.
    FileOnly,
    /// Inline when `bytes.len() <= inline_threshold`, external otherwise.
    Mixed,
}

#[derive(Debug, Clone)]
pub struct DiskTierConfig {
    pub inline_threshold: u64,
    pub count_limit: u64,
    pub cost_limit: u64,
    pub age_limit: Duration,
    pub free_disk_space_limit: u64,
    pub auto_trim_interval: Duration,
    pub placement_mode: PlacementMode,
    pub error_logs_enabled: bool,
}

impl Default for DiskTierConfig {
    fn default() -> Self {
        DiskTierConfig {
            inline_threshold: 20 * 1024,
            count_limit: u64::MAX,
            cost_limit: u64::MAX,
            age_limit: Duration::MAX,
            free_disk_space_limit: 0,
            auto_trim_interval: Duration::from_secs(60),
            placement_mode: PlacementMode::Mixed,
            error_logs_enabled: true,
        }
    }
}
