//! Tunables for the memory tier (C3), independently mutable at runtime.

use std::time::Duration;

/// Runtime-mutable tunables for [`crate::tier::MemoryTier`].
///
/// Each field maps directly to a §4.3 tunable; `Default` carries the
/// spec's defaults (unbounded count/cost/age, 5s auto-trim).
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    pub count_limit: usize,
    pub cost_limit: u64,
    pub age_limit: Duration,
    pub auto_trim_interval: Duration,
    pub remove_all_on_memory_warning: bool,
    pub remove_all_on_entered_background: bool,
    pub release_asynchronously: bool,
    pub release_on_main_thread: bool,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        MemoryTierConfig {
            count_limit: usize::MAX,
            cost_limit: u64::MAX,
            age_limit: Duration::MAX,
            auto_trim_interval: Duration::from_secs(5),
            remove_all_on_memory_warning: true,
            remove_all_on_entered_background: true,
            release_asynchronously: true,
            release_on_main_thread: false,
        }
    }
}
