//! # Memory tier (C3)
//!
//! Wraps the intrusive LRU map with cost/count/age accounting, the public
//! operations the facade calls directly, and a periodic background
//! trimmer that reacts to host memory-pressure / background-entry
//! signals. Every public operation is serialized by this tier's own lock.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use kvcache_common::{HostSignals, TierLock};

use crate::config::MemoryTierConfig;
use crate::lru::{LruMap, Node};
use crate::release::{pick_target, ReleaseTarget, ReleaseWorker};

/// How long a single try-lock step inside a trim loop will wait before
/// yielding to a contending reader/writer.
const TRIM_STEP_TIMEOUT: Duration = Duration::from_millis(5);

type MainThreadDispatcher = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

struct ConfigCell {
    count_limit: AtomicUsize,
    cost_limit: AtomicU64,
    age_limit_secs: AtomicU64,
    auto_trim_interval_ms: AtomicU64,
    remove_all_on_memory_warning: AtomicBool,
    remove_all_on_entered_background: AtomicBool,
    release_asynchronously: AtomicBool,
    release_on_main_thread: AtomicBool,
}

impl ConfigCell {
    fn from(config: &MemoryTierConfig) -> Self {
        ConfigCell {
            count_limit: AtomicUsize::new(config.count_limit),
            cost_limit: AtomicU64::new(config.cost_limit),
            age_limit_secs: AtomicU64::new(config.age_limit.as_secs()),
            auto_trim_interval_ms: AtomicU64::new(config.auto_trim_interval.as_millis() as u64),
            remove_all_on_memory_warning: AtomicBool::new(config.remove_all_on_memory_warning),
            remove_all_on_entered_background: AtomicBool::new(
                config.remove_all_on_entered_background,
            ),
            release_asynchronously: AtomicBool::new(config.release_asynchronously),
            release_on_main_thread: AtomicBool::new(config.release_on_main_thread),
        }
    }
}

struct Shared<K, V> {
    map: TierLock<LruMap<K, V>>,
    config: ConfigCell,
    release_worker: ReleaseWorker,
    main_thread: parking_lot::RwLock<Option<MainThreadDispatcher>>,
    host_signals: parking_lot::RwLock<Option<Arc<dyn HostSignals>>>,
}

/// Bounded in-memory LRU tier. Cheap to clone (shares state via `Arc`).
pub struct MemoryTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for MemoryTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        MemoryTier {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> MemoryTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a tier with the given config and starts its background
    /// trimmer. The trimmer holds only a `Weak` reference, so it stops
    /// rescheduling on its own once every `MemoryTier` clone is dropped —
    /// there is no explicit cancellation handle (§5: "cancellation: none").
    pub fn new(config: MemoryTierConfig) -> Self {
        let shared = Arc::new(Shared {
            map: TierLock::new(LruMap::new()),
            config: ConfigCell::from(&config),
            release_worker: ReleaseWorker::new(),
            main_thread: parking_lot::RwLock::new(None),
            host_signals: parking_lot::RwLock::new(None),
        });

        spawn_trimmer(Arc::downgrade(&shared));

        MemoryTier { shared }
    }

    /// Installs a dispatcher used when `release_on_main_thread` is set.
    /// Without one, main-thread releases silently fall back to the
    /// background worker.
    pub fn set_main_thread_dispatcher(&self, dispatcher: MainThreadDispatcher) {
        *self.shared.main_thread.write() = Some(dispatcher);
    }

    /// Registers the user-provided hook invoked alongside this tier's own
    /// reaction to a host lifecycle signal.
    pub fn set_host_signals(&self, hook: Arc<dyn HostSignals>) {
        *self.shared.host_signals.write() = Some(hook);
    }

    pub fn set_count_limit(&self, limit: usize) {
        self.shared.config.count_limit.store(limit, Ordering::Relaxed);
    }

    pub fn set_cost_limit(&self, limit: u64) {
        self.shared.config.cost_limit.store(limit, Ordering::Relaxed);
    }

    pub fn set_age_limit(&self, limit: Duration) {
        self.shared
            .config
            .age_limit_secs
            .store(limit.as_secs(), Ordering::Relaxed);
    }

    pub fn set_auto_trim_interval(&self, interval: Duration) {
        self.shared
            .config
            .auto_trim_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> usize {
        self.shared.map.lock().count()
    }

    pub fn cost(&self) -> u64 {
        self.shared.map.lock().cost()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shared.map.lock().contains(key)
    }

    /// Returns the currently associated value, refreshing recency on hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut map = self.shared.map.lock();
        let idx = map.get_idx(key)?;
        map.move_to_head(idx);
        Some(map.node(idx).value.clone())
    }

    /// Inserts, replaces, or (with `value = None`) removes `key`.
    ///
    /// On insert, a count-over-limit immediately evicts the tail
    /// synchronously (hard-ish count bound); a cost-over-limit instead
    /// dispatches a single asynchronous cost-trim so the caller's
    /// operation doesn't pay for eviction it didn't cause.
    pub fn update(&self, key: K, value: Option<V>, cost: u64) {
        let value = match value {
            Some(v) => v,
            None => {
                self.remove(&key);
                return;
            }
        };

        let (over_count, over_cost) = {
            let mut map = self.shared.map.lock();
            if let Some(idx) = map.get_idx(&key) {
                map.replace_value(idx, value, cost);
                map.move_to_head(idx);
            } else {
                map.insert_at_head(key, value, cost);
            }
            (
                map.count() > self.shared.config.count_limit.load(Ordering::Relaxed),
                map.cost() > self.shared.config.cost_limit.load(Ordering::Relaxed),
            )
        };

        if over_count {
            self.evict_one_tail_sync();
        }
        if over_cost {
            self.dispatch_cost_trim();
        }
    }

    pub fn remove(&self, key: &K) {
        let node = {
            let mut map = self.shared.map.lock();
            match map.get_idx(key) {
                Some(idx) => Some(map.remove(idx)),
                None => None,
            }
        };
        if let Some(node) = node {
            self.release_nodes(vec![node]);
        }
    }

    pub fn remove_all(&self) {
        let drained = self.shared.map.lock().remove_all();
        self.release_nodes(drained);
    }

    /// Removes tail nodes until `count() <= target`.
    pub fn trim_to_count(&self, target: usize) {
        self.trim_while(move |map| map.count() > target);
    }

    /// Removes tail nodes until `cost() <= target`.
    pub fn trim_to_cost(&self, target: u64) {
        self.trim_while(move |map| map.cost() > target);
    }

    /// Removes every entry whose last access is older than `age`.
    pub fn trim_older_than(&self, age: Duration) {
        let cutoff = match std::time::Instant::now().checked_sub(age) {
            Some(c) => c,
            None => return,
        };
        self.trim_while(move |map| match map.tail_last_access() {
            Some(last_access) => last_access < cutoff,
            None => false,
        });
    }

    /// Drives a tail-eviction loop: while `should_evict` holds for the
    /// current tail, acquire the lock, evict one node, release the lock,
    /// repeat. Each iteration is its own bounded critical section so
    /// client operations can interleave between evictions (the
    /// try-locked trim-loop pattern).
    fn trim_while(&self, should_evict: impl Fn(&LruMap<K, V>) -> bool) {
        loop {
            let lock = self.shared.map.try_lock_for(TRIM_STEP_TIMEOUT);
            let mut map = match lock {
                Some(m) => m,
                None => continue,
            };
            if !should_evict(&map) {
                return;
            }
            let removed = map.remove_tail();
            drop(map);
            match removed {
                Some(node) => self.release_nodes(vec![node]),
                None => return,
            }
        }
    }

    fn evict_one_tail_sync(&self) {
        let removed = self.shared.map.lock().remove_tail();
        if let Some(node) = removed {
            self.release_nodes(vec![node]);
        }
    }

    fn dispatch_cost_trim(&self) {
        let tier = self.clone();
        self.shared.release_worker.dispatch(Box::new(move || {
            let target = tier.shared.config.cost_limit.load(Ordering::Relaxed);
            tier.trim_to_cost(target);
        }));
    }

    fn release_nodes(&self, nodes: Vec<Node<K, V>>) {
        if nodes.is_empty() {
            return;
        }
        let target = pick_target(
            self.shared.config.release_asynchronously.load(Ordering::Relaxed),
            self.shared.config.release_on_main_thread.load(Ordering::Relaxed),
        );
        match target {
            ReleaseTarget::Inline => drop(nodes),
            ReleaseTarget::Background => {
                self.shared.release_worker.dispatch(Box::new(move || drop(nodes)));
            }
            ReleaseTarget::MainThread => {
                let dispatcher = self.shared.main_thread.read().clone();
                match dispatcher {
                    Some(dispatch) => dispatch(Box::new(move || drop(nodes))),
                    None => self.shared.release_worker.dispatch(Box::new(move || drop(nodes))),
                }
            }
        }
    }
}

impl<K, V> MemoryTier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Call from the application's memory-warning hook.
    pub fn on_memory_warning(&self) {
        if self
            .shared
            .config
            .remove_all_on_memory_warning
            .load(Ordering::Relaxed)
        {
            tracing::debug!("memory warning received, clearing memory tier");
            self.remove_all();
        }
        if let Some(hook) = self.shared.host_signals.read().clone() {
            hook.memory_warning();
        }
    }

    /// Call from the application's background-entry hook.
    pub fn on_entered_background(&self) {
        if self
            .shared
            .config
            .remove_all_on_entered_background
            .load(Ordering::Relaxed)
        {
            tracing::debug!("entered background, clearing memory tier");
            self.remove_all();
        }
        if let Some(hook) = self.shared.host_signals.read().clone() {
            hook.entered_background();
        }
    }
}

fn spawn_trimmer<K, V>(weak: Weak<Shared<K, V>>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    std::thread::Builder::new()
        .name("kvcache-mem-trimmer".into())
        .spawn(move || loop {
            let shared = match weak.upgrade() {
                Some(shared) => shared,
                None => return,
            };
            let interval = Duration::from_millis(
                shared.config.auto_trim_interval_ms.load(Ordering::Relaxed),
            );
            drop(shared);
            std::thread::sleep(interval);

            let shared = match weak.upgrade() {
                Some(shared) => shared,
                None => return,
            };
            let tier = MemoryTier { shared };
            let cost_limit = tier.shared.config.cost_limit.load(Ordering::Relaxed);
            let count_limit = tier.shared.config.count_limit.load(Ordering::Relaxed);
            let age_limit_secs = tier.shared.config.age_limit_secs.load(Ordering::Relaxed);
            tier.trim_to_cost(cost_limit);
            tier.trim_to_count(count_limit);
            if age_limit_secs != u64::MAX {
                tier.trim_older_than(Duration::from_secs(age_limit_secs));
            }
        })
        .expect("spawn memory trimmer");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_and_get_roundtrip() {
        let tier: MemoryTier<String, i32> = MemoryTier::new(MemoryTierConfig::default());
        tier.update("a".to_string(), Some(1), 0);
        assert_eq!(tier.get(&"a".to_string()), Some(1));
        assert_eq!(tier.count(), 1);
    }

    #[test]
    fn update_with_none_removes() {
        let tier: MemoryTier<String, i32> = MemoryTier::new(MemoryTierConfig::default());
        tier.update("a".to_string(), Some(1), 0);
        tier.update("a".to_string(), None, 0);
        assert_eq!(tier.get(&"a".to_string()), None);
        assert_eq!(tier.count(), 0);
    }

    #[test]
    fn count_limit_evicts_synchronously() {
        let mut config = MemoryTierConfig::default();
        config.count_limit = 3;
        let tier: MemoryTier<String, i32> = MemoryTier::new(config);
        for i in 1..=4 {
            tier.update(i.to_string(), Some(i), 0);
        }
        assert_eq!(tier.count(), 3);
        assert_eq!(tier.get(&"1".to_string()), None);
        assert!(tier.get(&"2".to_string()).is_some());
        assert!(tier.get(&"4".to_string()).is_some());
    }

    #[test]
    fn get_refreshes_recency() {
        let mut config = MemoryTierConfig::default();
        config.count_limit = 2;
        let tier: MemoryTier<String, i32> = MemoryTier::new(config);
        tier.update("a".to_string(), Some(1), 0);
        tier.update("b".to_string(), Some(2), 0);
        // touch "a" so "b" becomes the eviction target
        tier.get(&"a".to_string());
        tier.update("c".to_string(), Some(3), 0);
        assert!(tier.get(&"a".to_string()).is_some());
        assert!(tier.get(&"b".to_string()).is_none());
    }

    #[test]
    fn remove_all_clears_state() {
        let tier: MemoryTier<String, i32> = MemoryTier::new(MemoryTierConfig::default());
        tier.update("a".to_string(), Some(1), 1);
        tier.update("b".to_string(), Some(2), 1);
        tier.remove_all();
        assert_eq!(tier.count(), 0);
        assert_eq!(tier.cost(), 0);
    }

    #[test]
    fn memory_warning_clears_by_default() {
        let tier: MemoryTier<String, i32> = MemoryTier::new(MemoryTierConfig::default());
        tier.update("a".to_string(), Some(1), 0);
        tier.on_memory_warning();
        assert_eq!(tier.count(), 0);
    }

    #[test]
    fn signal_hooks_invoke_registered_host_signals() {
        use std::sync::atomic::AtomicBool;

        struct Flags {
            memory_warning: AtomicBool,
            entered_background: AtomicBool,
        }
        impl HostSignals for Flags {
            fn memory_warning(&self) {
                self.memory_warning.store(true, Ordering::SeqCst);
            }
            fn entered_background(&self) {
                self.entered_background.store(true, Ordering::SeqCst);
            }
        }

        let tier: MemoryTier<String, i32> = MemoryTier::new(MemoryTierConfig::default());
        let flags = Arc::new(Flags {
            memory_warning: AtomicBool::new(false),
            entered_background: AtomicBool::new(false),
        });
        tier.set_host_signals(flags.clone());

        tier.on_memory_warning();
        assert!(flags.memory_warning.load(Ordering::SeqCst));
        assert!(!flags.entered_background.load(Ordering::SeqCst));

        tier.on_entered_background();
        assert!(flags.entered_background.load(Ordering::SeqCst));
    }
}
