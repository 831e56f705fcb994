use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kvcache::Cache;
use kvcache_memory::MemoryTierConfig;

#[test]
fn basic_set_is_visible_in_memory_disk_and_facade() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open_path(&dir.path().join("T1")).unwrap();
    cache.set("a", Bytes::from_static(b"hello"));

    assert_eq!(cache.memory().get(&"a".to_string()), Some(Bytes::from_static(b"hello")));
    assert_eq!(cache.disk().get("a"), Some(b"hello".to_vec()));
    assert_eq!(cache.get("a"), Some(Bytes::from_static(b"hello")));
}

#[test]
fn disk_only_read_through_survives_a_simulated_restart() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("T2");
    let payload = vec![9u8; 10 * 1024];
    {
        let cache = Cache::open_path(&root).unwrap();
        cache.set("k", Bytes::from(payload.clone()));
    }

    let cache2 = Cache::open_path(&root).unwrap();
    assert!(!cache2.memory().contains(&"k".to_string()));
    assert_eq!(cache2.get("k"), Some(Bytes::from(payload)));
    assert!(cache2.memory().contains(&"k".to_string()));
}

#[test]
fn set_remove_get_is_absent_in_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open_path(&dir.path().join("T3")).unwrap();
    cache.set("a", Bytes::from_static(b"hello"));
    cache.remove("a");
    assert!(cache.get("a").is_none());
}

#[test]
fn lru_eviction_in_memory_tier_keeps_most_recent_keys() {
    use kvcache_memory::MemoryTier;

    let tier: MemoryTier<String, i32> = MemoryTier::new(MemoryTierConfig {
        count_limit: 3,
        ..MemoryTierConfig::default()
    });

    for key in ["1", "2", "3", "4"] {
        tier.update(key.to_string(), Some(0), 0);
    }

    assert_eq!(tier.count(), 3);
    assert!(!tier.contains(&"1".to_string()));
    for key in ["2", "3", "4"] {
        assert!(tier.contains(&key.to_string()));
    }
}

#[test]
fn age_trim_on_disk_tier_expires_stale_entries() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open_path(&dir.path().join("T4")).unwrap();
    cache.set("k", Bytes::from_static(b"v"));

    std::thread::sleep(Duration::from_secs(2));
    cache.disk().trim_older_than(Duration::from_secs(1));

    assert!(cache.disk().get("k").is_none());
}

#[test]
fn concurrent_set_get_remove_does_not_deadlock() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(Cache::open_path(&dir.path().join("T5")).unwrap());
    cache.disk().set_count_limit(50);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let mut rng_state = 0x1234_5678u64.wrapping_add(t as u64);
                while std::time::Instant::now() < deadline {
                    rng_state ^= rng_state << 13;
                    rng_state ^= rng_state >> 7;
                    rng_state ^= rng_state << 17;
                    let key = format!("key-{}", rng_state % 1000);
                    match rng_state % 3 {
                        0 => {
                            cache.set(&key, Bytes::from_static(b"v"));
                        }
                        1 => {
                            cache.get(&key);
                        }
                        _ => {
                            cache.remove(&key);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
