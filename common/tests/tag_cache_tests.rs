/// Tag LRU Cache Tests
///
/// Verifies MRU promotion on get, MRU insertion on set, and deterministic
/// LRU eviction at capacity.
use common::{TagCache, DEFAULT_TAG_CACHE_CAPACITY};

#[test]
fn test_default_capacity() {
    assert_eq!(DEFAULT_TAG_CACHE_CAPACITY, 100);
}

#[test]
fn test_get_miss_returns_none() {
    let mut cache: TagCache<u32> = TagCache::new(4);
    assert_eq!(cache.get("missing"), None);
    assert!(cache.is_empty());
}

#[test]
fn test_set_then_get() {
    let mut cache: TagCache<u32> = TagCache::new(4);
    cache.set("web", 1);
    cache.set("api", 2);

    assert_eq!(cache.get("web"), Some(1));
    assert_eq!(cache.get("api"), Some(2));
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_eviction_order_without_gets() {
    // Insert-only workload: eviction follows insertion order.
    let mut cache: TagCache<u32> = TagCache::new(3);
    cache.set("a", 1);
    cache.set("b", 2);
    cache.set("c", 3);
    cache.set("d", 4); // evicts "a"

    assert_eq!(cache.get("a"), None);
    assert_eq!(cache.get("b"), Some(2));
    assert_eq!(cache.get("c"), Some(3));
    assert_eq!(cache.get("d"), Some(4));
    assert_eq!(cache.len(), 3);
}

#[test]
fn test_get_promotes_to_mru() {
    let mut cache: TagCache<u32> = TagCache::new(3);
    cache.set("a", 1);
    cache.set("b", 2);
    cache.set("c", 3);

    // Touch "a"; "b" becomes LRU and is evicted next.
    assert_eq!(cache.get("a"), Some(1));
    cache.set("d", 4);

    assert_eq!(cache.get("b"), None);
    assert_eq!(cache.get("a"), Some(1));
    assert_eq!(cache.get("c"), Some(3));
    assert_eq!(cache.get("d"), Some(4));
}

#[test]
fn test_mru_ordering_for_any_small_capacity() {
    // For capacities 1..=8, replay the same access sequence and check the
    // cache against a straightforward reference model.
    let accesses = [
        ("set", "a"),
        ("set", "b"),
        ("get", "a"),
        ("set", "c"),
        ("set", "d"),
        ("get", "b"),
        ("set", "e"),
        ("get", "a"),
        ("set", "f"),
    ];

    for capacity in 1..=8usize {
        let mut cache: TagCache<&str> = TagCache::new(capacity);
        // Reference model: Vec ordered LRU-first.
        let mut model: Vec<&str> = Vec::new();

        for (op, key) in accesses {
            match op {
                "set" => {
                    if let Some(pos) = model.iter().position(|k| *k == key) {
                        model.remove(pos);
                    } else if model.len() >= capacity {
                        model.remove(0);
                    }
                    model.push(key);
                    cache.set(key, key);
                }
                _ => {
                    let hit = cache.get(key).is_some();
                    let model_hit = model.iter().any(|k| *k == key);
                    assert_eq!(hit, model_hit, "capacity {capacity}, key {key}");
                    if model_hit {
                        let pos = model.iter().position(|k| *k == key).unwrap();
                        let k = model.remove(pos);
                        model.push(k);
                    }
                }
            }
        }

        let got: Vec<&str> = cache.keys().iter().map(String::as_str).collect();
        assert_eq!(got, model, "capacity {capacity}");
    }
}

#[test]
fn test_capacity_one() {
    let mut cache: TagCache<u32> = TagCache::new(1);
    cache.set("a", 1);
    cache.set("b", 2);

    assert_eq!(cache.get("a"), None);
    assert_eq!(cache.get("b"), Some(2));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_clear() {
    let mut cache: TagCache<u32> = TagCache::new(4);
    cache.set("a", 1);
    cache.set("b", 2);
    cache.clear();

    assert!(cache.is_empty());
    assert_eq!(cache.get("a"), None);
    assert_eq!(cache.capacity(), 4);
}
