//! Impression observer: remembers when a (feature, key, treatment,
//! change-number) tuple was last emitted so duplicates can carry their
//! previous emission time.
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use super::Impression;

const DEFAULT_CACHE_SIZE: usize = 500_000;

pub struct ImpressionObserver {
    cache: Mutex<LruCache<u64, i64>>,
}

impl Default for ImpressionObserver {
    fn default() -> ImpressionObserver {
        ImpressionObserver::new(DEFAULT_CACHE_SIZE)
    }
}

impl ImpressionObserver {
    pub fn new(capacity: usize) -> ImpressionObserver {
        let capacity = NonZeroUsize::new(capacity.max(1))
            .expect("capacity is clamped to at least one entry");
        ImpressionObserver {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record the impression's time under its identity hash and return a copy
    /// with `previous_time` set to the last recorded time, if any.
    pub fn test_and_set(&self, impression: Impression) -> Impression {
        let hash = impression_hash(&impression);
        let previous_time = self
            .cache
            .lock()
            .expect("thread holding observer lock should not panic")
            .put(hash, impression.time);
        Impression {
            previous_time,
            ..impression
        }
    }
}

/// Hash the identity-relevant fields of an impression. murmur3 x64-128,
/// truncated to 64 bits, over the same string layout every SDK uses.
fn impression_hash(impression: &Impression) -> u64 {
    let identity = format!(
        "{}:{}:{}:{}:{}",
        impression.matching_key,
        impression.feature_name,
        impression.treatment,
        impression.label,
        impression.change_number,
    );
    let hash = murmur3::murmur3_x64_128(&mut Cursor::new(identity.as_bytes()), 0)
        .expect("reading from an in-memory cursor cannot fail");
    hash as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impression(key: &str, feature: &str, time: i64) -> Impression {
        Impression {
            feature_name: feature.to_owned(),
            matching_key: key.to_owned(),
            bucketing_key: None,
            treatment: "on".to_owned(),
            label: "default rule".to_owned(),
            change_number: 123,
            time,
            previous_time: None,
        }
    }

    #[test]
    fn first_sighting_has_no_previous_time() {
        let observer = ImpressionObserver::new(100);
        let result = observer.test_and_set(impression("alice", "f", 1000));
        assert_eq!(result.previous_time, None);
    }

    #[test]
    fn duplicates_carry_the_previous_emission_time() {
        let observer = ImpressionObserver::new(100);
        observer.test_and_set(impression("alice", "f", 1000));
        let second = observer.test_and_set(impression("alice", "f", 2000));
        assert_eq!(second.previous_time, Some(1000));
        let third = observer.test_and_set(impression("alice", "f", 3000));
        assert_eq!(third.previous_time, Some(2000));
    }

    #[test]
    fn different_identities_do_not_collide() {
        let observer = ImpressionObserver::new(100);
        observer.test_and_set(impression("alice", "f", 1000));
        let other_key = observer.test_and_set(impression("bob", "f", 2000));
        assert_eq!(other_key.previous_time, None);
        let other_feature = observer.test_and_set(impression("alice", "g", 2000));
        assert_eq!(other_feature.previous_time, None);
    }

    #[test]
    fn eviction_forgets_old_entries() {
        let observer = ImpressionObserver::new(2);
        observer.test_and_set(impression("a", "f", 1));
        observer.test_and_set(impression("b", "f", 2));
        observer.test_and_set(impression("c", "f", 3));
        // "a" was evicted, so it reads as new again.
        let again = observer.test_and_set(impression("a", "f", 4));
        assert_eq!(again.previous_time, None);
    }
}
