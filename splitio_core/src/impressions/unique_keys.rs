//! Unique-keys tracker used in none mode: per feature, the set of matching
//! keys seen in the current window.
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

const DEFAULT_MAX_TRACKED_KEYS: usize = 30_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKeysPerFeature {
    pub feature: String,
    pub keys: Vec<String>,
}

pub struct UniqueKeysTracker {
    max_tracked: usize,
    keys: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for UniqueKeysTracker {
    fn default() -> UniqueKeysTracker {
        UniqueKeysTracker::new(DEFAULT_MAX_TRACKED_KEYS)
    }
}

impl UniqueKeysTracker {
    pub fn new(max_tracked: usize) -> UniqueKeysTracker {
        UniqueKeysTracker {
            max_tracked: max_tracked.max(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Track a (key, feature) sighting. Returns true when the tracker is at
    /// capacity and should be flushed ahead of schedule.
    pub fn track(&self, matching_key: &str, feature: &str) -> bool {
        let mut keys = self
            .keys
            .lock()
            .expect("thread holding unique-keys lock should not panic");
        keys.entry(feature.to_owned())
            .or_default()
            .insert(matching_key.to_owned());
        keys.values().map(HashSet::len).sum::<usize>() >= self.max_tracked
    }

    pub fn pop_all(&self) -> Vec<UniqueKeysPerFeature> {
        let mut keys = self
            .keys
            .lock()
            .expect("thread holding unique-keys lock should not panic");
        keys.drain()
            .map(|(feature, keys)| UniqueKeysPerFeature {
                feature,
                keys: keys.into_iter().collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_unique_keys_per_feature() {
        let tracker = UniqueKeysTracker::new(100);
        tracker.track("alice", "f");
        tracker.track("alice", "f");
        tracker.track("bob", "f");
        tracker.track("alice", "g");

        let mut flushed = tracker.pop_all();
        flushed.sort_by(|a, b| a.feature.cmp(&b.feature));
        flushed.iter_mut().for_each(|entry| entry.keys.sort());

        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].feature, "f");
        assert_eq!(flushed[0].keys, vec!["alice", "bob"]);
        assert_eq!(flushed[1].feature, "g");
        assert_eq!(flushed[1].keys, vec!["alice"]);

        assert!(tracker.pop_all().is_empty());
    }

    #[test]
    fn reports_when_full() {
        let tracker = UniqueKeysTracker::new(2);
        assert!(!tracker.track("alice", "f"));
        assert!(tracker.track("bob", "f"));
    }
}
